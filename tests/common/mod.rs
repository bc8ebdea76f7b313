#![allow(dead_code)]

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use miio::protocol::{build, parse};
use miio::transport::TokenCipher;
use miio::{
    Connectivity, DeviceId, HELLO_PACKET, PendingCommand, SessionConfig, SessionListener,
};
use serde_json::{Value, json};

pub const TOKEN_HEX: &str = "0102030405060708090a0b0c0d0e0f10";
pub const TOKEN: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
];
pub const DEVICE: u32 = 0x04a1_b2c3;
pub const DEVICE_CLOCK: u32 = 1_000_000;

/// What the fake device does with a decrypted request.
pub enum Reply {
    Json(Value),
    Plain(Vec<u8>),
    BadChecksum(Value),
    /// Bytes placed in the payload as-is, with a valid checksum.
    Ciphertext(Vec<u8>),
    /// A decoy reply from another socket, then the real one.
    AfterStray { stray: Value, reply: Value },
    Silent,
}

type Handler = Arc<dyn Fn(&Value) -> Reply + Send + Sync>;

/// A request as seen by the device.
#[derive(Debug, Clone)]
pub struct Received {
    pub device_id: DeviceId,
    pub request: Value,
}

/// In-process UDP device speaking the Mi IO protocol.
pub struct FakeDevice {
    pub addr: SocketAddr,
    online: Arc<AtomicBool>,
    hellos: Arc<AtomicUsize>,
    hellos_seen: Arc<AtomicUsize>,
    ignore_hellos: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Received>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub fn echo_result(request: &Value) -> Reply {
    Reply::Json(json!({"id": request["id"], "result": ["ok"]}))
}

impl FakeDevice {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Value) -> Reply + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(10)))
            .unwrap();
        let addr = socket.local_addr().unwrap();

        let online = Arc::new(AtomicBool::new(true));
        let hellos = Arc::new(AtomicUsize::new(0));
        let hellos_seen = Arc::new(AtomicUsize::new(0));
        let ignore_hellos = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let handler: Handler = Arc::new(handler);

        let handle = {
            let online = Arc::clone(&online);
            let hellos = HelloCounters {
                answered: Arc::clone(&hellos),
                seen: Arc::clone(&hellos_seen),
                ignore: Arc::clone(&ignore_hellos),
            };
            let received = Arc::clone(&received);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                serve(&socket, &handler, &online, &hellos, &received, &stop);
            })
        };

        Self {
            addr,
            online,
            hellos,
            hellos_seen,
            ignore_hellos,
            received,
            stop,
            handle: Some(handle),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Hellos answered.
    pub fn hellos(&self) -> usize {
        self.hellos.load(Ordering::SeqCst)
    }

    /// Hellos received, answered or not.
    pub fn hellos_seen(&self) -> usize {
        self.hellos_seen.load(Ordering::SeqCst)
    }

    /// Leave the next `count` hellos unanswered.
    pub fn ignore_hellos(&self, count: usize) {
        self.ignore_hellos.store(count, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.addr.ip().to_string(), TOKEN_HEX)
            .with_port(self.addr.port())
            .with_timeout(Duration::from_millis(150));
        config.handshake_attempts = 1;
        config
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct HelloCounters {
    answered: Arc<AtomicUsize>,
    seen: Arc<AtomicUsize>,
    ignore: Arc<AtomicUsize>,
}

impl HelloCounters {
    /// Count a hello and decide whether to answer it.
    fn admit(&self, online: bool) -> bool {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if !online {
            return false;
        }
        let skipped = self
            .ignore
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if skipped {
            return false;
        }
        self.answered.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn serve(
    socket: &UdpSocket,
    handler: &Handler,
    online: &AtomicBool,
    hellos: &HelloCounters,
    received: &Mutex<Vec<Received>>,
    stop: &AtomicBool,
) {
    let cipher = TokenCipher::new(&TOKEN);
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        let Ok((len, from)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let datagram = &buf[..len];

        if datagram == HELLO_PACKET.as_slice() {
            if hellos.admit(online.load(Ordering::SeqCst)) {
                let reply = build(&[], &TOKEN, DeviceId::from(DEVICE), DEVICE_CLOCK);
                let _ = socket.send_to(&reply, from);
            }
            continue;
        }

        let packet = parse(datagram);
        let Ok(plaintext) = cipher.decrypt(packet.payload()) else {
            continue;
        };
        let Ok(request) = serde_json::from_slice::<Value>(&plaintext) else {
            continue;
        };
        received.lock().unwrap().push(Received {
            device_id: packet.device_id(),
            request: request.clone(),
        });
        if !online.load(Ordering::SeqCst) {
            continue;
        }

        let reply = match handler(&request) {
            Reply::Json(value) => sealed(&cipher, value.to_string().as_bytes()),
            Reply::Plain(bytes) => sealed(&cipher, &bytes),
            Reply::BadChecksum(value) => {
                let mut datagram = sealed(&cipher, value.to_string().as_bytes());
                datagram[20] ^= 0xff;
                datagram
            }
            Reply::Ciphertext(bytes) => build(&bytes, &TOKEN, DeviceId::from(DEVICE), DEVICE_CLOCK),
            Reply::AfterStray { stray, reply } => {
                let decoy = UdpSocket::bind("127.0.0.1:0").unwrap();
                let _ = decoy.send_to(&sealed(&cipher, stray.to_string().as_bytes()), from);
                thread::sleep(Duration::from_millis(20));
                sealed(&cipher, reply.to_string().as_bytes())
            }
            Reply::Silent => continue,
        };
        let _ = socket.send_to(&reply, from);
    }
}

fn sealed(cipher: &TokenCipher, plaintext: &[u8]) -> Vec<u8> {
    build(
        &cipher.encrypt(plaintext),
        &TOKEN,
        DeviceId::from(DEVICE),
        DEVICE_CLOCK + 5,
    )
}

/// Listener that records everything and lets tests block on results.
#[derive(Default)]
pub struct Recorder {
    results: Mutex<Vec<PendingCommand>>,
    statuses: Mutex<Vec<Connectivity>>,
    signal: Condvar,
}

impl Recorder {
    pub fn wait_for_results(&self, count: usize, timeout: Duration) -> Vec<PendingCommand> {
        let deadline = Instant::now() + timeout;
        let mut results = self.results.lock().unwrap();
        while results.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(
                !remaining.is_zero(),
                "timed out waiting for {count} results, got {}",
                results.len()
            );
            results = self.signal.wait_timeout(results, remaining).unwrap().0;
        }
        results.clone()
    }

    pub fn statuses(&self) -> Vec<Connectivity> {
        self.statuses.lock().unwrap().clone()
    }
}

impl SessionListener for Recorder {
    fn on_result(&self, command: &PendingCommand) {
        self.results.lock().unwrap().push(command.clone());
        self.signal.notify_all();
    }

    fn on_connectivity_change(&self, status: Connectivity) {
        self.statuses.lock().unwrap().push(status);
    }
}

/// Register a fresh recorder; keep both handles alive for the test's duration.
pub fn recorder() -> (Arc<Recorder>, Arc<dyn SessionListener>) {
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn SessionListener> = recorder.clone();
    (recorder, listener)
}
