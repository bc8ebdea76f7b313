//! Mi IO session engine: command queue, dispatch worker, handshake and
//! connectivity tracking.
//!
//! Producers append to a FIFO queue from any thread. A single dispatch worker
//! pops one command at a time, runs the handshake when needed, and performs
//! the encrypted request/reply exchange while holding the socket lock, so two
//! datagram exchanges never overlap. Results and connectivity changes are
//! fanned out to weakly held listeners on the worker thread.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, info, info_span, instrument, trace, warn};

use crate::protocol::metrics::{FailureKind, Metrics};
use crate::protocol::{
    CommandError, DeviceId, Error, HEADER_SIZE, HELLO_PACKET, Method, Packet, PendingCommand,
    Result, build, parse, parse_command_line,
};

use super::config::SessionConfig;
use super::crypto::TokenCipher;
use super::listener::{Connectivity, SessionListener};
use super::socket::SocketBinding;
use super::token::Token;

/// Send the discovery datagram once and wait for a reply.
///
/// Works against a unicast or broadcast address; the first reply wins.
#[instrument(level = "debug")]
pub fn ping(addr: SocketAddr, timeout: Duration) -> Result<Packet> {
    let socket = SocketBinding::ephemeral_for(addr)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.send_to(&HELLO_PACKET, addr)?;

    let mut buf = [0u8; 2048];
    let (len, from) = socket.recv_from(&mut buf).map_err(|err| {
        if err.is_timeout() {
            Error::NoResponse
        } else {
            err.into()
        }
    })?;
    if len < HEADER_SIZE {
        return Err(Error::MalformedPacket { len });
    }

    let packet = parse(&buf[..len]);
    debug!(%from, device = %packet.device_id(), "ping reply");
    Ok(packet)
}

/// Handle owned by the collaborator driving one device.
///
/// Dropping the session closes it.
#[derive(Debug)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    addr: SocketAddr,
    token: Token,
    cipher: TokenCipher,
    timeout: Duration,
    max_errors: u32,
    max_id: u32,
    handshake_attempts: u32,
    buffer_size: usize,
    queue: Mutex<Queue>,
    wakeup: Condvar,
    state: Mutex<State>,
    listeners: Mutex<Vec<Weak<dyn SessionListener>>>,
    link: Mutex<Option<SocketBinding>>,
}

#[derive(Debug)]
struct Queue {
    pending: VecDeque<PendingCommand>,
    in_flight: Option<u32>,
    last_id: u32,
    open: bool,
    epoch: u64,
}

#[derive(Debug)]
struct State {
    device_id: Option<DeviceId>,
    clock_delta: i64,
    consecutive_errors: u32,
    connectivity: Connectivity,
    needs_handshake: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn local_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}

/// Local clock shifted onto the device clock, truncated to the 32-bit header field.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn device_timestamp(clock_delta: i64) -> u32 {
    local_seconds().wrapping_add(clock_delta) as u32
}

fn clock_delta_from(device_seconds: u32) -> i64 {
    i64::from(device_seconds) - local_seconds()
}

/// Decode a decrypted reply. Devices pad with NULs and some firmware emits `,,`.
fn decode_reply(plaintext: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(plaintext);
    let text = text.trim_end_matches('\0').replace(",,", ",");
    match serde_json::from_str::<Value>(&text) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::ConfigurationInvalid("host is empty".into()));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|err| Error::ConfigurationInvalid(format!("host {host}: {err}")))?
        .next()
        .ok_or_else(|| Error::ConfigurationInvalid(format!("host {host} has no address")))
}

impl Queue {
    /// Next id after `last_id`, wrapping to 1 past `max_id` and skipping ids
    /// still queued or in flight.
    fn allocate_id(&mut self, max_id: u32) -> u32 {
        let max_id = max_id.max(1);
        let mut candidate = self.last_id;
        for _ in 0..max_id {
            candidate = if candidate >= max_id { 1 } else { candidate + 1 };
            if !self.is_taken(candidate) {
                break;
            }
        }
        self.last_id = candidate;
        candidate
    }

    fn is_taken(&self, id: u32) -> bool {
        self.in_flight == Some(id) || self.pending.iter().any(|command| command.id() == id)
    }
}

impl Session {
    /// Validate the configuration, bind a socket and start the dispatch worker.
    ///
    /// No datagram is sent here; the first command triggers the handshake.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let token = Token::parse(&config.token, &config.denylist)?;
        let device_id = config
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::parse::<DeviceId>)
            .transpose()?;
        if config.timeout.is_zero() {
            return Err(Error::ConfigurationInvalid("timeout must be positive".into()));
        }
        let addr = resolve_addr(&config.host, config.port)?;

        let inner = Arc::new(Inner {
            addr,
            cipher: TokenCipher::new(token.as_bytes()),
            token,
            timeout: config.timeout,
            max_errors: config.max_errors,
            max_id: config.max_id,
            handshake_attempts: config.handshake_attempts.max(1),
            buffer_size: config.buffer_size.max(HEADER_SIZE),
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                in_flight: None,
                last_id: config.initial_id,
                open: false,
                epoch: 0,
            }),
            wakeup: Condvar::new(),
            state: Mutex::new(State {
                device_id,
                clock_delta: 0,
                consecutive_errors: 0,
                connectivity: Connectivity::Disconnected,
                needs_handshake: true,
            }),
            listeners: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        });
        *lock(&inner.link) = Some(inner.bind_socket()?);
        Metrics::record_session_open();

        let session = Self { inner };
        session.start()?;
        info!(addr = %session.inner.addr, device = ?device_id, "session opened");
        Ok(session)
    }

    fn start(&self) -> Result<()> {
        let epoch = {
            let mut queue = lock(&self.inner.queue);
            if queue.open {
                return Ok(());
            }
            queue.open = true;
            queue.epoch += 1;
            queue.epoch
        };
        lock(&self.inner.state).needs_handshake = true;

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("miio-dispatch".into())
            .spawn(move || inner.run(epoch));
        if let Err(err) = spawned {
            lock(&self.inner.queue).open = false;
            return Err(err.into());
        }
        Ok(())
    }

    /// Queue a JSON-RPC call and return its id.
    ///
    /// Returns immediately; the outcome reaches listeners through
    /// [`SessionListener::on_result`]. Returns `0` and queues nothing when the
    /// session is closed.
    pub fn enqueue(&self, method: &str, params: Value) -> u32 {
        let id = {
            let mut queue = lock(&self.inner.queue);
            if !queue.open {
                debug!(method, "enqueue on closed session");
                return 0;
            }
            let id = queue.allocate_id(self.inner.max_id);
            queue
                .pending
                .push_back(PendingCommand::new(id, method, params));
            id
        };
        self.inner.wakeup.notify_all();
        debug!(id, method, "command queued");
        id
    }

    /// Queue a call to a catalogue method.
    pub fn enqueue_known(&self, method: Method, params: Value) -> u32 {
        self.enqueue(method.as_str(), params)
    }

    /// Queue a call written as `method[params]`, see [`parse_command_line`].
    pub fn enqueue_line(&self, line: &str) -> Result<u32> {
        let (method, params) = parse_command_line(line)?;
        match self.enqueue(&method, params) {
            0 => Err(Error::Closed),
            id => Ok(id),
        }
    }

    /// Number of commands waiting for the worker.
    #[must_use]
    pub fn queue_length(&self) -> usize {
        lock(&self.inner.queue).pending.len()
    }

    /// Add a listener; it is held weakly.
    ///
    /// Registering on a closed session reopens it, and the next command is
    /// preceded by a handshake.
    pub fn register_listener(&self, listener: &Arc<dyn SessionListener>) {
        {
            let mut listeners = lock(&self.inner.listeners);
            listeners.retain(|weak| weak.strong_count() > 0);
            let candidate = Arc::downgrade(listener);
            if !listeners.iter().any(|weak| Weak::ptr_eq(weak, &candidate)) {
                listeners.push(candidate);
            }
        }
        lock(&self.inner.state).needs_handshake = true;

        if let Err(err) = self.start() {
            warn!(error = %err, "failed to restart dispatch worker");
        }
    }

    /// Remove a listener. Removing the last one clears the queue and closes
    /// the session.
    pub fn unregister_listener(&self, listener: &Arc<dyn SessionListener>) {
        let target = Arc::downgrade(listener);
        let now_empty = {
            let mut listeners = lock(&self.inner.listeners);
            listeners.retain(|weak| weak.strong_count() > 0 && !Weak::ptr_eq(weak, &target));
            listeners.is_empty()
        };
        if now_empty {
            debug!("last listener removed");
            self.close();
        }
    }

    /// Run the discovery handshake now.
    ///
    /// Serialised with the dispatch worker's exchanges.
    pub fn handshake(&self) -> Result<Packet> {
        self.inner.handshake()
    }

    /// Stop the worker and release the socket. Queued commands are dropped.
    ///
    /// An exchange already on the wire finishes or times out on its own.
    pub fn close(&self) {
        let dropped = {
            let mut queue = lock(&self.inner.queue);
            if !queue.open {
                return;
            }
            queue.open = false;
            let dropped = queue.pending.len();
            queue.pending.clear();
            dropped
        };
        self.inner.wakeup.notify_all();
        if let Ok(mut link) = self.inner.link.try_lock() {
            *link = None;
        }
        info!(addr = %self.inner.addr, dropped, "session closed");
    }

    /// Whether the worker is accepting commands.
    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.inner.queue).open
    }

    /// Current connectivity.
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        lock(&self.inner.state).connectivity
    }

    /// Device id, configured or learned from the handshake.
    #[must_use]
    pub fn device_id(&self) -> Option<DeviceId> {
        lock(&self.inner.state).device_id
    }

    /// Device clock minus local clock, in seconds.
    #[must_use]
    pub fn clock_delta(&self) -> i64 {
        lock(&self.inner.state).clock_delta
    }

    /// Timeouts since the last successful exchange.
    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        lock(&self.inner.state).consecutive_errors
    }

    /// Last id handed out; feed it to [`SessionConfig::initial_id`] when reopening.
    #[must_use]
    pub fn last_id(&self) -> u32 {
        lock(&self.inner.queue).last_id
    }

    /// Device address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.addr
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn bind_socket(&self) -> Result<SocketBinding> {
        let socket = SocketBinding::ephemeral_for(self.addr)?;
        socket.set_read_timeout(Some(self.timeout))?;
        Ok(socket)
    }

    fn is_open(&self) -> bool {
        lock(&self.queue).open
    }

    fn run(self: Arc<Self>, epoch: u64) {
        let span = info_span!("miio_dispatch", addr = %self.addr, epoch);
        let _guard = span.enter();
        debug!("dispatch worker started");

        while let Some(mut command) = self.next_command(epoch) {
            self.dispatch(&mut command);
            {
                let mut queue = lock(&self.queue);
                if queue.in_flight == Some(command.id()) {
                    queue.in_flight = None;
                }
            }
            self.notify_result(&command);
        }

        self.release_link(epoch);
        debug!("dispatch worker stopped");
    }

    fn next_command(&self, epoch: u64) -> Option<PendingCommand> {
        let mut queue = lock(&self.queue);
        loop {
            if !queue.open || queue.epoch != epoch {
                return None;
            }
            if let Some(command) = queue.pending.pop_front() {
                queue.in_flight = Some(command.id());
                return Some(command);
            }
            queue = self
                .wakeup
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release_link(&self, epoch: u64) {
        let stale = {
            let queue = lock(&self.queue);
            !queue.open && queue.epoch == epoch
        };
        if stale {
            *lock(&self.link) = None;
        }
    }

    fn dispatch(&self, command: &mut PendingCommand) {
        let needs_handshake = lock(&self.state).needs_handshake;
        if needs_handshake
            && self.handshake().is_err()
            && lock(&self.state).device_id.is_none()
        {
            debug!(id = command.id(), "device unreachable; command not sent");
            Metrics::record_failure(FailureKind::Command);
            command.resolve(Err(CommandError::NoResponse));
            return;
        }

        let outcome = self.exchange(command);
        if let Err(err) = &outcome {
            debug!(id = command.id(), error = %err, "command failed");
            Metrics::record_failure(FailureKind::Command);
        }
        command.resolve(outcome);
    }

    #[instrument(level = "debug", skip(self, command), fields(id = command.id(), method = command.method()))]
    fn exchange(&self, command: &PendingCommand) -> std::result::Result<Value, CommandError> {
        let (device_id, clock_delta) = {
            let state = lock(&self.state);
            (state.device_id.unwrap_or_default(), state.clock_delta)
        };
        let request = command.to_request().to_string();
        let ciphertext = self.cipher.encrypt(request.as_bytes());
        let datagram = build(
            &ciphertext,
            self.token.as_bytes(),
            device_id,
            device_timestamp(clock_delta),
        );

        Metrics::record_command_sent();
        let started = Instant::now();
        let Some(reply) = self.transact(&datagram)? else {
            self.on_timeout();
            return Err(CommandError::NoResponse);
        };
        Metrics::record_reply(started.elapsed());

        let packet = parse(&reply);
        trace!(packet = %packet.to_spaced_hex(), "reply");
        if !packet.verify_checksum(self.token.as_bytes()) {
            warn!(%packet, "reply has invalid checksum");
            Metrics::record_failure(FailureKind::Checksum);
            return Err(CommandError::InvalidChecksum);
        }

        let plaintext = self.cipher.decrypt(packet.payload())?;
        let response = decode_reply(&plaintext).ok_or(CommandError::NotJson)?;
        self.on_success(&packet);
        Ok(response)
    }

    /// One send/receive pair under the socket lock. `Ok(None)` means no usable reply.
    fn transact(&self, datagram: &[u8]) -> std::result::Result<Option<Vec<u8>>, CommandError> {
        let mut link = lock(&self.link);
        if link.is_none() {
            if !self.is_open() {
                return Err(CommandError::Closed);
            }
            let socket = self
                .bind_socket()
                .map_err(|err| CommandError::Transport(err.to_string()))?;
            *link = Some(socket);
        }
        let Some(socket) = link.as_ref() else {
            return Err(CommandError::Closed);
        };

        let mut buf = vec![0u8; self.buffer_size];
        match socket.drain(&mut buf) {
            Ok(0) => {}
            Ok(dropped) => debug!(dropped, "discarded stale datagrams"),
            Err(err) => debug!(error = %err, "failed to drain socket"),
        }

        socket
            .send_to(datagram, self.addr)
            .map_err(|err| CommandError::Transport(err.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            socket
                .set_read_timeout(Some(remaining))
                .map_err(|err| CommandError::Transport(err.to_string()))?;
            match socket.recv_from(&mut buf) {
                Ok((len, from)) if !self.accepts_from(from) => {
                    debug!(len, %from, "ignoring datagram from unexpected peer");
                }
                Ok((len, from)) if len < HEADER_SIZE => {
                    debug!(len, %from, "reply shorter than a header");
                    return Ok(None);
                }
                Ok((len, from)) => {
                    trace!(len, %from, "datagram received");
                    buf.truncate(len);
                    return Ok(Some(buf));
                }
                Err(err) if err.is_timeout() => return Ok(None),
                Err(err) => return Err(CommandError::Transport(err.to_string())),
            }
        }
    }

    /// Replies must come from the device, unless it was addressed by broadcast.
    fn accepts_from(&self, from: SocketAddr) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) if ip.is_broadcast() || ip.octets()[3] == 255 => true,
            _ => from == self.addr,
        }
    }

    #[instrument(level = "debug", skip(self), fields(addr = %self.addr))]
    fn handshake(&self) -> Result<Packet> {
        for attempt in 1..=self.handshake_attempts {
            match self.transact(&HELLO_PACKET) {
                Ok(Some(reply)) => {
                    let packet = parse(&reply);
                    if !packet.has_valid_magic() {
                        debug!(attempt, "handshake reply has wrong magic");
                        continue;
                    }
                    Metrics::record_handshake(true);
                    let escalated = {
                        let mut state = lock(&self.state);
                        if state.device_id.is_none() {
                            info!(device = %packet.device_id(), "learned device id");
                            state.device_id = Some(packet.device_id());
                        }
                        state.clock_delta = clock_delta_from(packet.timestamp());
                        state.needs_handshake = false;
                        state.consecutive_errors > self.max_errors
                    };
                    // Escalation holds until a command exchange succeeds.
                    self.set_connectivity(if escalated {
                        Connectivity::ConfigurationError
                    } else {
                        Connectivity::Connected
                    });
                    return Ok(packet);
                }
                Ok(None) => debug!(attempt, "no handshake reply"),
                Err(CommandError::Closed) => return Err(Error::Closed),
                Err(err) => debug!(attempt, error = %err, "handshake attempt failed"),
            }
        }

        Metrics::record_handshake(false);
        warn!(attempts = self.handshake_attempts, "device did not answer handshake");
        self.set_connectivity(Connectivity::CommunicationError);
        Err(Error::NoResponse)
    }

    fn on_timeout(&self) {
        Metrics::record_failure(FailureKind::Timeout);
        let errors = {
            let mut state = lock(&self.state);
            state.consecutive_errors = state.consecutive_errors.saturating_add(1);
            state.consecutive_errors
        };
        if errors > self.max_errors {
            warn!(errors, "too many consecutive timeouts");
            self.set_connectivity(Connectivity::ConfigurationError);
            match self.handshake() {
                Ok(_) => debug!("device answers handshake but not commands"),
                Err(err) => trace!(error = %err, "escalation handshake failed"),
            }
        }
        lock(&self.state).needs_handshake = true;
    }

    fn on_success(&self, packet: &Packet) {
        {
            let mut state = lock(&self.state);
            state.consecutive_errors = 0;
            state.needs_handshake = false;
            state.clock_delta = clock_delta_from(packet.timestamp());
        }
        self.set_connectivity(Connectivity::Connected);
    }

    fn set_connectivity(&self, status: Connectivity) {
        let changed = {
            let mut state = lock(&self.state);
            if state.connectivity == status {
                false
            } else {
                state.connectivity = status;
                true
            }
        };
        if !changed {
            return;
        }

        info!(?status, "connectivity changed");
        for listener in self.live_listeners() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_connectivity_change(status);
            }));
            if delivered.is_err() {
                warn!("listener panicked in on_connectivity_change");
            }
        }
    }

    fn notify_result(&self, command: &PendingCommand) {
        for listener in self.live_listeners() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| listener.on_result(command)));
            if delivered.is_err() {
                warn!(id = command.id(), "listener panicked in on_result");
            }
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn SessionListener>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|weak| weak.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl core::fmt::Debug for Inner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inner")
            .field("addr", &self.addr)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        Metrics::record_session_close();
    }
}
