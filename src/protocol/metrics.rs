use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Track Mi IO exchange metrics without external dependencies.
pub(crate) struct Metrics;

static COMMANDS_SENT: AtomicU64 = AtomicU64::new(0);
static REPLIES_RECEIVED: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static CHECKSUM_FAILURES: AtomicU64 = AtomicU64::new(0);
static COMMAND_ERRORS: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_ATTEMPTED: AtomicU64 = AtomicU64::new(0);
static HANDSHAKES_SUCCEEDED: AtomicU64 = AtomicU64::new(0);
static ACTIVE_SESSIONS: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_LATENCY_TOTAL_NS: AtomicU64 = AtomicU64::new(0);
static EXCHANGE_LATENCY_MAX_NS: AtomicU64 = AtomicU64::new(0);

const NANOSECONDS_PER_MICROSECOND: u128 = 1_000;

/// Failure classes counted separately.
#[derive(Clone, Copy)]
pub(crate) enum FailureKind {
    Timeout,
    Checksum,
    Command,
}

impl Metrics {
    #[inline]
    pub(crate) fn record_command_sent() {
        COMMANDS_SENT.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reply(latency: Duration) {
        REPLIES_RECEIVED.fetch_add(1, Ordering::Relaxed);
        let nanos = latency
            .as_nanos()
            .min(u64::MAX as u128)
            .try_into()
            .unwrap_or(u64::MAX);
        EXCHANGE_LATENCY_TOTAL_NS.fetch_add(nanos, Ordering::Relaxed);
        update_max(&EXCHANGE_LATENCY_MAX_NS, nanos);
    }

    #[inline]
    pub(crate) fn record_failure(kind: FailureKind) {
        let counter = match kind {
            FailureKind::Timeout => &TIMEOUTS,
            FailureKind::Checksum => &CHECKSUM_FAILURES,
            FailureKind::Command => &COMMAND_ERRORS,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_handshake(succeeded: bool) {
        HANDSHAKES_ATTEMPTED.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            HANDSHAKES_SUCCEEDED.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn record_session_open() {
        ACTIVE_SESSIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_session_close() {
        ACTIVE_SESSIONS.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: COMMANDS_SENT.load(Ordering::Relaxed),
            replies_received: REPLIES_RECEIVED.load(Ordering::Relaxed),
            timeouts: TIMEOUTS.load(Ordering::Relaxed),
            checksum_failures: CHECKSUM_FAILURES.load(Ordering::Relaxed),
            command_errors: COMMAND_ERRORS.load(Ordering::Relaxed),
            handshakes_attempted: HANDSHAKES_ATTEMPTED.load(Ordering::Relaxed),
            handshakes_succeeded: HANDSHAKES_SUCCEEDED.load(Ordering::Relaxed),
            active_sessions: ACTIVE_SESSIONS.load(Ordering::Relaxed),
            exchange_latency_total_ns: EXCHANGE_LATENCY_TOTAL_NS.load(Ordering::Relaxed),
            exchange_latency_max_ns: EXCHANGE_LATENCY_MAX_NS.load(Ordering::Relaxed),
        }
    }
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Lightweight snapshot of critical counters.
#[allow(missing_docs)]
#[derive(Default, Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub replies_received: u64,
    pub timeouts: u64,
    pub checksum_failures: u64,
    pub command_errors: u64,
    pub handshakes_attempted: u64,
    pub handshakes_succeeded: u64,
    pub active_sessions: u64,
    pub exchange_latency_total_ns: u64,
    pub exchange_latency_max_ns: u64,
}

impl MetricsSnapshot {
    /// Average command round-trip in microseconds.
    #[must_use]
    pub fn avg_exchange_latency_us(&self) -> Option<u64> {
        if self.replies_received == 0 {
            return None;
        }

        let total_ns = u128::from(self.exchange_latency_total_ns);
        let divisor = u128::from(self.replies_received) * NANOSECONDS_PER_MICROSECOND;
        u64::try_from(total_ns / divisor).ok()
    }
}
