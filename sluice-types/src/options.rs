use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decision rule applied when a bounded queue reaches its high water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait for space (optionally bounded by the caller's timeout).
    #[default]
    Block,
    /// Silently drop the new message.
    DropNew,
    /// Evict oldest entries until the new message fits.
    DropOld,
    /// Fail immediately with an I/O error.
    FailFast,
}

/// Delivery guarantee requested for a pipe.
///
/// `AtLeastOnce` is reserved: the frame flag bit exists, but dials
/// requesting it are refused with `NotSupported`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

/// Connection lifecycle as observed through a state callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer invoked on every connection state transition with the new
/// state and a human-readable reason.
///
/// The callback may run on a supervisor worker thread or on a caller
/// thread; it must not block for long and must not call back into the
/// pipe that invoked it.
pub type StateCallback = Arc<dyn Fn(ConnectionState, &str) + Send + Sync>;

/// Per-call send options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Bound on any blocking wait inside `send`. Zero blocks forever.
    pub timeout: Duration,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Per-call receive options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvOptions {
    /// Bound on any blocking wait inside `recv`. Zero blocks forever.
    pub timeout: Duration,
}

impl RecvOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Queueing and backpressure configuration for a dialled pipe.
#[derive(Debug, Clone)]
pub struct QosOptions {
    /// Send-queue high water mark in bytes. Zero disables the limit.
    ///
    /// Bytes are more stable than message counts when payload sizes vary.
    pub snd_hwm_bytes: usize,
    /// Receive-queue high water mark in bytes. Reserved: receive queueing
    /// is not implemented and `recv` passes through to the transport.
    pub rcv_hwm_bytes: usize,
    /// Policy applied when the send queue is at its high water mark.
    pub backpressure: BackpressurePolicy,
    /// Per-message time-to-live; expired messages are dropped silently.
    /// Zero disables expiry.
    pub ttl: Duration,
    /// Bound on the close-time drain wait for queued outbound messages.
    /// Zero means best-effort immediate close.
    pub linger: Duration,
    /// Requested delivery guarantee (`AtLeastOnce` is reserved).
    pub reliability: Reliability,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self {
            snd_hwm_bytes: 4 * 1024 * 1024,
            rcv_hwm_bytes: 4 * 1024 * 1024,
            backpressure: BackpressurePolicy::Block,
            ttl: Duration::ZERO,
            linger: Duration::ZERO,
            reliability: Reliability::AtMostOnce,
        }
    }
}

impl QosOptions {
    /// Whether a dial with these options gets a QoS wrapper at all.
    pub fn is_enabled(&self) -> bool {
        self.snd_hwm_bytes != 0
            || self.backpressure != BackpressurePolicy::Block
            || !self.ttl.is_zero()
    }

    /// Disable queueing entirely: sends go straight to the transport.
    pub fn disabled() -> Self {
        Self {
            snd_hwm_bytes: 0,
            rcv_hwm_bytes: 0,
            ..Self::default()
        }
    }
}

/// Automatic-reconnect configuration for a dialled pipe.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// If enabled, `dial` returns a pipe that connects and reconnects in
    /// the background.
    pub enabled: bool,
    /// Delay before the first retry after a disconnect.
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
    /// Exponential backoff multiplier.
    pub backoff_multiplier: f64,
    /// Maximum consecutive failed attempts before latching permanent
    /// failure. Zero retries forever.
    pub max_attempts: u32,
    /// Keepalive interval; for `tcp://` this maps to OS TCP keepalive.
    /// Zero disables it.
    pub heartbeat_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: 0,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Options for `dial`.
#[derive(Clone, Default)]
pub struct DialOptions {
    /// Timeout for a single connection attempt. Zero uses the transport
    /// default; for reconnect-enabled dials a bounded internal default is
    /// substituted so the supervisor stays responsive to `close`.
    pub timeout: Duration,
    pub qos: QosOptions,
    pub reconnect: ReconnectPolicy,
    /// Invoked on connection state transitions (see [`StateCallback`]).
    pub on_state_change: Option<StateCallback>,
}

impl fmt::Debug for DialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialOptions")
            .field("timeout", &self.timeout)
            .field("qos", &self.qos)
            .field("reconnect", &self.reconnect)
            .field("on_state_change", &self.on_state_change.is_some())
            .finish()
    }
}

/// Options for `listen`.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Carried for symmetry with `DialOptions`; listeners do not queue.
    pub qos: QosOptions,
    /// Accept backlog for the listening socket.
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            qos: QosOptions::default(),
            backlog: 128,
        }
    }
}
