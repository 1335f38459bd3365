use crate::{Message, RecvOptions, Result, SendOptions, Status};

/// A bidirectional, ordered, message-oriented channel between two
/// endpoints.
///
/// Implementations provide interior synchronisation only for `close`;
/// callers sharing one pipe between threads must serialise `send`/`recv`
/// externally. `close` is safe to call from any thread, any number of
/// times.
pub trait Pipe: Send + Sync {
    /// Send one message. Blocks according to the transport and
    /// `opts.timeout` (zero = block forever).
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()>;

    /// Receive the next message. Blocks according to the transport and
    /// `opts.timeout` (zero = block forever).
    fn recv(&self, opts: &RecvOptions) -> Result<Message>;

    /// Close the pipe. Idempotent; subsequent operations return `Closed`.
    fn close(&self);
}

impl std::fmt::Debug for dyn Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").finish_non_exhaustive()
    }
}

/// An accepting endpoint that yields pipes as peers connect.
pub trait Listener: Send + Sync {
    /// Wait for the next peer and return the connected pipe.
    fn accept(&self) -> Result<Box<dyn Pipe>>;

    /// The effective bound address (e.g. after ephemeral-port binding).
    fn local_address(&self) -> Result<String> {
        Err(Status::not_supported("local_address not supported"))
    }

    /// Close the listener and release its resources. Idempotent.
    fn close(&self);
}

impl std::fmt::Debug for dyn Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}
