//! State-change observation for dials without a reconnect supervisor.
//!
//! When a caller supplies a state callback but reconnect is disabled,
//! nothing else in the stack watches the connection, so this thin
//! wrapper reports the first disconnect-class failure and the close.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sluice_types::{
    ConnectionState, Message, Pipe, RecvOptions, Result, SendOptions, StateCallback, Status,
    StatusCode,
};

pub struct StateCallbackPipe {
    inner: Arc<dyn Pipe>,
    callback: StateCallback,
    closed: AtomicBool,
    disconnected: AtomicBool,
}

impl StateCallbackPipe {
    pub fn new(inner: Box<dyn Pipe>, callback: StateCallback) -> Self {
        Self {
            inner: Arc::from(inner),
            callback,
            closed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    fn emit_disconnected(&self, reason: &str) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.callback)(ConnectionState::Disconnected, reason);
    }
}

fn is_disconnect(st: &Status) -> bool {
    matches!(st.code(), StatusCode::Closed | StatusCode::IoError)
}

impl Pipe for StateCallbackPipe {
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        let result = self.inner.send(msg, opts);
        if let Err(st) = &result {
            if is_disconnect(st) {
                self.emit_disconnected(&format!("send: {}", st.message()));
            }
        }
        result
    }

    fn recv(&self, opts: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        let result = self.inner.recv(opts);
        if let Err(st) = &result {
            if is_disconnect(st) {
                self.emit_disconnected(&format!("recv: {}", st.message()));
            }
        }
        result
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        (self.callback)(ConnectionState::Closed, "closed");
        self.inner.close();
    }
}

impl Drop for StateCallbackPipe {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct FailingPipe;

    impl Pipe for FailingPipe {
        fn send(&self, _msg: &Message, _opts: &SendOptions) -> Result<()> {
            Err(Status::io_error("reset"))
        }
        fn recv(&self, _opts: &RecvOptions) -> Result<Message> {
            Err(Status::io_error("reset"))
        }
        fn close(&self) {}
    }

    #[test]
    fn disconnect_and_close_are_each_reported_once() {
        let events: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
        let callback: StateCallback = {
            let events = Arc::clone(&events);
            Arc::new(move |state, _| events.lock().push(state))
        };

        let pipe = StateCallbackPipe::new(Box::new(FailingPipe), callback);
        let _ = pipe.send(&Message::from_string("x"), &SendOptions::default());
        let _ = pipe.recv(&RecvOptions::default());
        pipe.close();
        pipe.close();

        assert_eq!(
            events.lock().as_slice(),
            &[ConnectionState::Disconnected, ConnectionState::Closed]
        );
    }
}
