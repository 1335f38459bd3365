//! QoS wrapper: synchronous backpressure on send, asynchronous draining
//! into the inner pipe.
//!
//! The caller observes backpressure decisions at `send` time while a
//! dedicated worker drains the queue, which smooths jitter from inner
//! pipe stalls without callers spawning threads of their own. Receive
//! queueing is reserved; `recv` passes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sluice_types::{
    Message, Pipe, QosOptions, RecvOptions, Result, SendOptions, Status, StatusCode,
};

use crate::queue::MessageQueue;

/// Backoff between drain attempts after a transient inner-pipe failure.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

pub struct QosPipe {
    inner: Arc<dyn Pipe>,
    queue: Arc<MessageQueue>,
    qos: QosOptions,
    closed: AtomicBool,
    /// Latched by the worker when the inner pipe fails terminally.
    failed: Arc<AtomicBool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl QosPipe {
    pub fn new(inner: Box<dyn Pipe>, qos: QosOptions) -> Self {
        let inner: Arc<dyn Pipe> = Arc::from(inner);
        let queue = Arc::new(MessageQueue::new(
            qos.snd_hwm_bytes,
            qos.backpressure,
            qos.ttl,
        ));
        let failed = Arc::new(AtomicBool::new(false));

        let worker = {
            let inner = Arc::clone(&inner);
            let queue = Arc::clone(&queue);
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name("sluice-qos-send".to_string())
                .spawn(move || drain_loop(&queue, &*inner, &failed))
                .expect("spawn qos send worker")
        };

        Self {
            inner,
            queue,
            qos,
            closed: AtomicBool::new(false),
            failed,
            worker: Mutex::new(Some(worker)),
        }
    }
}

/// Worker: wait for a head entry, push it into the inner pipe, pop on
/// success. `Closed`/`IoError` from the inner pipe are terminal; other
/// failures leave the head in place and retry after a short backoff.
fn drain_loop(queue: &MessageQueue, inner: &dyn Pipe, failed: &AtomicBool) {
    loop {
        let head = match queue.peek_wait(Duration::ZERO) {
            Ok(msg) => msg,
            // Queue closed and drained.
            Err(_) => return,
        };

        match inner.send(&head, &SendOptions::default()) {
            Ok(()) => {
                let _ = queue.try_pop();
            }
            Err(st) if matches!(st.code(), StatusCode::Closed | StatusCode::IoError) => {
                tracing::debug!(error = %st, "qos worker stopping on terminal send failure");
                failed.store(true, Ordering::Release);
                queue.close();
                return;
            }
            Err(st) => {
                tracing::trace!(error = %st, "qos send retrying head entry");
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

impl Pipe for QosPipe {
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.failed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        // A message that can never fit the queue is a caller bug, not
        // backpressure.
        if self.qos.snd_hwm_bytes > 0 && msg.len() > self.qos.snd_hwm_bytes {
            return Err(Status::invalid_argument(format!(
                "message of {} bytes exceeds the {} byte send high water mark",
                msg.len(),
                self.qos.snd_hwm_bytes
            )));
        }
        self.queue.push(msg, opts.timeout)
    }

    fn recv(&self, opts: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        self.inner.recv(opts)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if !self.qos.linger.is_zero() && !self.failed.load(Ordering::Acquire) {
            self.queue.wait_idle(self.qos.linger);
        }

        self.queue.close();
        self.inner.close();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QosPipe {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Instant;

    /// Inner pipe that records sends and can be scripted to fail.
    struct ScriptedPipe {
        sent: PlMutex<Vec<Message>>,
        fail_with: PlMutex<Option<Status>>,
        closed: AtomicBool,
    }

    impl ScriptedPipe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: PlMutex::new(Vec::new()),
                fail_with: PlMutex::new(None),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Pipe for ScriptedPipe {
        fn send(&self, msg: &Message, _opts: &SendOptions) -> Result<()> {
            if let Some(st) = self.fail_with.lock().clone() {
                return Err(st);
            }
            self.sent.lock().push(msg.clone());
            Ok(())
        }

        fn recv(&self, _opts: &RecvOptions) -> Result<Message> {
            Ok(Message::from_string("inner recv"))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Hand a clone of the Arc to QosPipe while keeping one for
    /// inspection.
    fn wrap(inner: &Arc<ScriptedPipe>, qos: QosOptions) -> QosPipe {
        let boxed: Box<dyn Pipe> = Box::new(ArcPipe(Arc::clone(inner)));
        QosPipe::new(boxed, qos)
    }

    struct ArcPipe(Arc<ScriptedPipe>);

    impl Pipe for ArcPipe {
        fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
            self.0.send(msg, opts)
        }
        fn recv(&self, opts: &RecvOptions) -> Result<Message> {
            self.0.recv(opts)
        }
        fn close(&self) {
            self.0.close();
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn worker_drains_in_order() {
        let inner = ScriptedPipe::new();
        let pipe = wrap(&inner, QosOptions::default());

        for text in ["first", "second", "third"] {
            pipe.send(&Message::from_string(text), &SendOptions::default())
                .expect("send");
        }

        assert!(wait_for(
            || inner.sent.lock().len() == 3,
            Duration::from_secs(2)
        ));
        let sent = inner.sent.lock();
        assert_eq!(sent[0].as_slice(), b"first");
        assert_eq!(sent[1].as_slice(), b"second");
        assert_eq!(sent[2].as_slice(), b"third");
    }

    #[test]
    fn oversized_message_is_rejected_up_front() {
        let inner = ScriptedPipe::new();
        let qos = QosOptions {
            snd_hwm_bytes: 16,
            ..QosOptions::default()
        };
        let pipe = wrap(&inner, qos);

        let err = pipe
            .send(&Message::from_vec(vec![0u8; 17]), &SendOptions::default())
            .expect_err("too large for the queue");
        assert_eq!(err.code(), StatusCode::InvalidArgument);
    }

    #[test]
    fn terminal_inner_failure_closes_future_sends() {
        let inner = ScriptedPipe::new();
        *inner.fail_with.lock() = Some(Status::io_error("wire cut"));
        let pipe = wrap(&inner, QosOptions::default());

        pipe.send(&Message::from_string("doomed"), &SendOptions::default())
            .expect("queued fine");

        assert!(wait_for(
            || pipe.failed.load(Ordering::Acquire),
            Duration::from_secs(2)
        ));
        let err = pipe
            .send(&Message::from_string("after"), &SendOptions::default())
            .expect_err("worker stopped");
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn transient_failure_retries_the_head() {
        let inner = ScriptedPipe::new();
        *inner.fail_with.lock() = Some(Status::timeout("inner stall"));
        let pipe = wrap(&inner, QosOptions::default());

        pipe.send(&Message::from_string("retry me"), &SendOptions::default())
            .expect("queued");
        thread::sleep(Duration::from_millis(30));
        assert!(inner.sent.lock().is_empty());

        *inner.fail_with.lock() = None;
        assert!(wait_for(
            || inner.sent.lock().len() == 1,
            Duration::from_secs(2)
        ));
        assert_eq!(inner.sent.lock()[0].as_slice(), b"retry me");
    }

    #[test]
    fn recv_passes_through() {
        let inner = ScriptedPipe::new();
        let pipe = wrap(&inner, QosOptions::default());
        let got = pipe.recv(&RecvOptions::default()).expect("recv");
        assert_eq!(got.as_slice(), b"inner recv");
    }

    #[test]
    fn close_joins_worker_and_closes_inner() {
        let inner = ScriptedPipe::new();
        let pipe = wrap(&inner, QosOptions::default());
        pipe.close();
        pipe.close();
        assert!(inner.closed.load(Ordering::Acquire));
        assert!(pipe.worker.lock().is_none());

        let err = pipe
            .send(&Message::from_string("x"), &SendOptions::default())
            .expect_err("closed");
        assert_eq!(err.code(), StatusCode::Closed);
    }

    #[test]
    fn linger_drains_before_close() {
        let inner = ScriptedPipe::new();
        let qos = QosOptions {
            linger: Duration::from_secs(2),
            ..QosOptions::default()
        };
        let pipe = wrap(&inner, qos);
        for _ in 0..10 {
            pipe.send(&Message::from_string("drain"), &SendOptions::default())
                .expect("send");
        }
        pipe.close();
        assert_eq!(inner.sent.lock().len(), 10);
    }

    #[test]
    fn expired_messages_never_reach_the_inner_pipe() {
        let inner = ScriptedPipe::new();
        // Stall the worker so entries age out in the queue.
        *inner.fail_with.lock() = Some(Status::timeout("stalled"));
        let qos = QosOptions {
            ttl: Duration::from_millis(20),
            ..QosOptions::default()
        };
        let pipe = wrap(&inner, qos);

        pipe.send(&Message::from_string("stale"), &SendOptions::default())
            .expect("send");
        thread::sleep(Duration::from_millis(60));
        *inner.fail_with.lock() = None;

        pipe.send(&Message::from_string("live"), &SendOptions::default())
            .expect("send");
        assert!(wait_for(
            || !inner.sent.lock().is_empty(),
            Duration::from_secs(2)
        ));
        let sent = inner.sent.lock();
        assert!(sent.iter().all(|m| m.as_slice() != b"stale"));
    }
}
