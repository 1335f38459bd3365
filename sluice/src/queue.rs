//! A thread-safe FIFO bounded by bytes, with backpressure policies,
//! per-message TTL, and close-aware waits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use sluice_types::{BackpressurePolicy, Message, Result, Status};

struct Entry {
    msg: Message,
    /// Absolute expiry; `None` when the queue has no TTL.
    deadline: Option<Instant>,
}

struct Inner {
    entries: VecDeque<Entry>,
    total_bytes: usize,
    closed: bool,
}

impl Inner {
    /// Whether a message of `size` bytes can be enqueued under `hwm`.
    /// A queue at or above its HWM rejects every push, zero-length
    /// included.
    fn fits(&self, hwm: usize, size: usize) -> bool {
        hwm == 0 || (self.total_bytes < hwm && self.total_bytes + size <= hwm)
    }

    fn evict_front(&mut self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        self.total_bytes -= entry.msg.len();
        Some(entry)
    }

    /// Drop expired entries at the head. Returns how many were dropped.
    fn purge_expired_head(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        while let Some(front) = self.entries.front() {
            match front.deadline {
                Some(deadline) if now > deadline => {
                    self.evict_front();
                    purged += 1;
                }
                _ => break,
            }
        }
        purged
    }
}

/// Bounded message queue.
///
/// The high water mark is tracked in bytes (message sizes vary too much
/// for counts to be a stable limit); a HWM of zero disables the limit.
/// `close` latches and wakes every waiter.
pub struct MessageQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
    hwm_bytes: usize,
    policy: BackpressurePolicy,
    ttl: Duration,
}

impl MessageQueue {
    pub fn new(hwm_bytes: usize, policy: BackpressurePolicy, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                total_bytes: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            hwm_bytes,
            policy,
            ttl,
        }
    }

    /// Enqueue a message, applying the backpressure policy at the HWM.
    ///
    /// For `Block`, a zero `timeout` waits indefinitely; otherwise the
    /// wait is bounded and returns `Timeout` on expiry. `DropNew` and an
    /// unsatisfiable `DropOld` return Ok without enqueueing.
    pub fn push(&self, msg: &Message, timeout: Duration) -> Result<()> {
        let size = msg.len();
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(Status::closed("queue closed"));
        }

        if !inner.fits(self.hwm_bytes, size) {
            match self.policy {
                BackpressurePolicy::Block => {
                    let hwm = self.hwm_bytes;
                    if timeout.is_zero() {
                        self.not_full
                            .wait_while(&mut inner, |i| !i.closed && !i.fits(hwm, size));
                    } else {
                        let timed_out = self
                            .not_full
                            .wait_while_for(
                                &mut inner,
                                |i| !i.closed && !i.fits(hwm, size),
                                timeout,
                            )
                            .timed_out();
                        if timed_out {
                            return Err(Status::timeout(
                                "push timed out waiting for queue space",
                            ));
                        }
                    }
                    if inner.closed {
                        return Err(Status::closed("queue closed"));
                    }
                }
                BackpressurePolicy::DropNew => return Ok(()),
                BackpressurePolicy::DropOld => {
                    while !inner.fits(self.hwm_bytes, size) && !inner.entries.is_empty() {
                        inner.evict_front();
                        self.not_full.notify_one();
                    }
                    if !inner.fits(self.hwm_bytes, size) {
                        // The message alone exceeds the HWM; dropping it
                        // is the only policy-consistent outcome.
                        return Ok(());
                    }
                }
                BackpressurePolicy::FailFast => {
                    return Err(Status::io_error("send queue at high water mark"));
                }
            }
        }

        let deadline = if self.ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + self.ttl)
        };
        inner.entries.push_back(Entry {
            msg: msg.clone(),
            deadline,
        });
        inner.total_bytes += size;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue the oldest live message. Expired entries at the head are
    /// purged first. A zero `timeout` blocks until a message arrives or
    /// the queue closes.
    pub fn pop(&self, timeout: Duration) -> Result<Message> {
        let mut inner = self.inner.lock();

        if timeout.is_zero() {
            self.not_empty
                .wait_while(&mut inner, |i| !i.closed && i.entries.is_empty());
        } else {
            let timed_out = self
                .not_empty
                .wait_while_for(&mut inner, |i| !i.closed && i.entries.is_empty(), timeout)
                .timed_out();
            if timed_out {
                return Err(Status::timeout("pop timed out waiting for a message"));
            }
        }

        let purged = inner.purge_expired_head(Instant::now());
        if purged > 0 {
            self.not_full.notify_one();
            tracing::trace!(purged, "dropped expired queue entries");
        }

        if inner.entries.is_empty() {
            if inner.closed {
                return Err(Status::closed("queue closed"));
            }
            return Err(Status::timeout("all queued messages expired"));
        }

        let entry = inner.evict_front().expect("non-empty queue");
        self.not_full.notify_one();
        Ok(entry.msg)
    }

    /// Dequeue without blocking. Returns `None` when empty (after expiry
    /// purge).
    pub fn try_pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        let purged = inner.purge_expired_head(Instant::now());
        if purged > 0 {
            self.not_full.notify_one();
        }
        let entry = inner.evict_front()?;
        self.not_full.notify_one();
        Some(entry.msg)
    }

    /// Clone the head message without removing it, waiting up to
    /// `timeout` for one to appear (zero = forever). Returns `Closed`
    /// when the queue is closed and drained.
    pub fn peek_wait(&self, timeout: Duration) -> Result<Message> {
        let mut inner = self.inner.lock();

        loop {
            if timeout.is_zero() {
                self.not_empty
                    .wait_while(&mut inner, |i| !i.closed && i.entries.is_empty());
            } else {
                let timed_out = self
                    .not_empty
                    .wait_while_for(&mut inner, |i| !i.closed && i.entries.is_empty(), timeout)
                    .timed_out();
                if timed_out {
                    return Err(Status::timeout("peek timed out waiting for a message"));
                }
            }

            let purged = inner.purge_expired_head(Instant::now());
            if purged > 0 {
                self.not_full.notify_one();
                tracing::trace!(purged, "dropped expired queue entries");
            }

            if let Some(front) = inner.entries.front() {
                return Ok(front.msg.clone());
            }
            if inner.closed {
                return Err(Status::closed("queue closed"));
            }
            // Everything expired; go back to waiting.
        }
    }

    /// Remove every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let before = inner.entries.len();
        let mut kept = VecDeque::with_capacity(before);
        let mut total = 0usize;
        for entry in inner.entries.drain(..) {
            match entry.deadline {
                Some(deadline) if now > deadline => {}
                _ => {
                    total += entry.msg.len();
                    kept.push_back(entry);
                }
            }
        }
        inner.entries = kept;
        inner.total_bytes = total;

        let purged = before - inner.entries.len();
        if purged > 0 {
            self.not_full.notify_all();
        }
        purged
    }

    /// Wait until the queue drains empty, up to `timeout`. Returns true
    /// when empty.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if timeout.is_zero() {
            return inner.entries.is_empty();
        }
        !self
            .not_full
            .wait_while_for(&mut inner, |i| !i.closed && !i.entries.is_empty(), timeout)
            .timed_out()
            && inner.entries.is_empty()
    }

    /// Latch the queue closed and wake every waiter.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Total queued bytes.
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Queued message count.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether the queue is at or above its high water mark.
    pub fn at_hwm(&self) -> bool {
        let inner = self.inner.lock();
        self.hwm_bytes > 0 && inner.total_bytes >= self.hwm_bytes
    }
}
