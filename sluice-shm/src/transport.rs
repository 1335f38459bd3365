//! The shm listener, pipe, and bootstrap rendezvous.

use std::fs;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};

use sluice_types::{
    DialOptions, ListenOptions, Listener, Message, Pipe, RecvOptions, Result, SendOptions, Status,
};

use crate::layout::{REGION_SIZE, Ring, SLOT_COUNT, SLOT_PAYLOAD_MAX, ShmLayout, ShmNames};
use crate::mmap::ShmRegion;
use crate::sem::NamedSemaphore;

/// The kernel objects backing one connection.
struct Resources {
    region: ShmRegion,
    c2s_items: NamedSemaphore,
    c2s_spaces: NamedSemaphore,
    s2c_items: NamedSemaphore,
    s2c_spaces: NamedSemaphore,
}

/// One endpoint of a shared-memory connection.
///
/// The dialler owns the kernel objects and unlinks them on close; the
/// accepted side holds non-owning handles. The mapping itself is released
/// on drop, so `close` never invalidates memory a blocked peer might
/// still touch.
pub struct ShmPipe {
    res: Resources,
    names: ShmNames,
    owner: bool,
    is_client: bool,
    closed: AtomicBool,
}

impl ShmPipe {
    fn new(res: Resources, names: ShmNames, owner: bool, is_client: bool) -> Self {
        Self {
            res,
            names,
            owner,
            is_client,
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn layout(&self) -> *mut ShmLayout {
        self.res.region.as_ptr() as *mut ShmLayout
    }

    /// The ring and semaphores this side transmits on.
    fn tx(&self) -> (*mut Ring, &NamedSemaphore, &NamedSemaphore) {
        // SAFETY: the mapping is live and REGION_SIZE covers both rings.
        unsafe {
            if self.is_client {
                (
                    std::ptr::addr_of_mut!((*self.layout()).c2s),
                    &self.res.c2s_items,
                    &self.res.c2s_spaces,
                )
            } else {
                (
                    std::ptr::addr_of_mut!((*self.layout()).s2c),
                    &self.res.s2c_items,
                    &self.res.s2c_spaces,
                )
            }
        }
    }

    /// The ring and semaphores this side receives on.
    fn rx(&self) -> (*mut Ring, &NamedSemaphore, &NamedSemaphore) {
        // SAFETY: the mapping is live and REGION_SIZE covers both rings.
        unsafe {
            if self.is_client {
                (
                    std::ptr::addr_of_mut!((*self.layout()).s2c),
                    &self.res.s2c_items,
                    &self.res.s2c_spaces,
                )
            } else {
                (
                    std::ptr::addr_of_mut!((*self.layout()).c2s),
                    &self.res.c2s_items,
                    &self.res.c2s_spaces,
                )
            }
        }
    }
}

impl Pipe for ShmPipe {
    fn send(&self, msg: &Message, opts: &SendOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }
        if msg.len() > SLOT_PAYLOAD_MAX {
            return Err(Status::invalid_argument(format!(
                "message of {} bytes exceeds the {} byte slot ceiling",
                msg.len(),
                SLOT_PAYLOAD_MAX
            )));
        }

        let (ring, items, spaces) = self.tx();
        spaces.wait(opts.timeout)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        // SAFETY: ring points into the live mapping; only this side
        // writes the producer index and the slot it selects.
        unsafe {
            let meta = &(*ring).meta;
            let head = meta.head.load(Ordering::Relaxed);
            let tail = meta.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= SLOT_COUNT {
                // The spaces token came from a close, not the consumer.
                return Err(Status::closed("peer closed"));
            }

            let idx = (head % SLOT_COUNT) as usize;
            let slot = std::ptr::addr_of_mut!((*ring).slots[idx]);
            (*slot).len = msg.len() as u32;
            if !msg.is_empty() {
                std::ptr::copy_nonoverlapping(
                    msg.as_slice().as_ptr(),
                    std::ptr::addr_of_mut!((*slot).data) as *mut u8,
                    msg.len(),
                );
            }
            meta.head.store(head.wrapping_add(1), Ordering::Release);
        }

        items.post()
    }

    fn recv(&self, opts: &RecvOptions) -> Result<Message> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        let (ring, items, spaces) = self.rx();
        items.wait(opts.timeout)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("pipe closed"));
        }

        // SAFETY: ring points into the live mapping; only this side
        // writes the consumer index and reads the slot it selects.
        let msg = unsafe {
            let meta = &(*ring).meta;
            let tail = meta.tail.load(Ordering::Relaxed);
            let head = meta.head.load(Ordering::Acquire);
            if head == tail {
                // The items token came from a close, not the producer.
                return Err(Status::closed("peer closed"));
            }

            let idx = (tail % SLOT_COUNT) as usize;
            let slot = std::ptr::addr_of!((*ring).slots[idx]);
            let len = (*slot).len as usize;
            if len > SLOT_PAYLOAD_MAX {
                return Err(Status::protocol_error(format!(
                    "shm slot length {len} exceeds the slot ceiling"
                )));
            }

            let msg = Message::from_slice(std::slice::from_raw_parts(
                std::ptr::addr_of!((*slot).data) as *const u8,
                len,
            ));
            meta.tail.store(tail.wrapping_add(1), Ordering::Release);
            msg
        };

        spaces.post()?;
        Ok(msg)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wake both directions so blocked waits (local or peer) observe
        // the close instead of sleeping forever. Receivers treat an items
        // token on an empty ring as end-of-stream; senders treat a spaces
        // token on a full ring the same way.
        let _ = self.res.c2s_items.post();
        let _ = self.res.c2s_spaces.post();
        let _ = self.res.s2c_items.post();
        let _ = self.res.s2c_spaces.post();

        if self.owner {
            NamedSemaphore::unlink(&self.names.c2s_items);
            NamedSemaphore::unlink(&self.names.c2s_spaces);
            NamedSemaphore::unlink(&self.names.s2c_items);
            NamedSemaphore::unlink(&self.names.s2c_spaces);
            ShmRegion::unlink(&self.names.region);
            tracing::debug!(
                bus = %self.names.bus,
                conn = %self.names.conn_id,
                "shm connection unlinked"
            );
        }
    }
}

impl Drop for ShmPipe {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listener for a shared-memory bus.
///
/// Holds only the bootstrap socket: the per-connection shared memory is
/// created by diallers and opened here at accept time. Accepts are
/// serviced one at a time; concurrent diallers queue on the bootstrap
/// socket's backlog.
pub struct ShmListener {
    names: ShmNames,
    listener: UnixListener,
    closed: AtomicBool,
}

impl Listener for ShmListener {
    fn accept(&self) -> Result<Box<dyn Pipe>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }

        let (mut stream, _) = self.listener.accept().map_err(|e| {
            if self.closed.load(Ordering::Acquire) {
                Status::closed("listener closed")
            } else {
                Status::io_error(format!("bootstrap accept failed: {e}"))
            }
        })?;

        let mut id = [0u8; 16];
        stream
            .read_exact(&mut id)
            .map_err(|e| Status::from_io("bootstrap id read", e))?;
        let conn_id = match std::str::from_utf8(&id) {
            Ok(s) if s.bytes().all(|b| b.is_ascii_hexdigit()) => s.to_string(),
            _ => return Err(Status::protocol_error("bootstrap connection id is not hex")),
        };

        let names = ShmNames::derive(&self.names.bus, &conn_id);
        let pipe = open_connection(names).map_err(|st| {
            tracing::warn!(bus = %self.names.bus, conn = %conn_id, error = %st,
                "failed to open dialler-created shm resources");
            st
        })?;
        Ok(Box::new(pipe))
    }

    fn local_address(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::closed("listener closed"));
        }
        Ok(format!("shm://{}", self.names.bus))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Unblock any accept sleeping in the kernel.
        // SAFETY: the descriptor stays open until the listener drops.
        unsafe { libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR) };
        let _ = fs::remove_file(&self.names.bootstrap_path);
    }
}

impl Drop for ShmListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind the bootstrap socket for `name` and start listening.
///
/// No shared memory exists yet; each dial creates its own connection
/// objects.
pub fn shm_listen(name: &str, opts: &ListenOptions) -> Result<ShmListener> {
    let names = ShmNames::derive(name, "0000000000000000");

    // A stale path from a crashed listener would otherwise fail the bind.
    let _ = fs::remove_file(&names.bootstrap_path);

    let listener = UnixListener::bind(&names.bootstrap_path).map_err(|e| {
        Status::io_error(format!(
            "bootstrap bind failed for {}: {e}",
            names.bootstrap_path.display()
        ))
    })?;

    if opts.backlog > 0 {
        // Re-arm listen to apply the requested backlog depth.
        // SAFETY: the descriptor is a live listening socket.
        unsafe { libc::listen(listener.as_raw_fd(), opts.backlog) };
    }

    tracing::debug!(bus = %names.bus, path = %names.bootstrap_path.display(), "shm bus listening");
    Ok(ShmListener {
        names,
        listener,
        closed: AtomicBool::new(false),
    })
}

/// Create the connection objects, rendezvous over the bootstrap socket,
/// and return the owning client-side pipe.
pub fn shm_dial(name: &str, _opts: &DialOptions) -> Result<ShmPipe> {
    let conn_id = format!("{:016x}", rand::random::<u64>());
    let names = ShmNames::derive(name, &conn_id);

    let res = create_connection(&names)?;

    let handshake = UnixStream::connect(&names.bootstrap_path)
        .map_err(|e| {
            Status::io_error(format!(
                "bootstrap connect failed for {}: {e}",
                names.bootstrap_path.display()
            ))
        })
        .and_then(|mut stream| {
            stream
                .write_all(conn_id.as_bytes())
                .map_err(|e| Status::from_io("bootstrap id write", e))
        });

    if let Err(st) = handshake {
        unlink_connection(&names);
        return Err(st);
    }

    tracing::debug!(bus = %names.bus, conn = %conn_id, "shm connection established");
    Ok(ShmPipe::new(res, names, /*owner=*/ true, /*is_client=*/ true))
}

/// Remove a bus's bootstrap socket (crash recovery, best effort).
///
/// Per-connection regions and semaphores are unlinked by their dialler on
/// close; objects orphaned by a crash carry a random connection id and
/// cannot be enumerated portably, so they are left to the OS.
pub fn cleanup_bus(name: &str) -> Result<()> {
    let path = ShmNames::bootstrap_path_for(name);
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale bootstrap socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Status::io_error(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}

/// Dialler side: create region and semaphores under `names`.
fn create_connection(names: &ShmNames) -> Result<Resources> {
    let region = ShmRegion::create(&names.region, REGION_SIZE)?;

    let sems = (|| -> Result<_> {
        let c2s_items = NamedSemaphore::create(&names.c2s_items, 0)?;
        let c2s_spaces = NamedSemaphore::create(&names.c2s_spaces, SLOT_COUNT)?;
        let s2c_items = NamedSemaphore::create(&names.s2c_items, 0)?;
        let s2c_spaces = NamedSemaphore::create(&names.s2c_spaces, SLOT_COUNT)?;
        Ok((c2s_items, c2s_spaces, s2c_items, s2c_spaces))
    })();

    match sems {
        Ok((c2s_items, c2s_spaces, s2c_items, s2c_spaces)) => Ok(Resources {
            region,
            c2s_items,
            c2s_spaces,
            s2c_items,
            s2c_spaces,
        }),
        Err(st) => {
            drop(region);
            unlink_connection(names);
            Err(st)
        }
    }
}

/// Accepted side: open the dialler-created objects under `names`.
fn open_connection(names: ShmNames) -> Result<ShmPipe> {
    let region = ShmRegion::open(&names.region, REGION_SIZE)?;
    let c2s_items = NamedSemaphore::open(&names.c2s_items)?;
    let c2s_spaces = NamedSemaphore::open(&names.c2s_spaces)?;
    let s2c_items = NamedSemaphore::open(&names.s2c_items)?;
    let s2c_spaces = NamedSemaphore::open(&names.s2c_spaces)?;

    let res = Resources {
        region,
        c2s_items,
        c2s_spaces,
        s2c_items,
        s2c_spaces,
    };
    Ok(ShmPipe::new(res, names, /*owner=*/ false, /*is_client=*/ false))
}

fn unlink_connection(names: &ShmNames) {
    NamedSemaphore::unlink(&names.c2s_items);
    NamedSemaphore::unlink(&names.c2s_spaces);
    NamedSemaphore::unlink(&names.s2c_items);
    NamedSemaphore::unlink(&names.s2c_spaces);
    ShmRegion::unlink(&names.region);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_bus(tag: &str) -> String {
        format!("sluice_unit_{tag}_{}", std::process::id())
    }

    /// Build both ends of a connection directly, skipping the bootstrap
    /// socket.
    fn connected_pair(tag: &str) -> (ShmPipe, ShmPipe) {
        let names = ShmNames::derive(&test_bus(tag), "00112233aabbccdd");
        let res = create_connection(&names).expect("create connection");
        let client = ShmPipe::new(res, names.clone(), true, true);
        let server = open_connection(names).expect("open connection");
        (client, server)
    }

    #[test]
    fn ring_roundtrip_both_directions() {
        let (client, server) = connected_pair("echo");

        client
            .send(&Message::from_string("ping"), &SendOptions::default())
            .expect("client send");
        let got = server.recv(&RecvOptions::default()).expect("server recv");
        assert_eq!(got.as_slice(), b"ping");

        server
            .send(&Message::from_string("pong"), &SendOptions::default())
            .expect("server send");
        let got = client.recv(&RecvOptions::default()).expect("client recv");
        assert_eq!(got.as_slice(), b"pong");
    }

    #[test]
    fn zero_length_and_max_payload_roundtrip() {
        let (client, server) = connected_pair("bounds");
        let opts = SendOptions::default();

        client.send(&Message::new(), &opts).expect("empty send");
        let got = server.recv(&RecvOptions::default()).expect("empty recv");
        assert!(got.is_empty());

        let max = Message::from_vec(vec![b'x'; SLOT_PAYLOAD_MAX]);
        client.send(&max, &opts).expect("max send");
        let got = server.recv(&RecvOptions::default()).expect("max recv");
        assert_eq!(got.len(), SLOT_PAYLOAD_MAX);
        assert_eq!(got.as_slice(), max.as_slice());
    }

    #[test]
    fn oversized_message_is_invalid_argument() {
        let (client, _server) = connected_pair("oversize");
        let msg = Message::from_vec(vec![0u8; SLOT_PAYLOAD_MAX + 1]);
        let err = client
            .send(&msg, &SendOptions::default())
            .expect_err("must reject");
        assert_eq!(err.code(), sluice_types::StatusCode::InvalidArgument);
    }

    #[test]
    fn full_ring_send_times_out() {
        let (client, _server) = connected_pair("full");
        let opts = SendOptions::with_timeout(Duration::from_millis(50));
        let msg = Message::from_string("x");

        for i in 0..SLOT_COUNT {
            client
                .send(&msg, &opts)
                .unwrap_or_else(|e| panic!("send {i} should fit: {e}"));
        }
        let err = client.send(&msg, &opts).expect_err("ring is full");
        assert_eq!(err.code(), sluice_types::StatusCode::Timeout);
    }

    #[test]
    fn messages_preserve_order() {
        let (client, server) = connected_pair("order");
        for i in 0..100u32 {
            client
                .send(&Message::from_vec(i.to_le_bytes().to_vec()), &SendOptions::default())
                .expect("send");
            let got = server.recv(&RecvOptions::default()).expect("recv");
            assert_eq!(got.as_slice(), i.to_le_bytes());
        }
    }

    #[test]
    fn close_wakes_blocked_recv() {
        let (client, server) = connected_pair("wake");
        let server = Arc::new(server);

        let waiter = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.recv(&RecvOptions::default()))
        };
        std::thread::sleep(Duration::from_millis(50));
        client.close();

        let res = waiter.join().expect("join");
        let err = res.expect_err("recv must observe close");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let (client, server) = connected_pair("idem");
        client.close();
        client.close();
        let err = client
            .send(&Message::from_string("x"), &SendOptions::default())
            .expect_err("closed");
        assert_eq!(err.code(), sluice_types::StatusCode::Closed);
        drop(server);
    }
}
