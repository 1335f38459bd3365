//! Shared-memory ring transport for co-located processes.
//!
//! A connection is two single-producer/single-consumer fixed-slot rings in
//! one mapped region (client→server and server→client), paired with named
//! counting semaphores for blocking on full/empty. A filesystem unix
//! socket is used only for connection bootstrap: the dialler creates the
//! region and semaphores under a fresh connection id, then hands the id to
//! the listener over the bootstrap socket so both sides open the same
//! kernel objects.
//!
//! Counting semaphores are the sole capacity arbiter; the ring head/tail
//! indices are monotonic atomics with release/acquire pairing and carry no
//! capacity implication.

#![cfg(unix)]

mod layout;
mod mmap;
mod sem;
mod transport;

pub use layout::{REGION_SIZE, SLOT_COUNT, SLOT_PAYLOAD_MAX, ShmNames};
pub use mmap::ShmRegion;
pub use sem::NamedSemaphore;
pub use transport::{ShmListener, ShmPipe, cleanup_bus, shm_dial, shm_listen};
