//! In-memory layout of the shared region and the naming scheme for the
//! kernel objects backing it.

use std::path::PathBuf;
use std::sync::atomic::AtomicU32;

/// Maximum payload per ring slot. Matches the wire-frame ceiling so a
/// message that fits one transport fits them all.
pub const SLOT_PAYLOAD_MAX: usize = 64 * 1024;

/// Slots per ring: 64 * 64 KiB = 4 MiB payload capacity per direction.
pub const SLOT_COUNT: u32 = 64;

/// Ring metadata. `head` is the monotonic producer index, `tail` the
/// monotonic consumer index; both are taken modulo [`SLOT_COUNT`] for
/// slot selection and never wrap meaningfully within a session.
#[repr(C, align(64))]
pub struct RingMeta {
    pub head: AtomicU32,
    pub tail: AtomicU32,
}

/// One fixed-size message slot.
#[repr(C)]
pub struct Slot {
    pub len: u32,
    pub _pad: u32,
    pub data: [u8; SLOT_PAYLOAD_MAX],
}

/// A single-direction ring: cache-line-aligned metadata then the slots.
#[repr(C)]
pub struct Ring {
    pub meta: RingMeta,
    pub slots: [Slot; SLOT_COUNT as usize],
}

/// The full mapped region: client→server ring, then server→client ring.
#[repr(C)]
pub struct ShmLayout {
    pub c2s: Ring,
    pub s2c: Ring,
}

/// Total region size; deterministic from the layout constants.
pub const REGION_SIZE: usize = std::mem::size_of::<ShmLayout>();

const _: () = assert!(std::mem::size_of::<RingMeta>() == 64);
const _: () = assert!(std::mem::size_of::<Slot>() == 8 + SLOT_PAYLOAD_MAX);
const _: () = assert!(
    std::mem::size_of::<Ring>() == 64 + SLOT_COUNT as usize * (8 + SLOT_PAYLOAD_MAX)
);
const _: () = assert!(REGION_SIZE == 2 * std::mem::size_of::<Ring>());
const _: () = assert!(std::mem::align_of::<ShmLayout>() == 64);

/// Derived names for one connection's kernel objects.
///
/// POSIX keeps shm/sem names short (macOS limits them to ~31 bytes), so
/// identifiers are built from a single-byte prefix, an 8-hex FNV-1a hash
/// of the sanitised bus name, and the leading 8 hex digits of the
/// connection id. The bootstrap socket path depends only on the bus hash
/// so any dialler can find any listener for the same bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNames {
    /// Sanitised bus name.
    pub bus: String,
    /// 16-hex-digit connection id.
    pub conn_id: String,
    /// `shm_open` name (leading '/').
    pub region: String,
    /// `sem_open` names (leading '/').
    pub c2s_items: String,
    pub c2s_spaces: String,
    pub s2c_items: String,
    pub s2c_spaces: String,
    /// Filesystem path of the bootstrap unix socket.
    pub bootstrap_path: PathBuf,
}

impl ShmNames {
    /// Derive every object name for `(bus_name, conn_id)`.
    pub fn derive(bus_name: &str, conn_id: &str) -> Self {
        let bus = sanitize_bus_name(bus_name);
        let hash8 = format!("{:08x}", fnv1a_32(bus.as_bytes()));
        let conn8 = &conn_id[..conn_id.len().min(8)];
        let prefix = format!("d{hash8}{conn8}");

        Self {
            bus,
            conn_id: conn_id.to_string(),
            region: format!("/{prefix}m"),
            c2s_items: format!("/{prefix}a"),
            c2s_spaces: format!("/{prefix}b"),
            s2c_items: format!("/{prefix}c"),
            s2c_spaces: format!("/{prefix}d"),
            bootstrap_path: bootstrap_path_for_hash(&hash8),
        }
    }

    /// The bootstrap socket path for a bus, independent of any connection.
    pub fn bootstrap_path_for(bus_name: &str) -> PathBuf {
        let bus = sanitize_bus_name(bus_name);
        bootstrap_path_for_hash(&format!("{:08x}", fnv1a_32(bus.as_bytes())))
    }
}

fn bootstrap_path_for_hash(hash8: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sluice_shm_{hash8}.sock"))
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`; an empty
/// result falls back to "sluice".
fn sanitize_bus_name(name: &str) -> String {
    let out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() {
        "sluice".to_string()
    } else {
        out
    }
}

/// FNV-1a, 32-bit.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
