//! Value types shared by every layer of the crate.
//!
//! None of these types interpret the bits they carry beyond naming them:
//! flags the host sets that are unknown to this crate are retained verbatim.

use std::fmt;
use std::path::{Path, PathBuf};

/// Position in the host's change history.
///
/// Ids grow monotonically, either globally or per device. Two values are
/// reserved as starting cursors for a stream: [`EventId::SINCE_NOW`] and
/// [`EventId::SINCE_ALL`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl EventId {
    /// Observe only events that happen after the stream starts.
    pub const SINCE_NOW: EventId = EventId(u64::MAX);

    /// Replay everything the device has recorded, then continue live.
    pub const SINCE_ALL: EventId = EventId(0);

    pub fn is_since_now(self) -> bool {
        self == Self::SINCE_NOW
    }
}

impl From<u64> for EventId {
    fn from(raw: u64) -> Self {
        EventId(raw)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_since_now() {
            f.write_str("since-now")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Host file-system device identifier, as reported by `stat(2)`.
///
/// `Device(0)` is what a stream that was not created relative to a device
/// reports as its device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Device(pub u64);

impl Device {
    /// Reads the device a path lives on.
    #[cfg(unix)]
    pub fn of(path: &Path) -> std::io::Result<Device> {
        use std::os::unix::fs::MetadataExt;

        Ok(Device(std::fs::metadata(path)?.dev()))
    }
}

impl From<u64> for Device {
    fn from(raw: u64) -> Self {
        Device(raw)
    }
}

bitflags::bitflags! {
    /// Behaviour flags handed to the host when a stream is created.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CreateFlags: u32 {
        /// Deliver the first event of a quiet period immediately instead of
        /// waiting out the coalescing latency.
        const NO_DEFER = 0x0000_0002;
        /// Report changes to the watched roots themselves (moves, deletes).
        const WATCH_ROOT = 0x0000_0004;
        /// Suppress events caused by the current process.
        const IGNORE_SELF = 0x0000_0008;
        /// Report individual files rather than their parent directories.
        const FILE_EVENTS = 0x0000_0010;

        const _ = !0;
    }
}

impl CreateFlags {
    /// Asks the host for `CFStringRef` paths instead of C strings. The bridge
    /// only understands C strings, so this bit is always cleared.
    pub(crate) const USE_CF_TYPES: u32 = 0x0000_0001;

    /// The bitmask actually passed to the host.
    pub fn native_bits(self) -> u32 {
        self.bits() & !Self::USE_CF_TYPES
    }
}

impl Default for CreateFlags {
    fn default() -> Self {
        CreateFlags::NO_DEFER | CreateFlags::FILE_EVENTS
    }
}

bitflags::bitflags! {
    /// Per-event markers attached by the host to every delivered path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventFlags: u32 {
        const MUST_SCAN_SUBDIRS = 0x0000_0001;
        const USER_DROPPED = 0x0000_0002;
        const KERNEL_DROPPED = 0x0000_0004;
        const EVENT_IDS_WRAPPED = 0x0000_0008;
        const HISTORY_DONE = 0x0000_0010;
        const ROOT_CHANGED = 0x0000_0020;
        const MOUNT = 0x0000_0040;
        const UNMOUNT = 0x0000_0080;

        const CREATED = 0x0000_0100;
        const REMOVED = 0x0000_0200;
        const INODE_META_MOD = 0x0000_0400;
        const RENAMED = 0x0000_0800;
        const MODIFIED = 0x0000_1000;
        const FINDER_INFO_MOD = 0x0000_2000;
        const OWNER_CHANGED = 0x0000_4000;
        const XATTR_MOD = 0x0000_8000;
        const IS_FILE = 0x0001_0000;
        const IS_DIR = 0x0002_0000;
        const IS_SYMLINK = 0x0004_0000;
        const OWN_EVENT = 0x0008_0000;
        const IS_HARDLINK = 0x0010_0000;
        const IS_LAST_HARDLINK = 0x0020_0000;
        const CLONED = 0x0040_0000;

        const _ = !0;
    }
}

impl EventFlags {
    /// Keeps every bit, named or not.
    pub fn from_native(raw: u32) -> Self {
        EventFlags::from_bits_retain(raw)
    }
}

/// One changed path inside a delivered batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Zero when the host delivered the batch without ids.
    pub id: EventId,
    pub path: PathBuf,
    pub flags: EventFlags,
}

impl Event {
    /// True when this entry reports one of the stream's roots rather than
    /// something below it.
    pub fn is_root(&self, root: &Path) -> bool {
        self.path == root
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({:#x})",
            self.id,
            self.path.display(),
            self.flags.bits()
        )
    }
}

/// Everything the host handed over in one callback, in host order.
pub type Batch = Vec<Event>;
