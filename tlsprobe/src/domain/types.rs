//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep process IDs, binary identities, hook handles
//! and registry generations from being mixed up in function signatures.

use std::fmt;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use tlsprobe_common::TlsBinaryId;

/// Process ID
///
/// Represents a process ID (TGID) in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Identity of an executable image
///
/// `(device, inode)` of the file a process is executing. Stable across bind
/// mounts and mount namespaces, so two processes that see the same binary
/// through different paths share one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BinaryId {
    pub dev: u64,
    pub inode: u64,
}

impl BinaryId {
    #[must_use]
    pub fn new(dev: u64, inode: u64) -> Self {
        Self { dev, inode }
    }

    /// Build the identity from `stat(2)` metadata
    #[must_use]
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self { dev: meta.dev(), inode: meta.ino() }
    }

    /// Key used for this binary in the `OFFSETS_DATA` eBPF map
    #[must_use]
    #[allow(clippy::useless_conversion)]
    pub fn to_map_key(self) -> TlsBinaryId {
        let dev = self.dev as libc::dev_t;
        TlsBinaryId {
            id_major: libc::major(dev).into(),
            id_minor: libc::minor(dev).into(),
            ino: self.inode,
        }
    }
}

impl fmt::Display for BinaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{} ino:{}", self.dev, self.inode)
    }
}

/// Opaque handle of one installed hook
///
/// Issued by a [`crate::hooks::HookAttacher`] and only meaningful to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(pub u64);

impl fmt::Display for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// Where in a function a hook fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// First instruction of the function
    Entry,
    /// One of the function's `ret` instructions
    Return,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Entry => f.write_str("entry"),
            ProbeKind::Return => f.write_str("return"),
        }
    }
}

/// Registry generation of a binary
///
/// A new generation starts every time the process count of a binary goes
/// from 0 to 1. Work scheduled for an older generation must never touch the
/// state of a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}
