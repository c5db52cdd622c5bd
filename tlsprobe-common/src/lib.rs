//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the key and value layouts of the `OFFSETS_DATA` map and the names
//! of the uprobe programs the userspace manager attaches. All types use
//! `#[repr(C)]` for consistent memory layout across the kernel/userspace
//! boundary.
//!
//! ## Key Types
//!
//! - [`TlsBinaryId`] - Identity of a hooked executable (device + inode)
//! - [`TlsOffsetsData`] - Result of binary analysis consumed by the hooks
//! - [`TlsConnLayout`] - Field offsets needed to walk from `tls.Conn` to the socket fd

#![no_std]

// ============================================================================
// Map and Program Names
// ============================================================================

/// Hash map holding one [`TlsOffsetsData`] per hooked binary
pub const OFFSETS_DATA_MAP: &str = "OFFSETS_DATA";

/// Maximum number of binaries that can be hooked at the same time
///
/// Must match the `max_entries` of `OFFSETS_DATA` on the eBPF side.
pub const MAX_HOOKED_BINARIES: u32 = 1024;

/// Entry of `crypto/tls.(*Conn).Read`
pub const PROBE_CONN_READ: &str = "uprobe__crypto_tls_Conn_Read";

/// Every `ret` instruction of `crypto/tls.(*Conn).Read`
pub const PROBE_CONN_READ_RETURN: &str = "uprobe__crypto_tls_Conn_Read__return";

/// Entry of `crypto/tls.(*Conn).Write`
pub const PROBE_CONN_WRITE: &str = "uprobe__crypto_tls_Conn_Write";

/// Every `ret` instruction of `crypto/tls.(*Conn).Write`
pub const PROBE_CONN_WRITE_RETURN: &str = "uprobe__crypto_tls_Conn_Write__return";

/// Entry of `crypto/tls.(*Conn).Close`
pub const PROBE_CONN_CLOSE: &str = "uprobe__crypto_tls_Conn_Close";

// ============================================================================
// ABI Constants
// ============================================================================

/// Arguments are passed on the goroutine stack (Go < 1.17 on amd64)
pub const GO_ABI_STACK: u8 = 0;

/// Arguments are passed in registers (`ABIInternal`)
pub const GO_ABI_REGISTER: u8 = 1;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Key of the `OFFSETS_DATA` map
///
/// The device number is split the same way the kernel exposes it through
/// `inode->i_sb->s_dev`, so the eBPF side can build the key from the task's
/// `exe_file` without any userspace help.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TlsBinaryId {
    /// Major number of the device holding the executable
    pub id_major: u32,

    /// Minor number of the device holding the executable
    pub id_minor: u32,

    /// Inode number of the executable
    pub ino: u64,
}

/// Offsets of the fields traversed from a `*tls.Conn` down to the raw socket
///
/// `tls.Conn.conn` → `net.TCPConn.conn` → `net.conn.fd` → `net.netFD.pfd`
/// → `poll.FD.Sysfd`
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsConnLayout {
    /// `crypto/tls.Conn.conn` (the inner `net.Conn` interface)
    pub tls_conn_inner_conn_offset: u64,

    /// `net.TCPConn.conn` (embedded `net.conn`)
    pub tcp_conn_inner_conn_offset: u64,

    /// `net.conn.fd` (`*net.netFD`)
    pub conn_fd_offset: u64,

    /// `net.netFD.pfd` (embedded `poll.FD`)
    pub net_fd_pfd_offset: u64,

    /// `internal/poll.FD.Sysfd`
    pub fd_sysfd_offset: u64,
}

/// Value of the `OFFSETS_DATA` map
///
/// Written once per binary generation before any hook is attached, removed
/// when the last process running the binary exits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlsOffsetsData {
    /// Struct layout needed to recover the socket of a TLS connection
    pub conn_layout: TlsConnLayout,

    /// Go toolchain major version (always 1 today)
    pub go_version_major: u16,

    /// Go toolchain minor version (e.g. 21 for go1.21.5)
    pub go_version_minor: u16,

    /// Calling convention (`GO_ABI_STACK` or `GO_ABI_REGISTER`)
    pub abi: u8,

    /// Padding for 8-byte alignment
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 3],
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod ensures these types can be copied into eBPF maps as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TlsBinaryId {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TlsOffsetsData {}
