//! What to look up in a Go binary to hook `crypto/tls`

use super::FieldSpec;
use super::FunctionSpec;

pub const READ_FUNC: &str = "crypto/tls.(*Conn).Read";
pub const WRITE_FUNC: &str = "crypto/tls.(*Conn).Write";
pub const CLOSE_FUNC: &str = "crypto/tls.(*Conn).Close";

/// Functions to locate; Read and Write are also hooked on return to capture
/// the byte count and the buffer contents
pub const FUNCTIONS: [FunctionSpec; 3] = [
    FunctionSpec { name: READ_FUNC, include_returns: true },
    FunctionSpec { name: WRITE_FUNC, include_returns: true },
    FunctionSpec { name: CLOSE_FUNC, include_returns: false },
];

/// `tls.Conn.conn`: the `net.Conn` the TLS session runs over
pub const TLS_CONN_INNER_CONN: FieldSpec =
    FieldSpec { struct_name: "crypto/tls.Conn", field_name: "conn" };

/// `net.TCPConn.conn`: embedded `net.conn`
pub const TCP_CONN_INNER_CONN: FieldSpec =
    FieldSpec { struct_name: "net.TCPConn", field_name: "conn" };

/// `net.conn.fd`
pub const CONN_FD: FieldSpec = FieldSpec { struct_name: "net.conn", field_name: "fd" };

/// `net.netFD.pfd`
pub const NET_FD_PFD: FieldSpec = FieldSpec { struct_name: "net.netFD", field_name: "pfd" };

/// `poll.FD.Sysfd`: the socket file descriptor
pub const FD_SYSFD: FieldSpec =
    FieldSpec { struct_name: "internal/poll.FD", field_name: "Sysfd" };

/// Struct members walked from a `*tls.Conn` to the socket fd, in walk order
pub const STRUCT_FIELDS: [FieldSpec; 5] =
    [TLS_CONN_INNER_CONN, TCP_CONN_INNER_CONN, CONN_FD, NET_FD_PFD, FD_SYSFD];
