//! Attribute keys shared by the syscall and connection spans.

use opentelemetry::Key;

pub(crate) static SYSCALL: Key = Key::from_static_str("syscall");
pub(crate) static SOCK_FD: Key = Key::from_static_str("net.sock.fd");
pub(crate) static PEER_IP: Key = Key::from_static_str("net.peer.ip");
pub(crate) static PEER_PORT: Key = Key::from_static_str("net.peer.port");
pub(crate) static TRANSPORT: Key = Key::from_static_str("net.transport");
pub(crate) static IO_REQUESTED: Key = Key::from_static_str("io.requested");
pub(crate) static IO_READ: Key = Key::from_static_str("io.read");
pub(crate) static IO_WRITTEN: Key = Key::from_static_str("io.written");
pub(crate) static RECV_FLAGS: Key = Key::from_static_str("recv.flags");
pub(crate) static SEND_FLAGS: Key = Key::from_static_str("send.flags");
pub(crate) static ERRNO: Key = Key::from_static_str("errno");
pub(crate) static LIFECYCLE_EVENT: Key = Key::from_static_str("lifecycle.event");
pub(crate) static CLOSE_REASON: Key = Key::from_static_str("lifecycle.close_reason");
pub(crate) static BYTES: Key = Key::from_static_str("bytes");

pub(crate) const TRANSPORT_TCP: &str = "ip_tcp";
