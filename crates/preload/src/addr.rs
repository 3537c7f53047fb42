//! Socket address decoding for peer identification.

use std::mem;
use std::net::SocketAddr;

use libc::{c_int, sockaddr, sockaddr_storage, socklen_t};
use socket2::{SockAddr, SockAddrStorage};

/// Decode a caller-supplied address buffer. `len` is whatever the syscall
/// reported and may exceed the storage it actually filled, so it is capped
/// before copying.
pub(crate) unsafe fn decode(addr: *const sockaddr, len: socklen_t) -> Option<SocketAddr> {
	if addr.is_null() || len == 0 {
		return None;
	}
	let mut storage = SockAddrStorage::zeroed();
	let copied = (len as usize).min(mem::size_of::<sockaddr_storage>());
	unsafe {
		let raw = storage.view_as::<sockaddr_storage>() as *mut sockaddr_storage;
		std::ptr::copy_nonoverlapping(addr.cast::<u8>(), raw.cast::<u8>(), copied);
	}
	let addr = unsafe { SockAddr::new(storage, copied as socklen_t) };
	addr.as_socket()
}

/// Peer of an already-connected socket, for `accept` callers that pass a
/// null out-parameter.
pub(crate) fn peer_of_fd(fd: c_int) -> Option<SocketAddr> {
	let mut storage = SockAddrStorage::zeroed();
	let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;
	let rc = unsafe {
		let raw = storage.view_as::<sockaddr_storage>() as *mut sockaddr_storage;
		libc::getpeername(fd, raw.cast(), &raw mut len)
	};
	if rc != 0 {
		return None;
	}
	let addr = unsafe { SockAddr::new(storage, len) };
	addr.as_socket()
}

#[cfg(test)]
#[path = "addr_tests.rs"]
mod tests;
