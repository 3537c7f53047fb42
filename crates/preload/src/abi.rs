//! C ABI surface. When the library is preloaded these definitions shadow
//! libc's in the global dynamic symbol table; each forwards to its handler
//! in [`crate::hooks`]. The module is compiled out of test builds so the
//! test harness itself is not interposed.

use std::ffi::c_void;

use libc::{c_int, pthread_attr_t, pthread_t, size_t, sockaddr, socklen_t, ssize_t};

use crate::hooks;
use crate::spawn::StartRoutine;

/// # Safety
/// Same contract as libc `accept(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn accept(
	sockfd: c_int,
	addr: *mut sockaddr,
	addrlen: *mut socklen_t,
) -> c_int {
	unsafe { hooks::accept(sockfd, addr, addrlen) }
}

/// # Safety
/// Same contract as libc `connect(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn connect(sockfd: c_int, addr: *const sockaddr, addrlen: socklen_t) -> c_int {
	unsafe { hooks::connect(sockfd, addr, addrlen) }
}

/// # Safety
/// Same contract as libc `read(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
	unsafe { hooks::read(fd, buf, count) }
}

/// # Safety
/// Same contract as libc `write(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
	unsafe { hooks::write(fd, buf, count) }
}

/// # Safety
/// Same contract as libc `recv(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
	unsafe { hooks::recv(fd, buf, len, flags) }
}

/// # Safety
/// Same contract as libc `send(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
	unsafe { hooks::send(fd, buf, len, flags) }
}

/// # Safety
/// Same contract as libc `close(2)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
	unsafe { hooks::close(fd) }
}

/// # Safety
/// Same contract as `pthread_create(3)`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn pthread_create(
	thread: *mut pthread_t,
	attr: *const pthread_attr_t,
	start_routine: StartRoutine,
	arg: *mut c_void,
) -> c_int {
	unsafe { hooks::pthread_create(thread, attr, start_routine, arg) }
}
