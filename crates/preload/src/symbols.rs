//! Lookup of the real libc entry points, bypassing our own replacements.

use std::ffi::{CStr, c_void};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use libc::{c_int, size_t, sockaddr, socklen_t, ssize_t};

use crate::rawlog;
use crate::spawn::StartRoutine;

pub(crate) type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub(crate) type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub(crate) type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub(crate) type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub(crate) type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
pub(crate) type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
pub(crate) type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub(crate) type PthreadCreateFn = unsafe extern "C" fn(
	*mut libc::pthread_t,
	*const libc::pthread_attr_t,
	StartRoutine,
	*mut c_void,
) -> c_int;

/// One interposed entry point: the next definition of `name` in the dynamic
/// symbol chain, resolved once and cached for the life of the process.
pub(crate) struct RealFn {
	name: &'static CStr,
	ptr: AtomicPtr<c_void>,
	warned: AtomicBool,
}

impl RealFn {
	pub(crate) const fn new(name: &'static CStr) -> RealFn {
		RealFn {
			name,
			ptr: AtomicPtr::new(ptr::null_mut()),
			warned: AtomicBool::new(false),
		}
	}

	/// Cached `dlsym(RTLD_NEXT)` lookup. Null on failure, reported once per
	/// symbol.
	pub(crate) fn resolve(&self) -> *mut c_void {
		let cached = self.ptr.load(Ordering::Acquire);
		if !cached.is_null() {
			return cached;
		}
		let found = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) };
		if found.is_null() {
			if !self.warned.swap(true, Ordering::Relaxed) {
				rawlog::line(&format!(
					"[socktrace] dlsym failed for {}",
					self.name.to_string_lossy()
				));
			}
			return ptr::null_mut();
		}
		self.ptr.store(found, Ordering::Release);
		found
	}
}

macro_rules! real_fn {
	($cell:ident, $getter:ident, $name:literal, $ty:ty) => {
		static $cell: RealFn = RealFn::new($name);

		pub(crate) fn $getter() -> Option<$ty> {
			let ptr = $cell.resolve();
			if ptr.is_null() {
				None
			} else {
				Some(unsafe { mem::transmute::<*mut c_void, $ty>(ptr) })
			}
		}
	};
}

real_fn!(ACCEPT, real_accept, c"accept", AcceptFn);
real_fn!(CONNECT, real_connect, c"connect", ConnectFn);
real_fn!(READ, real_read, c"read", ReadFn);
real_fn!(WRITE, real_write, c"write", WriteFn);
real_fn!(RECV, real_recv, c"recv", RecvFn);
real_fn!(SEND, real_send, c"send", SendFn);
real_fn!(CLOSE, real_close, c"close", CloseFn);
real_fn!(
	PTHREAD_CREATE,
	real_pthread_create,
	c"pthread_create",
	PthreadCreateFn
);

/// Warm every cache slot during initialization so the hooks normally never
/// pay the dlsym cost. Hooks still lazy-resolve in case one fires first.
pub(crate) fn resolve_all() {
	ACCEPT.resolve();
	CONNECT.resolve();
	READ.resolve();
	WRITE.resolve();
	RECV.resolve();
	SEND.resolve();
	CLOSE.resolve();
	PTHREAD_CREATE.resolve();
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolves_and_caches_known_symbols() {
		let first = READ.resolve();
		assert!(!first.is_null());
		assert_eq!(READ.resolve(), first);
		assert!(real_read().is_some());
	}

	#[test]
	fn unknown_symbol_stays_null() {
		static BOGUS: RealFn = RealFn::new(c"socktrace_no_such_symbol");
		assert!(BOGUS.resolve().is_null());
		// second lookup takes the already-warned path
		assert!(BOGUS.resolve().is_null());
	}

	#[test]
	fn resolve_all_covers_the_hooked_set() {
		resolve_all();
		assert!(real_accept().is_some());
		assert!(real_connect().is_some());
		assert!(real_write().is_some());
		assert!(real_recv().is_some());
		assert!(real_send().is_some());
		assert!(real_close().is_some());
		assert!(real_pthread_create().is_some());
	}
}
