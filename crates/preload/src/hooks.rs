//! Interceptor bodies for the hooked libc entry points.
//!
//! Every handler follows the same skeleton: claim the reentrancy guard (or
//! degrade to a passthrough), make sure the pipeline is up, resolve the real
//! function, open a syscall span, invoke the real call, record the outcome,
//! end the span, and restore the errno the real call left behind. The
//! C-ABI exports forwarding here live in `abi.rs`.

use std::ffi::c_void;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};

use libc::{c_int, size_t, sockaddr, socklen_t, ssize_t};
use opentelemetry::trace::{Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, ContextGuard, KeyValue};

use crate::guard::ReentryGuard;
use crate::registry::{self, CloseReason, Connection, Direction, Role};
use crate::spawn::{SpawnCapsule, StartRoutine, trampoline};
use crate::{addr, errno, semconv, symbols, telemetry};

/// One syscall span together with its context attachment. All telemetry work
/// runs under `catch_unwind`: a panic anywhere in the tracing stack must
/// never change what the caller observes.
struct SyscallScope {
	cx: Context,
	scope: ContextGuard,
}

impl SyscallScope {
	fn open(
		span_name: &'static str,
		syscall: &'static str,
		fd: Option<c_int>,
		extra: Vec<KeyValue>,
	) -> Option<SyscallScope> {
		let tracer = telemetry::tracer()?;
		catch_unwind(AssertUnwindSafe(|| {
			let mut attributes = vec![KeyValue::new(semconv::SYSCALL.clone(), syscall)];
			if let Some(fd) = fd {
				attributes.push(KeyValue::new(semconv::SOCK_FD.clone(), fd as i64));
			}
			attributes.extend(extra);
			let span = tracer
				.span_builder(span_name)
				.with_attributes(attributes)
				.start(tracer);
			let cx = Context::current_with_span(span);
			let scope = cx.clone().attach();
			SyscallScope { cx, scope }
		}))
		.ok()
	}

	/// Records the outcome and ends the span. `on_success` runs only for a
	/// successful return and is where registry updates happen; `error` is
	/// the errno (or, for `pthread_create`, the returned error code).
	fn finish(self, ok: bool, error: c_int, on_success: impl FnOnce(&Context)) {
		let SyscallScope { cx, scope } = self;
		let _ = catch_unwind(AssertUnwindSafe(|| {
			if ok {
				cx.span().set_status(Status::Ok);
				on_success(&cx);
			} else {
				cx.span().set_status(Status::error(errno::describe(error)));
				cx.span()
					.set_attribute(KeyValue::new(semconv::ERRNO.clone(), error as i64));
			}
			drop(scope);
			cx.span().end();
		}));
	}
}

fn peer_attrs(peer: Option<SocketAddr>, attributes: &mut Vec<KeyValue>) {
	if let Some(peer) = peer {
		attributes.push(KeyValue::new(semconv::PEER_IP.clone(), peer.ip().to_string()));
		attributes.push(KeyValue::new(semconv::PEER_PORT.clone(), peer.port() as i64));
	}
}

/// Starts the long-lived connection span for a descriptor first observed as
/// connected. Runs while the syscall span is attached, so the lifecycle span
/// parents to the syscall that produced the descriptor.
fn open_connection(fd: c_int, role: Role, peer: Option<SocketAddr>, why: &'static str) {
	let Some(tracer) = telemetry::tracer() else {
		return;
	};
	let mut attributes = vec![
		KeyValue::new(semconv::TRANSPORT.clone(), semconv::TRANSPORT_TCP),
		KeyValue::new(semconv::SOCK_FD.clone(), fd as i64),
		KeyValue::new(semconv::LIFECYCLE_EVENT.clone(), why),
	];
	peer_attrs(peer, &mut attributes);
	let span = tracer
		.span_builder(role.span_name())
		.with_attributes(attributes)
		.start(tracer);
	registry::global().insert(fd, Connection { span, peer });
}

/// Shared tail for the I/O quartet: span around the real call, byte counts
/// on success, connection-span annotation when the descriptor is known.
fn io_call(
	span_name: &'static str,
	syscall: &'static str,
	fd: c_int,
	requested: size_t,
	flags: Option<c_int>,
	direction: Direction,
	invoke: impl FnOnce() -> ssize_t,
) -> ssize_t {
	let mut extra = vec![KeyValue::new(
		semconv::IO_REQUESTED.clone(),
		requested as i64,
	)];
	if let Some(flags) = flags {
		let key = match direction {
			Direction::In => &semconv::RECV_FLAGS,
			Direction::Out => &semconv::SEND_FLAGS,
		};
		extra.push(KeyValue::new(key.clone(), flags as i64));
	}
	let scope = SyscallScope::open(span_name, syscall, Some(fd), extra);
	let n = invoke();
	let saved = errno::get();
	if let Some(scope) = scope {
		scope.finish(n >= 0, saved, |cx| {
			let key = match direction {
				Direction::In => &semconv::IO_READ,
				Direction::Out => &semconv::IO_WRITTEN,
			};
			cx.span().set_attribute(KeyValue::new(key.clone(), n as i64));
			registry::global().annotate(fd, direction, n as u64);
		});
	}
	errno::set(saved);
	n
}

pub(crate) unsafe fn accept(
	sockfd: c_int,
	addr_out: *mut sockaddr,
	len_out: *mut socklen_t,
) -> c_int {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_accept() {
			Some(real) => unsafe { real(sockfd, addr_out, len_out) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_accept() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	let scope = SyscallScope::open("sys.accept", "accept", Some(sockfd), Vec::new());
	let client = unsafe { real(sockfd, addr_out, len_out) };
	let saved = errno::get();
	if let Some(scope) = scope {
		scope.finish(client >= 0, saved, |cx| {
			let peer = if !addr_out.is_null() && !len_out.is_null() {
				unsafe { addr::decode(addr_out, *len_out) }
			} else {
				addr::peer_of_fd(client)
			};
			let mut attributes = Vec::new();
			peer_attrs(peer, &mut attributes);
			for attribute in attributes {
				cx.span().set_attribute(attribute);
			}
			open_connection(client, Role::Server, peer, "accept");
		});
	}
	errno::set(saved);
	client
}

pub(crate) unsafe fn connect(fd: c_int, addr_in: *const sockaddr, len: socklen_t) -> c_int {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_connect() {
			Some(real) => unsafe { real(fd, addr_in, len) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_connect() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	let peer = unsafe { addr::decode(addr_in, len) };
	let mut extra = Vec::new();
	peer_attrs(peer, &mut extra);
	let scope = SyscallScope::open("sys.connect", "connect", Some(fd), extra);
	let rc = unsafe { real(fd, addr_in, len) };
	let saved = errno::get();
	if let Some(scope) = scope {
		scope.finish(rc == 0, saved, |_| {
			open_connection(fd, Role::Client, peer, "connect");
		});
	}
	errno::set(saved);
	rc
}

pub(crate) unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_read() {
			Some(real) => unsafe { real(fd, buf, count) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_read() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	io_call("sys.read", "read", fd, count, None, Direction::In, || unsafe {
		real(fd, buf, count)
	})
}

pub(crate) unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_write() {
			Some(real) => unsafe { real(fd, buf, count) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_write() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	io_call("sys.write", "write", fd, count, None, Direction::Out, || unsafe {
		real(fd, buf, count)
	})
}

pub(crate) unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_recv() {
			Some(real) => unsafe { real(fd, buf, len, flags) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_recv() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	io_call(
		"sys.recv",
		"recv",
		fd,
		len,
		Some(flags),
		Direction::In,
		|| unsafe { real(fd, buf, len, flags) },
	)
}

pub(crate) unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_send() {
			Some(real) => unsafe { real(fd, buf, len, flags) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_send() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	io_call(
		"sys.send",
		"send",
		fd,
		len,
		Some(flags),
		Direction::Out,
		|| unsafe { real(fd, buf, len, flags) },
	)
}

pub(crate) unsafe fn close(fd: c_int) -> c_int {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_close() {
			Some(real) => unsafe { real(fd) },
			None => {
				errno::set(libc::ENOSYS);
				-1
			}
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_close() else {
		errno::set(libc::ENOSYS);
		return -1;
	};
	// the peer has to come from the registry before the descriptor is gone
	let mut extra = Vec::new();
	peer_attrs(registry::global().peer_of(fd), &mut extra);
	let scope = SyscallScope::open("sys.close", "close", Some(fd), extra);
	let rc = unsafe { real(fd) };
	let saved = errno::get();
	if let Some(scope) = scope {
		scope.finish(rc == 0, saved, |_| {
			registry::global().end_and_remove(fd, CloseReason::Close);
		});
	}
	errno::set(saved);
	rc
}

/// `pthread_create` reports errors through its return value, not errno. The
/// capsule is reclaimed here when thread creation fails; otherwise the
/// trampoline owns it.
pub(crate) unsafe fn pthread_create(
	thread: *mut libc::pthread_t,
	attr: *const libc::pthread_attr_t,
	start: StartRoutine,
	arg: *mut c_void,
) -> c_int {
	let Some(_reentry) = ReentryGuard::enter() else {
		return match symbols::real_pthread_create() {
			Some(real) => unsafe { real(thread, attr, start, arg) },
			None => libc::ENOSYS,
		};
	};
	telemetry::ensure_initialized();
	let Some(real) = symbols::real_pthread_create() else {
		return libc::ENOSYS;
	};
	let capsule = Box::into_raw(SpawnCapsule::capture(start, arg));
	let scope = SyscallScope::open("thread.create", "pthread_create", None, Vec::new());
	let rc = unsafe { real(thread, attr, trampoline, capsule.cast()) };
	let saved = errno::get();
	if rc != 0 {
		drop(unsafe { Box::from_raw(capsule) });
	}
	if let Some(scope) = scope {
		scope.finish(rc == 0, rc, |_| {});
	}
	errno::set(saved);
	rc
}

#[cfg(test)]
#[path = "hooks_tests.rs"]
mod tests;
