//! Tracing-context propagation into threads created by the host program.

use std::ffi::c_void;

use opentelemetry::Context;

pub(crate) type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// Everything the trampoline needs inside the new thread: the caller's start
/// routine and argument, plus a snapshot of the tracing context that was
/// current when `pthread_create` was intercepted.
pub(crate) struct SpawnCapsule {
	start: StartRoutine,
	arg: *mut c_void,
	context: Context,
}

impl SpawnCapsule {
	pub(crate) fn capture(start: StartRoutine, arg: *mut c_void) -> Box<SpawnCapsule> {
		Box::new(SpawnCapsule {
			start,
			arg,
			context: Context::current(),
		})
	}
}

/// Substituted as the thread's start routine. Re-attaches the captured
/// context so spans opened by the user routine link into the spawning
/// thread's trace, and detaches it again when the routine returns. The
/// capsule is consumed by value here, before user code runs; the failure
/// path in the interceptor reclaims it instead.
pub(crate) extern "C" fn trampoline(raw: *mut c_void) -> *mut c_void {
	let capsule = unsafe { Box::from_raw(raw.cast::<SpawnCapsule>()) };
	let SpawnCapsule {
		start,
		arg,
		context,
	} = *capsule;
	let _scope = context.attach();
	start(arg)
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
