//! Transparent network-syscall tracing, injected with `LD_PRELOAD`.
//!
//! The library interposes on `accept`, `connect`, `read`, `write`, `recv`,
//! `send`, `close`, and `pthread_create`. Each intercepted call is recorded
//! as a short OpenTelemetry span, each connected descriptor gets a lifecycle
//! span from `accept`/`connect` until `close`, and the tracing context of a
//! spawning thread is re-attached inside threads it creates. Spans are
//! exported over OTLP/gRPC; the host program's syscall behavior (return
//! values and errno included) is never changed.
//!
//! Activate it against an unmodified binary:
//!
//! ```text
//! LD_PRELOAD=target/release/libsocktrace_preload.so ./your-server
//! ```

#[cfg(not(test))]
mod abi;
mod addr;
mod errno;
mod guard;
mod hooks;
mod rawlog;
mod registry;
mod semconv;
mod spawn;
mod symbols;
mod telemetry;

#[cfg(not(test))]
mod lifecycle {
	use std::time::Duration;

	use crate::{guard, telemetry};

	/// Bring the pipeline up when the dynamic linker loads us, before the
	/// host's first call. A hook that somehow fires earlier initializes
	/// lazily on its own.
	#[ctor::ctor]
	fn preload_init() {
		guard::with_hooks_disabled(telemetry::ensure_initialized);
	}

	/// Flush what the batch processor still holds, bounded so a wedged
	/// collector cannot stall process exit.
	#[ctor::dtor]
	fn preload_shutdown() {
		guard::with_hooks_disabled(|| telemetry::shutdown(Duration::from_millis(500)));
	}
}
