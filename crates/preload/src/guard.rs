use std::cell::Cell;

thread_local! {
	static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Per-thread reentrancy guard. While a thread holds one, every interceptor
/// entered on that thread degrades to a passthrough of the real libc call.
/// The exporter's own gRPC traffic goes through the same interposed symbols;
/// without this the first exported span would recurse into the hooks.
pub(crate) struct ReentryGuard(());

impl ReentryGuard {
	/// Claims the current thread. Returns `None` if a hook (or the shim's own
	/// machinery) is already active on it.
	pub(crate) fn enter() -> Option<ReentryGuard> {
		IN_HOOK.with(|flag| {
			if flag.get() {
				None
			} else {
				flag.set(true);
				Some(ReentryGuard(()))
			}
		})
	}
}

impl Drop for ReentryGuard {
	fn drop(&mut self) {
		IN_HOOK.with(|flag| flag.set(false));
	}
}

#[cfg(test)]
pub(crate) fn active() -> bool {
	IN_HOOK.with(Cell::get)
}

/// Permanently marks the current thread as shim-internal. Used by the export
/// runtime workers, the batch worker, and the teardown flush thread; their
/// socket traffic must stay invisible to tracing.
pub(crate) fn disarm_current_thread() {
	IN_HOOK.with(|flag| flag.set(true));
}

/// Runs `f` with hooks passing through, restoring the previous state after.
/// The constructor and destructor use this around pipeline setup/teardown.
pub(crate) fn with_hooks_disabled<R>(f: impl FnOnce() -> R) -> R {
	let previous = IN_HOOK.with(|flag| flag.replace(true));
	let out = f();
	IN_HOOK.with(|flag| flag.set(previous));
	out
}
