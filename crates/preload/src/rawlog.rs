use std::ffi::c_void;

/// Diagnostics from inside the shim go straight to the `write` syscall.
/// Anything higher level (std I/O, even libc's `write` wrapper) resolves to
/// our own interposed symbol and would re-enter the hooks.
pub(crate) fn line(msg: &str) {
	let mut buf = Vec::with_capacity(msg.len() + 1);
	buf.extend_from_slice(msg.as_bytes());
	buf.push(b'\n');
	unsafe {
		libc::syscall(
			libc::SYS_write,
			libc::STDERR_FILENO,
			buf.as_ptr() as *const c_void,
			buf.len(),
		);
	}
}
