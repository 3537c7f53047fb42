use std::ffi::c_int;

pub(crate) fn get() -> c_int {
	unsafe { *libc::__errno_location() }
}

pub(crate) fn set(value: c_int) {
	unsafe { *libc::__errno_location() = value };
}

pub(crate) fn describe(value: c_int) -> String {
	std::io::Error::from_raw_os_error(value).to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_thread_errno() {
		set(libc::EINTR);
		assert_eq!(get(), libc::EINTR);
		set(0);
		assert_eq!(get(), 0);
	}

	#[test]
	fn describe_names_the_error() {
		let msg = describe(libc::ECONNREFUSED);
		assert!(msg.to_lowercase().contains("refused"), "{msg}");
	}
}
