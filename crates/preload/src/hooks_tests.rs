use std::io::{Read as _, Write as _};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::ptr;
use std::thread;

use opentelemetry::Value;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use socket2::SockAddr;

use super::*;
use crate::guard;

fn attr<'a>(span: &'a SpanData, key: &str) -> Option<&'a Value> {
	span.attributes
		.iter()
		.find(|kv| kv.key.as_str() == key)
		.map(|kv| &kv.value)
}

fn attr_i64(span: &SpanData, key: &str) -> Option<i64> {
	match attr(span, key) {
		Some(Value::I64(value)) => Some(*value),
		_ => None,
	}
}

fn attr_string(span: &SpanData, key: &str) -> Option<String> {
	match attr(span, key) {
		Some(Value::String(value)) => Some(value.as_str().to_string()),
		_ => None,
	}
}

/// Finished spans with the given name on the given descriptor, in export
/// order. The exporter is shared by the whole harness, so tests filter
/// rather than reset.
fn spans_for_fd(exporter: &InMemorySpanExporter, name: &str, fd: c_int) -> Vec<SpanData> {
	exporter
		.get_finished_spans()
		.unwrap()
		.into_iter()
		.filter(|span| {
			span.name.as_ref() == name && attr_i64(span, "net.sock.fd") == Some(fd as i64)
		})
		.collect()
}

fn event_bytes(span: &SpanData) -> Vec<(String, i64)> {
	span.events
		.iter()
		.map(|event| {
			let bytes = event
				.attributes
				.iter()
				.find_map(|kv| match (&kv.key, &kv.value) {
					(key, Value::I64(value)) if key.as_str() == "bytes" => Some(*value),
					_ => None,
				})
				.unwrap();
			(event.name.to_string(), bytes)
		})
		.collect()
}

#[test]
fn server_one_shot_lifecycle() {
	let exporter = telemetry::testing::install();
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let server_addr = listener.local_addr().unwrap();
	let client = TcpStream::connect(server_addr).unwrap();
	let client_addr = client.local_addr().unwrap();

	let conn_fd = unsafe { accept(listener.as_raw_fd(), ptr::null_mut(), ptr::null_mut()) };
	assert!(conn_fd >= 0);
	assert!(registry::global().contains(conn_fd));

	(&client).write_all(&[1u8; 17]).unwrap();
	let mut buf = [0u8; 64];
	let n = unsafe { read(conn_fd, buf.as_mut_ptr().cast(), buf.len()) };
	assert_eq!(n, 17);

	let out = [2u8; 32];
	let n = unsafe { write(conn_fd, out.as_ptr().cast(), out.len()) };
	assert_eq!(n, 32);
	let mut echoed = [0u8; 32];
	(&client).read_exact(&mut echoed).unwrap();

	assert_eq!(unsafe { close(conn_fd) }, 0);
	assert!(!registry::global().contains(conn_fd));

	let lifecycle: Vec<SpanData> = exporter
		.get_finished_spans()
		.unwrap()
		.into_iter()
		.filter(|span| {
			span.name.as_ref() == "socket.server"
				&& attr_i64(span, "net.sock.fd") == Some(conn_fd as i64)
				&& attr_i64(span, "net.peer.port") == Some(client_addr.port() as i64)
		})
		.collect();
	assert_eq!(lifecycle.len(), 1);
	let lifecycle = &lifecycle[0];
	assert_eq!(
		attr_string(lifecycle, "net.peer.ip").as_deref(),
		Some("127.0.0.1")
	);
	assert_eq!(
		attr_string(lifecycle, "net.transport").as_deref(),
		Some("ip_tcp")
	);
	assert_eq!(
		attr_string(lifecycle, "lifecycle.event").as_deref(),
		Some("accept")
	);
	assert_eq!(
		attr_string(lifecycle, "lifecycle.close_reason").as_deref(),
		Some("close")
	);
	assert_eq!(
		event_bytes(lifecycle),
		vec![("in_bytes".to_string(), 17), ("out_bytes".to_string(), 32)]
	);

	// the lifecycle span parents to the accept that produced the descriptor
	let accepts = spans_for_fd(&exporter, "sys.accept", listener.as_raw_fd());
	let accept_span = accepts
		.iter()
		.find(|span| attr_i64(span, "net.peer.port") == Some(client_addr.port() as i64))
		.unwrap();
	assert!(matches!(accept_span.status, Status::Ok));
	assert_eq!(lifecycle.parent_span_id, accept_span.span_context.span_id());

	assert!(
		spans_for_fd(&exporter, "sys.read", conn_fd)
			.iter()
			.any(|span| {
				attr_i64(span, "io.read") == Some(17) && matches!(span.status, Status::Ok)
			})
	);
	assert!(
		spans_for_fd(&exporter, "sys.write", conn_fd)
			.iter()
			.any(|span| attr_i64(span, "io.written") == Some(32))
	);
	assert!(!spans_for_fd(&exporter, "sys.close", conn_fd).is_empty());
}

#[test]
fn client_one_shot_lifecycle() {
	let exporter = telemetry::testing::install();
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let server_addr = listener.local_addr().unwrap();
	let server = thread::spawn(move || {
		let (mut stream, _) = listener.accept().unwrap();
		let mut buf = [0u8; 17];
		stream.read_exact(&mut buf).unwrap();
		stream.write_all(&[7u8; 37]).unwrap();
	});

	let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
	assert!(fd >= 0);
	let raw = SockAddr::from(server_addr);
	assert_eq!(unsafe { connect(fd, raw.as_ptr().cast(), raw.len()) }, 0);
	assert!(registry::global().contains(fd));

	let payload = [3u8; 17];
	let n = unsafe { send(fd, payload.as_ptr().cast(), payload.len(), 0) };
	assert_eq!(n, 17);

	let mut buf = [0u8; 1024];
	let mut received = 0usize;
	while received < 37 {
		let n = unsafe {
			recv(
				fd,
				buf.as_mut_ptr().add(received).cast(),
				buf.len() - received,
				0,
			)
		};
		assert!(n > 0);
		received += n as usize;
	}
	assert_eq!(received, 37);

	assert_eq!(unsafe { close(fd) }, 0);
	assert!(!registry::global().contains(fd));
	server.join().unwrap();

	let lifecycle: Vec<SpanData> = exporter
		.get_finished_spans()
		.unwrap()
		.into_iter()
		.filter(|span| {
			span.name.as_ref() == "socket.client"
				&& attr_i64(span, "net.sock.fd") == Some(fd as i64)
				&& attr_i64(span, "net.peer.port") == Some(server_addr.port() as i64)
		})
		.collect();
	assert_eq!(lifecycle.len(), 1);
	let lifecycle = &lifecycle[0];
	assert_eq!(
		attr_string(lifecycle, "lifecycle.event").as_deref(),
		Some("connect")
	);
	assert_eq!(
		attr_string(lifecycle, "lifecycle.close_reason").as_deref(),
		Some("close")
	);

	// byte conservation: event totals match what the syscalls returned
	let events = event_bytes(lifecycle);
	assert_eq!(events[0], ("out_bytes".to_string(), 17));
	let total_in: i64 = events
		.iter()
		.filter(|(name, _)| name == "in_bytes")
		.map(|(_, bytes)| bytes)
		.sum();
	assert_eq!(total_in, 37);

	let connects = spans_for_fd(&exporter, "sys.connect", fd);
	assert!(connects.iter().any(|span| {
		matches!(span.status, Status::Ok)
			&& attr_i64(span, "net.peer.port") == Some(server_addr.port() as i64)
	}));
	assert!(
		spans_for_fd(&exporter, "sys.send", fd)
			.iter()
			.any(|span| attr_i64(span, "io.written") == Some(17))
	);
}

#[test]
fn failed_connect_is_transparent() {
	let exporter = telemetry::testing::install();
	// tcpmux; nothing listens on it in any environment we test in
	let port: u16 = 1;
	let dead: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
	let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
	assert!(fd >= 0);
	let raw = SockAddr::from(dead);

	errno::set(0);
	let rc = unsafe { connect(fd, raw.as_ptr().cast(), raw.len()) };
	assert_eq!(rc, -1);
	assert_eq!(errno::get(), libc::ECONNREFUSED);
	assert!(!registry::global().contains(fd));
	assert!(!guard::active());

	let span = exporter
		.get_finished_spans()
		.unwrap()
		.into_iter()
		.find(|span| {
			span.name.as_ref() == "sys.connect"
				&& attr_i64(span, "net.peer.port") == Some(port as i64)
		})
		.unwrap();
	assert!(matches!(span.status, Status::Error { .. }));
	assert_eq!(attr_i64(&span, "errno"), Some(libc::ECONNREFUSED as i64));

	unsafe { libc::close(fd) };
}

#[test]
fn reused_descriptor_reclaims_the_stale_span() {
	let exporter = telemetry::testing::install();
	let listener = TcpListener::bind("127.0.0.1:0").unwrap();
	let server_addr = listener.local_addr().unwrap();
	let first_client = TcpStream::connect(server_addr).unwrap();
	let first_port = first_client.local_addr().unwrap().port();

	let fd = unsafe { accept(listener.as_raw_fd(), ptr::null_mut(), ptr::null_mut()) };
	assert!(fd >= 0);
	assert!(registry::global().contains(fd));

	// simulate the missed close: replace the descriptor behind the shim's
	// back, then let the hook observe the same integer connecting again
	let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
	assert!(sock >= 0);
	assert_eq!(unsafe { libc::dup2(sock, fd) }, fd);
	unsafe { libc::close(sock) };

	let raw = SockAddr::from(server_addr);
	assert_eq!(unsafe { connect(fd, raw.as_ptr().cast(), raw.len()) }, 0);
	assert!(registry::global().contains(fd));

	let stale = exporter
		.get_finished_spans()
		.unwrap()
		.into_iter()
		.find(|span| {
			span.name.as_ref() == "socket.server"
				&& attr_i64(span, "net.sock.fd") == Some(fd as i64)
				&& attr_i64(span, "net.peer.port") == Some(first_port as i64)
		})
		.unwrap();
	assert_eq!(
		attr_string(&stale, "lifecycle.close_reason").as_deref(),
		Some("reused-fd")
	);

	assert_eq!(unsafe { close(fd) }, 0);
	drop(first_client);
}

#[test]
fn zero_byte_read_is_clean_eof() {
	let exporter = telemetry::testing::install();
	let mut fds: [c_int; 2] = [0; 2];
	assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
	let [rd, wr] = fds;
	unsafe { libc::close(wr) };

	let mut buf = [0u8; 8];
	let n = unsafe { read(rd, buf.as_mut_ptr().cast(), buf.len()) };
	assert_eq!(n, 0);

	let span = spans_for_fd(&exporter, "sys.read", rd)
		.into_iter()
		.rev()
		.find(|span| attr_i64(span, "io.read") == Some(0))
		.unwrap();
	assert!(matches!(span.status, Status::Ok));
	assert_eq!(attr_i64(&span, "io.requested"), Some(8));
	assert!(!registry::global().contains(rd));

	unsafe { libc::close(rd) };
}

#[test]
fn partial_write_records_the_actual_count() {
	let exporter = telemetry::testing::install();
	let mut fds: [c_int; 2] = [0; 2];
	assert_eq!(
		unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
		0
	);
	let [a, b] = fds;

	let n = unsafe { send(a, [9u8; 100].as_ptr().cast(), 100, libc::MSG_NOSIGNAL) };
	assert_eq!(n, 100);
	let mut buf = [0u8; 30];
	let n = unsafe { recv(b, buf.as_mut_ptr().cast(), buf.len(), 0) };
	// a short read against the 100 buffered bytes is plain success
	assert_eq!(n, 30);

	let send_span = spans_for_fd(&exporter, "sys.send", a).pop().unwrap();
	assert_eq!(
		attr_i64(&send_span, "send.flags"),
		Some(libc::MSG_NOSIGNAL as i64)
	);
	assert_eq!(attr_i64(&send_span, "io.requested"), Some(100));
	assert_eq!(attr_i64(&send_span, "io.written"), Some(100));

	let recv_span = spans_for_fd(&exporter, "sys.recv", b).pop().unwrap();
	assert_eq!(attr_i64(&recv_span, "recv.flags"), Some(0));
	assert_eq!(attr_i64(&recv_span, "io.requested"), Some(30));
	assert_eq!(attr_i64(&recv_span, "io.read"), Some(30));

	unsafe {
		libc::close(a);
		libc::close(b);
	}
}

#[test]
fn failing_write_preserves_errno() {
	let exporter = telemetry::testing::install();
	errno::set(0);
	let n = unsafe { write(-1, b"x".as_ptr().cast(), 1) };
	assert_eq!(n, -1);
	assert_eq!(errno::get(), libc::EBADF);
	assert!(!guard::active());

	let span = spans_for_fd(&exporter, "sys.write", -1).pop().unwrap();
	assert!(matches!(span.status, Status::Error { .. }));
	assert_eq!(attr_i64(&span, "errno"), Some(libc::EBADF as i64));
}

#[test]
fn guarded_thread_passes_through_without_spans() {
	let exporter = telemetry::testing::install();
	let mut fds: [c_int; 2] = [0; 2];
	assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
	let [rd, wr] = fds;

	let before = spans_for_fd(&exporter, "sys.write", wr).len();
	{
		let _guard = guard::ReentryGuard::enter().unwrap();
		// the hook must degrade to a passthrough: the real write happens,
		// no span is recorded
		let n = unsafe { write(wr, b"ping".as_ptr().cast(), 4) };
		assert_eq!(n, 4);
	}
	assert!(!guard::active());
	assert_eq!(spans_for_fd(&exporter, "sys.write", wr).len(), before);

	let mut buf = [0u8; 4];
	assert_eq!(unsafe { libc::read(rd, buf.as_mut_ptr().cast(), 4) }, 4);
	assert_eq!(&buf, b"ping");

	unsafe {
		libc::close(rd);
		libc::close(wr);
	}
}
