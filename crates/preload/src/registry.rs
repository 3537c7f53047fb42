//! Process-wide map from file descriptor to its live connection span.

use std::collections::HashMap;
use std::net::SocketAddr;

use libc::c_int;
use once_cell::sync::Lazy;
use opentelemetry::KeyValue;
use opentelemetry::trace::Span as _;
use parking_lot::Mutex;

use crate::semconv;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
	Client,
	Server,
}

impl Role {
	pub(crate) fn span_name(&self) -> &'static str {
		match self {
			Role::Client => "socket.client",
			Role::Server => "socket.server",
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
	In,
	Out,
}

impl Direction {
	pub(crate) fn event_name(&self) -> &'static str {
		match self {
			Direction::In => "in_bytes",
			Direction::Out => "out_bytes",
		}
	}
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
	/// A `close` on the descriptor succeeded.
	Close,
	/// The descriptor integer came back from `accept`/`connect` while still
	/// registered, meaning we missed the close.
	ReusedFd,
	/// Process teardown reached the record first.
	Shutdown,
}

impl CloseReason {
	pub(crate) fn as_str(&self) -> &'static str {
		match self {
			CloseReason::Close => "close",
			CloseReason::ReusedFd => "reused-fd",
			CloseReason::Shutdown => "shutdown",
		}
	}
}

pub(crate) struct Connection {
	pub(crate) span: opentelemetry_sdk::trace::Span,
	pub(crate) peer: Option<SocketAddr>,
}

/// One mutex guards the whole map. Critical sections stay short and do no
/// I/O; span ends are performed after the lock is released (with the batch
/// processor an end only enqueues, but there is no reason to hold the lock
/// across it).
pub(crate) struct Registry {
	inner: Mutex<HashMap<c_int, Connection>>,
}

impl Registry {
	pub(crate) fn new() -> Registry {
		Registry {
			inner: Mutex::new(HashMap::new()),
		}
	}

	/// Registers a descriptor observed as connected. A record still present
	/// under the same integer means its close was missed; that span is ended
	/// with reason `reused-fd` before the new record takes the slot.
	pub(crate) fn insert(&self, fd: c_int, conn: Connection) {
		let stale = {
			let mut map = self.inner.lock();
			let stale = map.remove(&fd);
			map.insert(fd, conn);
			stale
		};
		if let Some(stale) = stale {
			end_span(stale, CloseReason::ReusedFd);
		}
	}

	/// Appends an `in_bytes`/`out_bytes` event to the descriptor's span, if
	/// the descriptor is registered. Event order per descriptor follows call
	/// completion order because the event is appended under the lock.
	pub(crate) fn annotate(&self, fd: c_int, direction: Direction, bytes: u64) {
		let mut map = self.inner.lock();
		if let Some(conn) = map.get_mut(&fd) {
			conn.span.add_event(
				direction.event_name(),
				vec![KeyValue::new(semconv::BYTES.clone(), bytes as i64)],
			);
		}
	}

	/// Ends and forgets the descriptor's span. Returns whether a record was
	/// present.
	pub(crate) fn end_and_remove(&self, fd: c_int, reason: CloseReason) -> bool {
		let conn = self.inner.lock().remove(&fd);
		match conn {
			Some(conn) => {
				end_span(conn, reason);
				true
			}
			None => false,
		}
	}

	/// Closes out every live record, for process teardown.
	pub(crate) fn drain(&self, reason: CloseReason) {
		let drained: Vec<Connection> = self.inner.lock().drain().map(|(_, conn)| conn).collect();
		for conn in drained {
			end_span(conn, reason);
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.inner.lock().len()
	}

	#[cfg(test)]
	pub(crate) fn contains(&self, fd: c_int) -> bool {
		self.inner.lock().contains_key(&fd)
	}

	/// Peer recorded for the descriptor, if it is registered and its peer was
	/// known at registration time.
	pub(crate) fn peer_of(&self, fd: c_int) -> Option<SocketAddr> {
		self.inner.lock().get(&fd).and_then(|conn| conn.peer)
	}
}

fn end_span(mut conn: Connection, reason: CloseReason) {
	conn.span.set_attribute(KeyValue::new(
		semconv::CLOSE_REASON.clone(),
		reason.as_str(),
	));
	conn.span.end();
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub(crate) fn global() -> &'static Registry {
	&REGISTRY
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
