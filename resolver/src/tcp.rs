use core::net::{IpAddr, SocketAddr};
use std::collections::{HashMap, VecDeque};

use log::{debug, trace};
use stakker::{Fwd, Ret};

use crate::sched::Handle;
use crate::Result;

/// Prefix a message with the two-byte big-endian length TCP framing wants.
fn frame(msg: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(msg.len() + 2);

	out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
	out.extend_from_slice(msg);
	out
}

/// Incremental reassembly of length-prefixed messages from stream chunks.
#[derive(Default)]
struct Frames {
	buf: Vec<u8>,
}

impl Frames {
	fn push(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
	}

	fn next(&mut self) -> Option<Vec<u8>> {
		let len = u16::from_be_bytes([*self.buf.first()?, *self.buf.get(1)?]) as usize;

		if self.buf.len() < 2 + len {
			return None;
		}

		let msg = self.buf[2..2 + len].to_vec();
		self.buf.drain(..2 + len);

		Some(msg)
	}
}

/// One lookup parked on a connection. The front entry per ID is on the wire;
/// the rest hold their frame until the ID frees up.
struct Parked {
	handle: Handle,
	frame: Option<Vec<u8>>,
}

/// One shared connection per peer. DNS over TCP has no framing beyond the
/// length prefix, so the query ID is the only demultiplexing key, and two
/// in-flight queries must never share one.
struct Conn {
	io: runtime::Tcp,
	frames: Frames,
	/// Waiters keyed by query ID, in-flight first.
	ids: HashMap<u16, VecDeque<Parked>>,
}

pub(crate) struct Pool {
	conns: HashMap<IpAddr, Conn>,
}

impl Pool {
	pub fn new() -> Self {
		Pool { conns: HashMap::new() }
	}

	pub fn contains(&self, peer: IpAddr) -> bool {
		self.conns.contains_key(&peer)
	}

	/// Start a connection to the peer. `ready` reports the connect result;
	/// queries may be queued before it fires.
	pub fn connect(&mut self, peer: SocketAddr, fwd: Fwd<Box<[u8]>>, ready: Ret<bool>, closed: Fwd<bool>) -> Result {
		let io = runtime::Tcp::connect(peer, fwd, ready, closed)?;

		self.conns.insert(peer.ip(), Conn { io, frames: Frames::default(), ids: HashMap::new() });

		Ok(())
	}

	/// Send `msg` for `h`, or park it behind the in-flight query already
	/// using the same ID.
	pub fn send(&mut self, peer: IpAddr, id: u16, msg: &[u8], h: Handle) -> Result {
		let conn = self.conns.get_mut(&peer).ok_or(())?;

		let parked = conn.ids.entry(id).or_default();

		if parked.is_empty() {
			conn.io.send(&frame(msg));
			parked.push_back(Parked { handle: h, frame: None });
		} else {
			trace!("ID {id:#06x} already in flight to {peer}; parking the query");
			parked.push_back(Parked { handle: h, frame: Some(frame(msg)) });
		}

		Ok(())
	}

	/// Feed inbound bytes. Each complete message is handed back with the
	/// waiter it belongs to; a parked query with the now-free ID goes out on
	/// the wire. A message with no waiter is dropped.
	pub fn receive(&mut self, peer: IpAddr, chunk: &[u8]) -> Vec<(Handle, Vec<u8>)> {
		let mut out = Vec::new();

		let Some(conn) = self.conns.get_mut(&peer) else { return out };

		conn.frames.push(chunk);

		while let Some(msg) = conn.frames.next() {
			let Some(id) = msg.first().zip(msg.get(1)).map(|(a, b)| u16::from_be_bytes([*a, *b])) else {
				debug!("Dropping undersized TCP message from {peer}");
				continue;
			};

			let Some(parked) = conn.ids.get_mut(&id) else {
				debug!("Dropping TCP message from {peer} with no waiter for ID {id:#06x}");
				continue;
			};

			if let Some(done) = parked.pop_front() {
				out.push((done.handle, msg));
			}

			// One parked query takes over the freed ID.
			let promoted = parked.front_mut().and_then(|next| next.frame.take());
			let empty = parked.is_empty();

			if let Some(f) = promoted {
				conn.io.send(&f);
			}

			if empty {
				conn.ids.remove(&id);
			}
		}

		if conn.ids.is_empty() {
			trace!("No waiters left on the connection to {peer}; closing");
			self.conns.remove(&peer);
		}

		out
	}

	/// Drop one waiter (finished or cancelled elsewhere). The connection
	/// closes itself once the last waiter is gone.
	pub fn unsubscribe(&mut self, peer: IpAddr, id: u16, h: Handle) {
		let Some(conn) = self.conns.get_mut(&peer) else { return };

		if let Some(parked) = conn.ids.get_mut(&id) {
			parked.retain(|p| p.handle != h);

			// Whoever sits at the front now must actually be on the wire.
			let promoted = parked.front_mut().and_then(|next| next.frame.take());
			let empty = parked.is_empty();

			if let Some(f) = promoted {
				conn.io.send(&f);
			}

			if empty {
				conn.ids.remove(&id);
			}
		}

		if conn.ids.is_empty() {
			trace!("No waiters left on the connection to {peer}; closing");
			self.conns.remove(&peer);
		}
	}

	/// Tear the connection down and return everyone who was waiting on it.
	pub fn fail(&mut self, peer: IpAddr) -> Vec<Handle> {
		let Some(conn) = self.conns.remove(&peer) else { return Vec::new() };

		conn.ids.into_values().flatten().map(|p| p.handle).collect()
	}
}
