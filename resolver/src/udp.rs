use core::net::{IpAddr, SocketAddr};
use std::collections::HashMap;

use log::trace;
use stakker::Fwd;

use crate::sched::Handle;
use crate::Result;

/// The UDP socket pool. Sockets open lazily per address family and are only
/// ever added; outbound queries round-robin over them so replies have to hit
/// the right source port as well as the right ID.
pub(crate) struct Pool {
	fwd: Fwd<(SocketAddr, Box<[u8]>)>,
	v4: Vec<runtime::Udp>,
	v6: Vec<runtime::Udp>,
	/// Round-robin cursors, one per family.
	next: [usize; 2],
	/// How many sockets each family may grow to.
	count: usize,
	buffer: Option<usize>,
	/// Who is waiting for datagrams from which peer under which query ID.
	/// Several lookups may share a key.
	subs: HashMap<(u16, IpAddr), Vec<Handle>>,
}

impl Pool {
	pub fn new(count: usize, buffer: Option<usize>, fwd: Fwd<(SocketAddr, Box<[u8]>)>) -> Self {
		Pool {
			fwd,
			v4: Vec::new(),
			v6: Vec::new(),
			next: [0; 2],
			count: count.max(1),
			buffer,
			subs: HashMap::new(),
		}
	}

	/// Raise the per-family socket target. The pool never shrinks.
	pub fn set_sockets(&mut self, n: usize) {
		self.count = self.count.max(n);
	}

	/// Write one datagram through the next socket of the peer's family,
	/// opening a socket first while the pool is below target. A write error
	/// means the datagram is gone; the retransmit timer recovers from that.
	pub fn send(&mut self, peer: SocketAddr, buf: &[u8]) -> Result {
		let v6 = peer.is_ipv6();

		let fwd = self.fwd.clone();
		let buffer = self.buffer;

		let socks = if v6 { &mut self.v6 } else { &mut self.v4 };

		if socks.len() < self.count {
			match runtime::Udp::bind(v6, buffer, fwd) {
				Ok(sock) => socks.push(sock),
				// Keep going with what we have, if anything.
				Err(()) if socks.is_empty() => return Err(()),
				Err(()) => {}
			}
		}

		let cursor = &mut self.next[v6 as usize];
		let sock = &socks[*cursor % socks.len()];
		*cursor = cursor.wrapping_add(1);

		sock.send_to(peer, buf)
	}

	pub fn subscribe(&mut self, id: u16, peer: IpAddr, h: Handle) {
		trace!("Subscribing to {peer} under ID {id:#06x}");

		let subs = self.subs.entry((id, peer)).or_default();

		if !subs.contains(&h) {
			subs.push(h);
		}
	}

	pub fn unsubscribe(&mut self, id: u16, peer: IpAddr, h: Handle) {
		if let Some(subs) = self.subs.get_mut(&(id, peer)) {
			subs.retain(|s| *s != h);

			if subs.is_empty() {
				self.subs.remove(&(id, peer));
			}
		}
	}

	/// Everyone waiting on this (ID, peer) pair, in subscription order.
	pub fn subscribers(&self, id: u16, peer: IpAddr) -> Vec<Handle> {
		self.subs.get(&(id, peer)).cloned().unwrap_or_default()
	}

	#[cfg(test)]
	pub fn subscriptions(&self) -> usize {
		self.subs.values().map(Vec::len).sum()
	}
}
