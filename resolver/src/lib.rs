//! An asynchronous stub resolver: queries go to the configured recursors
//! over UDP with retransmission and rotation, escalate to TCP on truncation,
//! and come back through a single-use callback per lookup.

use core::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, trace};
use rand::Rng;
use stakker::{fwd_to, ret_some_to, FixedTimerKey, Ret, CX};

mod config;
mod hosts;
mod id;
mod lookup;
mod query;
mod sched;
mod search;
mod tcp;
mod udp;
pub mod wire;

pub use config::Config;
pub use hosts::Hosts;
pub use id::IdStrategy;
pub use lookup::Outcome;
pub use query::{Bits, Query, Reverse};
pub use sched::Handle;
pub use wire::{rcode, Response};

use id::Ids;
use lookup::{Entry, Local, Remote};
use sched::{Queue, Sched};
use wire::TYPE_PTR;

pub type Result<T = (), E = ()> = core::result::Result<T, E>;

/// The resolver context. Owns the transports, the lookup queues, and the one
/// shared timer; every admitted lookup lives here until its outcome is
/// delivered. Dropping the context silently drops outstanding lookups
/// without invoking their handlers.
pub struct Context {
	config: Rc<Config>,
	hosts: Rc<Hosts>,
	sched: Sched<Entry>,
	udp: udp::Pool,
	tcp: tcp::Pool,
	ids: Ids,
	/// Remote lookups holding a query ID right now.
	inflight: usize,
	timer: FixedTimerKey,
	/// Deadline the timer is armed for, if any.
	armed: Option<Instant>,
}

impl Context {
	pub fn init(cx: CX![], config: Config, hosts: Hosts) -> Option<Self> {
		let fwd = fwd_to!([cx], udp_recv() as (SocketAddr, Box<[u8]>));

		Some(Context {
			ids: Ids::new(config.ids),
			udp: udp::Pool::new(config.sockets, config.buffer, fwd),
			tcp: tcp::Pool::new(),
			config: Rc::new(config),
			hosts: Rc::new(hosts),
			sched: Sched::new(),
			inflight: 0,
			timer: FixedTimerKey::default(),
			armed: None,
		})
	}

	/// Admit a lookup for `name` and `qtype`. Returns `None` if no valid
	/// query can be formed from them (the handler is then never invoked);
	/// otherwise the handle cancels the lookup until its outcome arrives.
	pub fn query(&mut self, cx: CX![], name: &str, qtype: u16, bits: Bits, ret: Ret<Outcome>) -> Option<Handle> {
		let Ok(query) = Query::new(name, qtype, bits, self.config.payload) else {
			debug!("Rejecting unresolvable query for {name:?}");
			return None;
		};

		let now = cx.now();

		let h = if self.hosts.answers(query.name(), qtype) {
			trace!("Answering {} from the host table", query.name());

			let h = self.sched.insert(Entry::Local(Local { query, ret: Some(ret), created: now }));

			// Local lookups take no query ID and skip the capacity gate.
			self.sched.push_back(Queue::Pending, h);
			h
		} else {
			let salt = rand::thread_rng().gen();

			let h = self.sched.insert(Entry::Remote(Remote::new(query, salt, ret, now)));

			self.admit(h);
			h
		};

		self.rearm(cx);

		Some(h)
	}

	/// Admit a pointer lookup for the address.
	pub fn query_reverse(&mut self, cx: CX![], ip: IpAddr, bits: Bits, ret: Ret<Outcome>) -> Option<Handle> {
		self.query(cx, &Reverse(ip).name(), TYPE_PTR, bits, ret)
	}

	/// Cancel a lookup: its handler receives `Cancelled` and nothing else,
	/// ever. A second cancel, or one racing the delivered outcome, finds a
	/// stale handle and does nothing.
	pub fn cancel(&mut self, cx: CX![], h: Handle) {
		if self.sched.get(h).is_some() {
			self.finish(h, Outcome::Cancelled);
			self.rearm(cx);
		}
	}

	/// Raise the number of UDP sockets per address family. The pool only
	/// grows; spreading lookups over more source ports makes blind response
	/// forgery harder.
	pub fn sockets(&mut self, _cx: CX![], n: usize) {
		self.udp.set_sockets(n);
	}

	/// Give a remote lookup a query ID and a pending slot, or park it in
	/// overflow while the in-flight pool is saturated.
	fn admit(&mut self, h: Handle) {
		if self.inflight < self.config.capacity.min(self.ids.capacity()) {
			if let Some(id) = self.ids.generate() {
				if let Some(Entry::Remote(r)) = self.sched.get_mut(h) {
					r.query.set_id(id);
				}

				self.inflight += 1;
				self.sched.push_back(Queue::Pending, h);
				return;
			}
		}

		trace!("In-flight pool saturated; lookup goes to overflow");
		self.sched.push_back(Queue::Overflow, h);
	}

	/// Refill the in-flight pool from overflow, oldest first.
	fn promote(&mut self) {
		while self.inflight < self.config.capacity.min(self.ids.capacity()) && self.sched.len(Queue::Overflow) > 0 {
			let Some(id) = self.ids.generate() else { break };

			let Some(h) = self.sched.pop_front(Queue::Overflow) else {
				self.ids.free(id);
				break;
			};

			if let Some(Entry::Remote(r)) = self.sched.get_mut(h) {
				r.query.set_id(id);
			}

			self.inflight += 1;
			self.sched.push_back(Queue::Pending, h);
		}
	}

	/// Tear a lookup down and deliver its outcome. Subscriptions and the ID
	/// go first, so no transport path can reach the lookup afterwards; the
	/// handler fires last and exactly once.
	fn finish(&mut self, h: Handle, outcome: Outcome) {
		let Some(entry) = self.sched.remove(h) else { return };

		match entry {
			Entry::Local(mut l) => {
				if let Some(ret) = l.ret.take() {
					ret.ret(outcome);
				}
			}
			Entry::Remote(mut r) => {
				let id = r.query.id();

				for peer in r.subs.drain(..) {
					self.udp.unsubscribe(id, peer, h);
				}

				if let Some(peer) = r.tcp.take() {
					self.tcp.unsubscribe(peer, id, h);
				}

				// An ID of zero means the lookup never left overflow.
				if id != 0 {
					self.ids.free(id);
					self.inflight -= 1;
				}

				if let Some(ret) = r.ret.take() {
					ret.ret(outcome);
				}
			}
		}

		self.promote();
	}

	/// When the lookup next needs attention, given the queue it is in.
	/// Overflow lookups have no deadline of their own.
	fn deadline(&self, h: Handle) -> Option<Instant> {
		let entry = self.sched.get(h)?;

		Some(match (entry, self.sched.queue_of(h)?) {
			(_, Queue::Overflow) => return None,
			(Entry::Local(l), _) => l.created,
			(Entry::Remote(r), Queue::Pending) if r.count == 0 => r.started,
			(Entry::Remote(r), Queue::Pending) => r.last + self.config.interval,
			(Entry::Remote(r), Queue::Waiting) => r.last + self.config.timeout,
		})
	}

	/// Keep exactly one one-shot timer armed, for the earliest deadline over
	/// the pending and waiting queues. Re-arming for an unchanged deadline
	/// is skipped.
	fn rearm(&mut self, cx: CX![]) {
		let next = self
			.sched
			.iter(Queue::Pending)
			.chain(self.sched.iter(Queue::Waiting))
			.filter_map(|h| self.deadline(h))
			.min();

		if next == self.armed {
			return;
		}

		if self.armed.take().is_some() {
			cx.timer_del(self.timer);
		}

		self.armed = next;

		if let Some(at) = next {
			let actor = cx.access_actor().clone();

			let dur = at.saturating_duration_since(cx.now());
			self.timer = cx.after(dur, move |s| {
				actor.apply(s, |this, cx| this.tick(cx))
			});
		}
	}

	fn tick(&mut self, cx: CX![]) {
		trace!("Tick with {} lookups outstanding", self.sched.total());

		// The one-shot fired; it is no longer armed.
		self.armed = None;

		self.drive(cx);
		self.rearm(cx);
	}

	/// Process due lookups in queue order, bounded by the per-tick callback
	/// budget. Anything left over stays due, so the re-arm right after picks
	/// a zero delay and the next tick continues where this one stopped.
	fn drive(&mut self, cx: CX![]) {
		let now = cx.now();
		let mut calls = 0;

		for queue in [Queue::Pending, Queue::Waiting] {
			let mut cursor = self.sched.front(queue);

			while let Some(h) = cursor {
				if calls >= self.config.maxcalls {
					return;
				}

				// The successor first: executing may move or remove `h`.
				cursor = self.sched.next_in(h);

				if self.deadline(h).is_some_and(|d| d <= now) {
					calls += self.execute(cx, h, now) as usize;
				}
			}
		}
	}

	/// Drive one due lookup a step. Returns whether a user callback was
	/// issued.
	fn execute(&mut self, cx: CX![], h: Handle, now: Instant) -> bool {
		match self.sched.queue_of(h) {
			Some(Queue::Pending) => {}
			// A waiting lookup's deadline passed: deliver what we have.
			Some(Queue::Waiting) => {
				let stash = match self.sched.get_mut(h) {
					Some(Entry::Remote(r)) => r.stash.take(),
					_ => None,
				};

				match stash {
					Some(resp) => self.deliver(h, &resp),
					None => self.finish(h, Outcome::Timeout),
				}

				return true;
			}
			_ => return false,
		}

		// A local lookup resolves on its first tick.
		if matches!(self.sched.get(h), Some(Entry::Local(_))) {
			let answer = match self.sched.get(h) {
				Some(Entry::Local(l)) => self.hosts.answer(&l.query),
				_ => None,
			};

			match answer {
				Some(resp) => self.finish(h, Outcome::Resolved(resp)),
				None => self.finish(h, Outcome::Failure(rcode::SERVFAIL)),
			}

			return true;
		}

		let config = self.config.clone();

		let exhausted = match self.sched.get(h) {
			Some(Entry::Remote(r)) => r.count >= config.attempts,
			_ => return false,
		};

		if exhausted {
			// No more datagrams; hold on for a late answer until the
			// deadline.
			self.sched.push_back(Queue::Waiting, h);
			return false;
		}

		// Next attempt.
		let sent = match self.sched.get_mut(h) {
			Some(Entry::Remote(r)) => r.nameserver(&config, r.count).map(|ns| {
				let subscribe = !r.subs.contains(&ns);

				if subscribe {
					r.subs.push(ns);
				}

				r.count += 1;
				r.last = now;

				(ns, r.query.id(), subscribe, r.query.bytes().to_vec())
			}),
			_ => return false,
		};

		let Some((ns, id, subscribe, bytes)) = sent else {
			debug!("Lookup for a name with no nameservers configured");
			self.finish(h, Outcome::Timeout);
			return true;
		};

		if subscribe {
			self.udp.subscribe(id, ns, h);
		}

		trace!("Attempt to {ns} under ID {id:#06x}");

		// A failed write is a dropped datagram; the timer covers it.
		let _ = self.udp.send(SocketAddr::new(ns, config.port), &bytes);

		false
	}

	/// Hand a response to the user: NXDOMAIN for a name the host table knows
	/// is masked with a synthesized empty success, other non-zero codes are
	/// failures, the rest resolve.
	fn deliver(&mut self, h: Handle, resp: &Response) {
		let code = resp.rcode();

		if code == rcode::NXDOMAIN {
			let masked = match self.sched.get(h) {
				Some(Entry::Remote(r)) if self.hosts.has(r.query.name()) => Hosts::mask(&r.query),
				_ => None,
			};

			if let Some(synth) = masked {
				info!("Masking NXDOMAIN for a name the host table knows");
				return self.finish(h, Outcome::Resolved(synth));
			}
		}

		match code {
			rcode::NOERROR => self.finish(h, Outcome::Resolved(resp.clone())),
			_ => self.finish(h, Outcome::Failure(code)),
		}
	}

	/// One datagram from the UDP pool. Forged and malformed packets must get
	/// no further than this function.
	pub(crate) fn udp_recv(&mut self, cx: CX![], peer: SocketAddr, bytes: Box<[u8]>) {
		let Ok(resp) = Response::parse(&bytes) else {
			debug!("Dropping malformed datagram from {peer}");
			return;
		};

		let subs = self.udp.subscribers(resp.id(), peer.ip());

		if subs.is_empty() {
			trace!("Dropping datagram from {peer} with no subscriber");
			return;
		}

		for h in subs {
			self.on_received(cx, h, peer.ip(), &resp);
		}

		self.rearm(cx);
	}

	/// A subscribed lookup got a datagram from its peer.
	fn on_received(&mut self, cx: CX![], h: Handle, peer: IpAddr, resp: &Response) {
		let matched = match self.sched.get(h) {
			Some(Entry::Remote(r)) => r.query.matches(resp),
			_ => return,
		};

		if !matched {
			trace!("Response from {peer} does not answer its query");
			return;
		}

		let escalate = match self.sched.get_mut(h) {
			Some(Entry::Remote(r)) if resp.truncated() && r.tcp.is_none() => {
				// Keep the truncated answer as a fallback and switch to TCP.
				r.stash = Some(resp.clone());
				r.last = cx.now();
				r.tcp = Some(peer);

				let drained: Vec<IpAddr> = r.subs.drain(..).collect();

				Some((r.query.id(), r.query.bytes().to_vec(), drained))
			}
			_ => None,
		};

		match escalate {
			Some((id, bytes, drained)) => {
				info!("Truncated response from {peer}; retrying over TCP");

				for p in drained {
					self.udp.unsubscribe(id, p, h);
				}

				self.sched.push_back(Queue::Waiting, h);
				self.escalate(cx, h, peer, id, bytes);
			}
			None => self.deliver(h, resp),
		}
	}

	/// Queue the query on the peer's pooled TCP connection, opening one if
	/// this lookup is the first to escalate there.
	fn escalate(&mut self, cx: CX![], h: Handle, peer: IpAddr, id: u16, bytes: Vec<u8>) {
		if !self.tcp.contains(peer) {
			let fwd = fwd_to!([cx], tcp_recv(peer) as (Box<[u8]>));
			let ready = ret_some_to!([cx], tcp_ready(peer) as (bool));
			let closed = fwd_to!([cx], tcp_closed(peer) as (bool));

			if self.tcp.connect(SocketAddr::new(peer, self.config.port), fwd, ready, closed).is_err() {
				return self.tcp_gave_up(h);
			}
		}

		if self.tcp.send(peer, id, &bytes, h).is_err() {
			return self.tcp_gave_up(h);
		}
	}

	/// TCP cannot help this lookup; fall back to the stashed truncated
	/// response if there is one.
	fn tcp_gave_up(&mut self, h: Handle) {
		let stash = match self.sched.get_mut(h) {
			Some(Entry::Remote(r)) => {
				r.tcp = None;
				r.stash.take()
			}
			_ => return,
		};

		match stash {
			Some(resp) => self.deliver(h, &resp),
			None => self.finish(h, Outcome::Failure(rcode::SERVFAIL)),
		}
	}

	pub(crate) fn tcp_ready(&mut self, cx: CX![], peer: IpAddr, ok: bool) {
		if ok {
			trace!("TCP connection to {peer} established");
			return;
		}

		info!("TCP connect to {peer} failed");
		self.tcp_lost(cx, peer);
	}

	pub(crate) fn tcp_closed(&mut self, cx: CX![], peer: IpAddr, eof: bool) {
		debug!("TCP connection to {peer} {}", if eof { "closed by the peer" } else { "lost" });
		self.tcp_lost(cx, peer);
	}

	fn tcp_lost(&mut self, cx: CX![], peer: IpAddr) {
		for h in self.tcp.fail(peer) {
			self.tcp_gave_up(h);
		}

		self.rearm(cx);
	}

	pub(crate) fn tcp_recv(&mut self, cx: CX![], peer: IpAddr, chunk: Box<[u8]>) {
		for (h, msg) in self.tcp.receive(peer, &chunk) {
			let Ok(resp) = Response::parse(&msg) else {
				debug!("Dropping malformed TCP message from {peer}");
				continue;
			};

			let matched = match self.sched.get(h) {
				Some(Entry::Remote(r)) => r.query.matches(&resp),
				_ => false,
			};

			if matched {
				// Delivered as-is, even if the server still set TC: this was
				// the best effort.
				self.deliver(h, &resp);
			} else {
				trace!("TCP message from {peer} does not answer its query");
			}
		}

		self.rearm(cx);
	}
}
