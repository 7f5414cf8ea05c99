use core::fmt;
use core::net::IpAddr;
use std::time::Instant;

use stakker::Ret;

use crate::config::Config;
use crate::query::Query;
use crate::wire::Response;

/// Terminal result of one lookup, delivered through the caller's `Ret`
/// exactly once.
pub enum Outcome {
	/// A usable response. It may still carry the TC flag if TCP could not
	/// improve on a truncated answer.
	Resolved(Response),
	/// The upstream answered with this non-zero response code.
	Failure(u16),
	/// No upstream produced an answer within the configured lifetime.
	Timeout,
	/// The caller cancelled the lookup.
	Cancelled,
}

impl fmt::Debug for Outcome {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Outcome::Resolved(r) => f.debug_tuple("Resolved").field(r).finish(),
			Outcome::Failure(rcode) => f.debug_tuple("Failure").field(rcode).finish(),
			Outcome::Timeout => f.write_str("Timeout"),
			Outcome::Cancelled => f.write_str("Cancelled"),
		}
	}
}

pub(crate) enum Entry {
	Remote(Remote),
	Local(Local),
}

/// A lookup the host table can answer; it resolves on its first scheduler
/// tick without touching the network.
pub(crate) struct Local {
	pub query: Query,
	pub ret: Option<Ret<Outcome>>,
	pub created: Instant,
}

/// A lookup driven over the network.
pub(crate) struct Remote {
	pub query: Query,
	pub ret: Option<Ret<Outcome>>,
	/// Admission time; the first attempt is due immediately after.
	pub started: Instant,
	/// When the last datagram went out, or the TCP escalation began.
	pub last: Instant,
	/// Attempts sent so far.
	pub count: u32,
	/// Per-lookup random offset into the nameserver list, applied when
	/// rotation is on.
	pub salt: u16,
	/// A truncated response kept while TCP tries to do better.
	pub stash: Option<Response>,
	/// Peers subscribed on UDP under the current query ID.
	pub subs: Vec<IpAddr>,
	/// The peer a TCP escalation targets, if one is running.
	pub tcp: Option<IpAddr>,
}

impl Remote {
	pub fn new(query: Query, salt: u16, ret: Ret<Outcome>, now: Instant) -> Self {
		Remote {
			query,
			ret: Some(ret),
			started: now,
			last: now,
			count: 0,
			salt,
			stash: None,
			subs: Vec::new(),
			tcp: None,
		}
	}

	/// Which nameserver the k-th attempt goes to: straight round-robin, or
	/// offset by the lookup's salt when rotation spreads the load.
	pub fn nameserver(&self, config: &Config, k: u32) -> Option<IpAddr> {
		let n = config.nameservers.len();

		if n == 0 {
			return None;
		}

		let salt = if config.rotate { self.salt as usize } else { 0 };

		Some(config.nameservers[(k as usize + salt) % n])
	}
}
