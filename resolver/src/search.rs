use std::collections::VecDeque;

use log::trace;
use stakker::{ret_some_to, Ret, CX};

use crate::config::Config;
use crate::lookup::Outcome;
use crate::query::Bits;
use crate::wire::rcode;
use crate::Context;

/// State carried between steps of one search-list walk.
pub(crate) struct Walk {
	list: VecDeque<String>,
	qtype: u16,
	bits: Bits,
	ret: Ret<Outcome>,
}

/// The order in which a name is tried against the search list: absolute
/// names go out verbatim and alone, names with at least `ndots` dots are
/// tried verbatim before the suffixes, everything else after them.
fn candidates(config: &Config, name: &str) -> VecDeque<String> {
	let mut out = VecDeque::new();

	if name.ends_with('.') {
		out.push_back(name.to_string());
		return out;
	}

	let qualified = name.matches('.').count() >= config.ndots as usize;

	if qualified {
		out.push_back(name.to_string());
	}

	for suffix in &config.search {
		out.push_back(format!("{name}.{suffix}"));
	}

	if !qualified {
		out.push_back(name.to_string());
	}

	out
}

impl Context {
	/// Resolve a name through the search list. Each candidate is a full
	/// lookup; the first outcome that is not NXDOMAIN goes to the caller,
	/// as does the last one when the list runs out.
	pub fn search(&mut self, cx: CX![], name: &str, qtype: u16, bits: Bits, ret: Ret<Outcome>) {
		let mut list = candidates(&self.config, name);

		// The list always holds at least the name itself.
		let Some(first) = list.pop_front() else { return };

		self.step(cx, Walk { list, qtype, bits, ret }, first);
	}

	fn step(&mut self, cx: CX![], walk: Walk, name: String) {
		trace!("Search tries {name}");

		let qtype = walk.qtype;
		let bits = walk.bits;

		let inner = ret_some_to!([cx], walked(walk) as (Outcome));

		// An unbuildable candidate (say, one that grew past the length
		// limit) drops the walk, and with it the caller's handler.
		self.query(cx, &name, qtype, bits, inner);
	}

	pub(crate) fn walked(&mut self, cx: CX![], mut walk: Walk, outcome: Outcome) {
		if matches!(outcome, Outcome::Failure(rcode::NXDOMAIN)) {
			if let Some(next) = walk.list.pop_front() {
				return self.step(cx, walk, next);
			}
		}

		walk.ret.ret(outcome);
	}
}
