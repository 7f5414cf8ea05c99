use core::net::IpAddr;
use std::collections::HashMap;
use std::fs;

use bilge::prelude::*;

use log::debug;

use crate::query::{Query, Reverse};
use crate::wire::{self, Flags, Response, Writer, CLASS_IN, TYPE_A, TYPE_AAAA, TYPE_PTR};

/// The local host table: names mapped to addresses and back. Keys are
/// case-insensitive; a name answered from here never reaches a nameserver.
#[derive(Debug, Default, Clone)]
pub struct Hosts {
	names: HashMap<String, Vec<IpAddr>>,
	/// Reverse map; the first name listed for an address wins.
	addrs: HashMap<IpAddr, String>,
}

impl Hosts {
	/// The contents of `/etc/hosts`, or an empty table if it cannot be read.
	pub fn from_system() -> Hosts {
		match fs::read_to_string("/etc/hosts") {
			Ok(text) => Hosts::parse(&text),
			Err(e) => {
				debug!("Cannot read /etc/hosts: {e}");
				Hosts::default()
			}
		}
	}

	pub fn parse(text: &str) -> Hosts {
		let mut hosts = Hosts::default();

		for line in text.lines() {
			let line = line.split('#').next().unwrap_or("");
			let mut words = line.split_whitespace();

			let Some(ip) = words.next().and_then(|w| w.parse().ok()) else { continue };

			for name in words {
				hosts.insert(name, ip);
			}
		}

		hosts
	}

	pub fn insert(&mut self, name: &str, ip: IpAddr) {
		let name = name.trim_end_matches('.').to_ascii_lowercase();

		self.names.entry(name.clone()).or_default().push(ip);
		self.addrs.entry(ip).or_insert(name);
	}

	/// Whether the table knows the name under any address family.
	pub fn has(&self, name: &str) -> bool {
		self.names.contains_key(&name.to_ascii_lowercase())
	}

	pub fn lookup(&self, name: &str, qtype: u16) -> impl Iterator<Item = IpAddr> + '_ {
		self.names
			.get(&name.to_ascii_lowercase())
			.into_iter()
			.flatten()
			.copied()
			.filter(move |ip| match qtype {
				TYPE_A => ip.is_ipv4(),
				TYPE_AAAA => ip.is_ipv6(),
				_ => false,
			})
	}

	pub fn reverse(&self, ip: IpAddr) -> Option<&str> {
		self.addrs.get(&ip).map(String::as_str)
	}

	/// Whether a query can be answered without asking a nameserver: an
	/// address query for a known name, or a pointer query for a known
	/// address.
	pub fn answers(&self, name: &str, qtype: u16) -> bool {
		match qtype {
			TYPE_A | TYPE_AAAA => self.lookup(name, qtype).next().is_some(),
			TYPE_PTR => Reverse::from_name(name).is_some_and(|r| self.addrs.contains_key(&r.to_ip())),
			_ => false,
		}
	}

	/// Synthesize the answer message for a query this table can serve.
	pub fn answer(&self, query: &Query) -> Option<Response> {
		let mut w = Writer::new();

		w.header(query.id(), response_flags(), 1, 0, 0, 0);
		w.question(query.name(), query.qtype(), CLASS_IN).ok()?;

		let mut count = 0u16;

		match query.qtype() {
			TYPE_A | TYPE_AAAA => {
				for ip in self.lookup(query.name(), query.qtype()) {
					let rdata = match ip {
						IpAddr::V4(v4) => v4.octets().to_vec(),
						IpAddr::V6(v6) => v6.octets().to_vec(),
					};

					w.record(query.name(), query.qtype(), CLASS_IN, 0, &rdata).ok()?;
					count += 1;
				}
			}
			TYPE_PTR => {
				let ip = Reverse::from_name(query.name())?.to_ip();
				let target = self.reverse(ip)?;

				w.record(query.name(), TYPE_PTR, CLASS_IN, 0, &wire::encode(target).ok()?).ok()?;
				count += 1;
			}
			_ => return None,
		}

		if count == 0 {
			return None;
		}

		w.set_u16(6, count);

		Response::parse(&w.finish()).ok()
	}

	/// An empty-but-successful message echoing the question, used to mask an
	/// upstream NXDOMAIN for a name this table knows.
	pub fn mask(query: &Query) -> Option<Response> {
		let mut w = Writer::new();

		w.header(query.id(), response_flags(), 1, 0, 0, 0);
		w.question(query.name(), query.qtype(), CLASS_IN).ok()?;

		Response::parse(&w.finish()).ok()
	}
}

fn response_flags() -> Flags {
	Flags::new(u4::new(0), false, false, false, true, true, false, false, u4::new(0), true)
}
