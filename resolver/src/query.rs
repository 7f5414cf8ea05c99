use core::net::IpAddr;

use bilge::prelude::*;

use crate::wire::{Flags, Question, Reader, Response, Writer, CLASS_IN, HEADER, OPCODE_UPDATE};
use crate::Result;

/// Header and EDNS flag bits a caller may set on a query.
#[derive(Debug, Clone, Copy)]
pub struct Bits {
	/// Recursion Desired. On by default; the configured upstreams are
	/// expected to be recursors.
	pub rd: bool,
	/// Authentic Data: ask the server to report validation status.
	pub ad: bool,
	/// Checking Disabled: ask the server to skip validation.
	pub cd: bool,
	/// EDNS DO: request DNSSEC records in the response.
	pub dnssec: bool,
}

impl Default for Bits {
	fn default() -> Self {
		Bits { rd: true, ad: false, cd: false, dnssec: false }
	}
}

/// One outbound question, kept in wire form: header, a single question, and
/// the OPT pseudo-record advertising EDNS(0). Immutable once built except for
/// the ID field, which is assigned when the lookup is admitted.
#[derive(Clone)]
pub struct Query {
	bytes: Vec<u8>,
	name: String,
	qtype: u16,
}

impl Query {
	/// Compose the wire form. Fails on an empty, over-long, or malformed
	/// name; any 16-bit record type is accepted.
	pub fn new(name: &str, qtype: u16, bits: Bits, payload: u16) -> Result<Query> {
		let name = name.trim_end_matches('.').to_ascii_lowercase();

		if name.is_empty() || name.len() > 253 {
			return Err(());
		}

		let flags = Flags::new(u4::new(0), bits.cd, bits.ad, false, false, bits.rd, false, false, u4::new(0), false);

		let mut w = Writer::new();

		w.header(0, flags, 1, 0, 0, 1);
		w.question(&name, qtype, CLASS_IN)?;
		w.opt(payload, bits.dnssec);

		Ok(Query { bytes: w.finish(), name, qtype })
	}

	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn qtype(&self) -> u16 {
		self.qtype
	}

	pub fn id(&self) -> u16 {
		u16::from_be_bytes([self.bytes[0], self.bytes[1]])
	}

	pub fn set_id(&mut self, id: u16) {
		self.bytes[..2].copy_from_slice(&id.to_be_bytes());
	}

	fn flags(&self) -> Flags {
		Flags::from(u16::from_be_bytes([self.bytes[2], self.bytes[3]]))
	}

	fn qdcount(&self) -> u16 {
		u16::from_be_bytes([self.bytes[4], self.bytes[5]])
	}

	fn questions(&self) -> Vec<Question> {
		let mut r = Reader::at(&self.bytes, HEADER);

		(0..self.qdcount())
			.filter_map(|_| {
				let name = r.name().ok()?;
				let qtype = r.u16().ok()?;
				let class = r.u16().ok()?;

				Some(Question { name, qtype, class })
			})
			.collect()
	}

	/// Whether a response answers this query: the IDs are equal, the opcodes
	/// agree, and the response repeats this question section. Update
	/// messages carry no question and are matched on the header alone.
	/// Anything else is somebody else's (or a forged) message.
	pub fn matches(&self, response: &Response) -> bool {
		if response.id() != self.id() {
			return false;
		}

		let opcode = self.flags().opcode().value();

		if response.opcode() != opcode {
			return false;
		}

		if opcode == OPCODE_UPDATE {
			return true;
		}

		if response.qdcount() != self.qdcount() {
			return false;
		}

		let own = self.questions();

		response.questions().all(|q| own.contains(&q))
	}
}

/// The reverse-lookup name of an address: `in-addr.arpa` for IPv4 and
/// `ip6.arpa` for IPv6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reverse(pub IpAddr);

impl Reverse {
	pub fn name(&self) -> String {
		match self.0 {
			IpAddr::V4(ip) => {
				let [a, b, c, d] = ip.octets();

				format!("{d}.{c}.{b}.{a}.in-addr.arpa")
			}
			IpAddr::V6(ip) => {
				let mut out = String::with_capacity(72);

				for b in ip.octets().iter().rev() {
					out.push(char::from_digit((b & 0xF) as u32, 16).unwrap_or('0'));
					out.push('.');
					out.push(char::from_digit((b >> 4) as u32, 16).unwrap_or('0'));
					out.push('.');
				}

				out.push_str("ip6.arpa");
				out
			}
		}
	}

	/// Parse a reverse name back to the address it stands for.
	pub fn from_name(name: &str) -> Option<Reverse> {
		let name = name.trim_end_matches('.');

		if let Some(rest) = name.strip_suffix(".in-addr.arpa") {
			let mut octets = [0u8; 4];
			let mut parts = rest.split('.');

			for octet in octets.iter_mut().rev() {
				*octet = parts.next()?.parse().ok()?;
			}

			if parts.next().is_some() {
				return None;
			}

			return Some(Reverse(IpAddr::V4(octets.into())));
		}

		if let Some(rest) = name.strip_suffix(".ip6.arpa") {
			let mut value: u128 = 0;
			let mut count = 0;

			for nibble in rest.split('.') {
				let digit = u128::from_str_radix(nibble, 16).ok()?;

				if nibble.len() != 1 {
					return None;
				}

				value |= digit << (count * 4);
				count += 1;
			}

			if count != 32 {
				return None;
			}

			return Some(Reverse(IpAddr::V6(value.into())));
		}

		None
	}

	pub fn to_ip(&self) -> IpAddr {
		self.0
	}
}
