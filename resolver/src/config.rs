use core::net::IpAddr;
use core::time::Duration;
use std::fs;

use log::debug;

use crate::id::IdStrategy;

/// Resolver configuration. A lookup captures a shared snapshot at admission,
/// so later changes never affect lookups already in flight.
#[derive(Debug, Clone)]
pub struct Config {
	/// Upstream recursors, tried in list order unless `rotate` is set.
	pub nameservers: Vec<IpAddr>,
	/// Suffixes appended to short names.
	pub search: Vec<String>,
	/// Names with at least this many dots are tried verbatim first.
	pub ndots: u8,
	/// Total lifetime of one lookup.
	pub timeout: Duration,
	/// Datagrams sent before a lookup stops retransmitting.
	pub attempts: u32,
	/// Spacing between retransmissions.
	pub interval: Duration,
	/// Offset each lookup's walk over the nameserver list by a random salt
	/// to spread load.
	pub rotate: bool,
	/// EDNS(0) advertised UDP payload size.
	pub payload: u16,
	/// Nameserver port. Anything other than 53 only makes sense against
	/// local test servers.
	pub port: u16,
	/// UDP sockets opened per address family. More sockets widen the
	/// source-port entropy available to inbound matching.
	pub sockets: usize,
	/// Kernel socket buffer override, in bytes.
	pub buffer: Option<usize>,
	/// Lookups allowed in flight at once; the rest queue in overflow.
	pub capacity: usize,
	/// User callbacks allowed per scheduler tick before yielding back to the
	/// reactor.
	pub maxcalls: usize,
	/// Query-ID allocation strategy.
	pub ids: IdStrategy,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			nameservers: Vec::new(),
			search: Vec::new(),
			ndots: 1,
			timeout: Duration::from_secs(60),
			attempts: 5,
			interval: Duration::from_secs(2),
			rotate: false,
			payload: 1200,
			port: 53,
			sockets: 1,
			buffer: None,
			capacity: 1024,
			maxcalls: 64,
			ids: IdStrategy::default(),
		}
	}
}

impl Config {
	/// Defaults overlaid with whatever `/etc/resolv.conf` provides. A
	/// missing or unreadable file just yields the defaults.
	pub fn from_system() -> Config {
		match fs::read_to_string("/etc/resolv.conf") {
			Ok(text) => Config::parse(&text),
			Err(e) => {
				debug!("Cannot read /etc/resolv.conf: {e}");
				Config::default()
			}
		}
	}

	pub fn parse(text: &str) -> Config {
		let mut cfg = Config::default();

		for line in text.lines() {
			let line = line.split(['#', ';']).next().unwrap_or("");
			let mut words = line.split_whitespace();

			match words.next() {
				Some("nameserver") => match words.next().map(str::parse) {
					Some(Ok(ip)) => cfg.nameservers.push(ip),
					_ => debug!("Skipping malformed nameserver line"),
				},
				Some("search") => cfg.search = words.map(str::to_ascii_lowercase).collect(),
				Some("domain") => {
					if let Some(domain) = words.next() {
						cfg.search = vec![domain.to_ascii_lowercase()];
					}
				}
				Some("options") => {
					for opt in words {
						cfg.option(opt);
					}
				}
				Some(other) => debug!("Skipping resolv.conf directive {other}"),
				None => {}
			}
		}

		cfg
	}

	fn option(&mut self, opt: &str) {
		match opt.split_once(':') {
			Some(("ndots", n)) => {
				if let Ok(n) = n.parse::<u8>() {
					self.ndots = n.min(15);
				}
			}
			// resolv.conf's timeout is the per-retry spacing, not the total
			// lookup lifetime.
			Some(("timeout", n)) => {
				if let Ok(n) = n.parse::<u64>() {
					self.interval = Duration::from_secs(n.min(30));
				}
			}
			Some(("attempts", n)) => {
				if let Ok(n) = n.parse::<u32>() {
					self.attempts = n.clamp(1, 5);
				}
			}
			None if opt == "rotate" => self.rotate = true,
			_ => debug!("Skipping resolv.conf option {opt}"),
		}
	}
}
