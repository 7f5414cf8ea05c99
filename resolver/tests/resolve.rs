//! End-to-end scenarios against mock nameservers on loopback.

use core::cell::RefCell;
use core::net::{IpAddr, Ipv4Addr};
use core::time::Duration;
use std::io::{Read as _, Write as _};
use std::net::{TcpListener, UdpSocket};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use bilge::prelude::*;
use log::LevelFilter;
use resolver::wire::{rcode, Flags, Response, Writer, CLASS_IN, TYPE_A, TYPE_AAAA};
use resolver::{Bits, Config, Context, Handle, Hosts, Outcome};
use runtime::Logger;
use stakker::{actor, ret_nop, ret_shutdown, ret_some_to, Actor, CX};

/// Build a reply to `query`: echo the question, answer with `ips`.
fn reply(query: &[u8], code: u16, tc: bool, ips: &[Ipv4Addr]) -> Vec<u8> {
	let q = Response::parse(query).unwrap();
	let question = q.questions().next().unwrap();

	let flags = Flags::new(u4::new(code as u8), false, false, false, true, true, tc, false, u4::new(0), true);

	let mut w = Writer::new();

	w.header(q.id(), flags, 1, ips.len() as u16, 0, 0);
	w.question(&question.name, question.qtype, CLASS_IN).unwrap();

	for ip in ips {
		w.record(&question.name, TYPE_A, CLASS_IN, 60, &ip.octets()).unwrap();
	}

	w.finish()
}

/// A mock nameserver on a loopback address. `respond` may decline to answer.
fn udp_server(sock: UdpSocket, respond: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Arc<AtomicUsize> {
	let hits = Arc::new(AtomicUsize::new(0));
	let seen = hits.clone();

	sock.set_read_timeout(Some(Duration::from_secs(4))).unwrap();

	thread::spawn(move || {
		let mut buf = [0u8; 2048];

		while let Ok((n, peer)) = sock.recv_from(&mut buf) {
			seen.fetch_add(1, Ordering::SeqCst);

			if let Some(resp) = respond(&buf[..n]) {
				let _ = sock.send_to(&resp, peer);
			}
		}
	});

	hits
}

/// A mock nameserver answering one length-prefixed query over TCP.
fn tcp_server(listener: TcpListener, respond: impl Fn(&[u8]) -> Vec<u8> + Send + 'static) {
	thread::spawn(move || {
		let Ok((mut sock, _)) = listener.accept() else { return };

		let mut prefix = [0u8; 2];
		if sock.read_exact(&mut prefix).is_err() {
			return;
		}

		let mut msg = vec![0u8; u16::from_be_bytes(prefix) as usize];
		if sock.read_exact(&mut msg).is_err() {
			return;
		}

		let resp = respond(&msg);

		let _ = sock.write_all(&(resp.len() as u16).to_be_bytes());
		let _ = sock.write_all(&resp);
	});
}

/// Bind mock-server sockets for every IP on one shared port.
fn bind_all(ips: &[&str]) -> Vec<UdpSocket> {
	'outer: for _ in 0..16 {
		let first = UdpSocket::bind((ips[0], 0)).unwrap();
		let port = first.local_addr().unwrap().port();

		let mut socks = vec![first];

		for ip in &ips[1..] {
			match UdpSocket::bind((*ip, port)) {
				Ok(sock) => socks.push(sock),
				Err(_) => continue 'outer,
			}
		}

		return socks;
	}

	panic!("could not find a shared free port");
}

struct Sink {
	seen: Rc<RefCell<Vec<Outcome>>>,
	want: usize,
}

impl Sink {
	fn init(cx: CX![], want: usize, seen: Rc<RefCell<Vec<Outcome>>>) -> Option<Self> {
		// Failsafe: a wedged scenario must still end the loop. Stopping this
		// actor shuts the run loop down through its parent notification.
		let me = cx.access_actor().clone();

		cx.after(Duration::from_secs(10), move |s| me.apply(s, |_, cx| cx.stop()));

		Some(Sink { seen, want })
	}

	fn recv(&mut self, cx: CX![], outcome: Outcome) {
		self.seen.borrow_mut().push(outcome);

		if self.seen.borrow().len() >= self.want {
			cx.stop();
		}
	}
}

/// Run `queries` against a context until `want` outcomes arrive (or the
/// failsafe deadline passes) and return what the handlers saw.
fn resolve(config: Config, hosts: Hosts, queries: &[(&str, u16)], want: usize) -> Vec<Outcome> {
	Logger::init(LevelFilter::Debug);

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let seen = Rc::new(RefCell::new(Vec::new()));
	let sink = actor!(s, Sink::init(want, seen.clone()), ret_shutdown!(s));
	let ctx = actor!(s, Context::init(config, hosts), ret_nop!());

	s.run(Instant::now(), false);

	let sink: Actor<Sink> = sink.clone();
	let queries: Vec<(String, u16)> = queries.iter().map(|(n, t)| (n.to_string(), *t)).collect();

	ctx.apply(s, move |c, cx| {
		for (name, qtype) in &queries {
			let sink = sink.clone();
			let ret = ret_some_to!([sink], recv() as (Outcome));
			c.query(cx, name, *qtype, Bits::default(), ret);
		}
	});

	runtime::exec(&mut stakker, || {}).unwrap();

	let out = std::mem::take(&mut *seen.borrow_mut());
	out
}

fn config_for(servers: &[&UdpSocket]) -> Config {
	Config {
		nameservers: servers.iter().map(|s| s.local_addr().unwrap().ip()).collect(),
		port: servers[0].local_addr().unwrap().port(),
		interval: Duration::from_millis(100),
		timeout: Duration::from_secs(3),
		attempts: 3,
		..Config::default()
	}
}

fn resolved_ips(outcome: &Outcome) -> Vec<IpAddr> {
	match outcome {
		Outcome::Resolved(r) => r.answers().filter_map(|rec| rec.ip()).collect(),
		other => panic!("expected a resolved outcome, got {other:?}"),
	}
}

#[test]
fn single_server_success() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	let answer = Ipv4Addr::new(1, 2, 3, 4);
	udp_server(socks.into_iter().next().unwrap(), move |q| Some(reply(q, rcode::NOERROR, false, &[answer])));

	let started = Instant::now();
	let seen = resolve(config, Hosts::default(), &[("example.com", TYPE_A)], 1);

	assert_eq!(seen.len(), 1);
	assert_eq!(resolved_ips(&seen[0]), vec![IpAddr::V4(answer)]);
	assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn second_server_answers_when_the_first_is_silent() {
	let mut socks = bind_all(&["127.0.0.1", "127.0.0.2"]);
	let config = config_for(&[&socks[0], &socks[1]]);

	let second = socks.pop().unwrap();
	let first = socks.pop().unwrap();

	let silent = udp_server(first, |_| None);
	let answering = udp_server(second, |q| Some(reply(q, rcode::NOERROR, false, &[Ipv4Addr::new(1, 2, 3, 4)])));

	let started = Instant::now();
	let seen = resolve(config.clone(), Hosts::default(), &[("example.com", TYPE_A)], 1);

	// The first attempt went to the silent server, the retransmit to the
	// answering one after one interval.
	assert_eq!(resolved_ips(&seen[0]).len(), 1);
	assert!(started.elapsed() >= config.interval);
	assert!(silent.load(Ordering::SeqCst) >= 1);
	assert_eq!(answering.load(Ordering::SeqCst), 1);
}

#[test]
fn exhausted_attempts_time_out() {
	let socks = bind_all(&["127.0.0.1"]);

	let mut config = config_for(&[&socks[0]]);
	config.timeout = Duration::from_millis(600);

	let silent = udp_server(socks.into_iter().next().unwrap(), |_| None);

	let seen = resolve(config.clone(), Hosts::default(), &[("example.com", TYPE_A)], 1);

	assert!(matches!(seen[0], Outcome::Timeout));
	assert_eq!(silent.load(Ordering::SeqCst), config.attempts as usize);
}

#[test]
fn upstream_errors_are_reported() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::REFUSED, false, &[])));

	let seen = resolve(config, Hosts::default(), &[("example.com", TYPE_A)], 1);

	assert!(matches!(seen[0], Outcome::Failure(rcode::REFUSED)));
}

#[test]
fn truncation_escalates_to_tcp() {
	let socks = bind_all(&["127.0.0.1"]);
	let addr = socks[0].local_addr().unwrap();
	let config = config_for(&[&socks[0]]);

	// UDP serves a truncated teaser; the full answer only fits over TCP.
	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::NOERROR, true, &[])));
	tcp_server(TcpListener::bind(addr).unwrap(), |q| reply(q, rcode::NOERROR, false, &[Ipv4Addr::new(5, 6, 7, 8)]));

	let seen = resolve(config, Hosts::default(), &[("example.com", TYPE_A)], 1);

	let Outcome::Resolved(r) = &seen[0] else { panic!("expected a resolved outcome") };

	assert!(!r.truncated());
	assert_eq!(resolved_ips(&seen[0]), vec![IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8))]);
}

#[test]
fn refused_tcp_falls_back_to_the_truncated_answer() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	// Truncated UDP answer with data, and nobody listening on TCP.
	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::NOERROR, true, &[Ipv4Addr::new(9, 9, 9, 9)])));

	let seen = resolve(config, Hosts::default(), &[("example.com", TYPE_A)], 1);

	let Outcome::Resolved(r) = &seen[0] else { panic!("expected the stashed truncated answer") };

	assert!(r.truncated());
	assert_eq!(resolved_ips(&seen[0]), vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]);
}

#[test]
fn nxdomain_is_masked_for_known_hosts() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::NXDOMAIN, false, &[])));

	let mut hosts = Hosts::default();
	hosts.insert("fixture.local", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)));

	// The host table only knows an IPv4 address, so the AAAA query goes
	// upstream; the NXDOMAIN it gets back must not surface.
	let seen = resolve(config, hosts, &[("fixture.local", TYPE_AAAA)], 1);

	let Outcome::Resolved(r) = &seen[0] else { panic!("expected a masked success") };

	assert_eq!(r.rcode(), rcode::NOERROR);
	assert_eq!(r.answers().count(), 0);
	assert_eq!(r.questions().next().unwrap().name, "fixture.local");
}

#[test]
fn host_table_answers_locally() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	let hits = udp_server(socks.into_iter().next().unwrap(), |_| None);

	let mut hosts = Hosts::default();
	hosts.insert("fixture.local", IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)));

	let seen = resolve(config, hosts, &[("fixture.local", TYPE_A)], 1);

	assert_eq!(resolved_ips(&seen[0]), vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))]);
	assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn overflow_pressure_resolves_everything() {
	let socks = bind_all(&["127.0.0.1"]);

	let mut config = config_for(&[&socks[0]]);
	config.capacity = 4;

	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::NOERROR, false, &[Ipv4Addr::new(1, 1, 1, 1)])));

	let queries: Vec<(String, u16)> = (0..10).map(|i| (format!("h{i}.example.com"), TYPE_A)).collect();
	let borrowed: Vec<(&str, u16)> = queries.iter().map(|(n, t)| (n.as_str(), *t)).collect();

	let seen = resolve(config, Hosts::default(), &borrowed, 10);

	assert_eq!(seen.len(), 10);

	for outcome in &seen {
		assert_eq!(resolved_ips(outcome), vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]);
	}
}

/// A handler that re-enters the resolver from inside its own callback: it
/// admits a second query and cancels the already-finished first handle.
struct Chain {
	ctx: Actor<Context>,
	first: Option<Handle>,
	seen: Rc<RefCell<Vec<&'static str>>>,
}

impl Chain {
	fn init(cx: CX![], ctx: Actor<Context>, seen: Rc<RefCell<Vec<&'static str>>>) -> Option<Self> {
		let me = cx.access_actor().clone();

		cx.after(Duration::from_secs(10), move |s| me.apply(s, |_, cx| cx.stop()));

		let me = cx.access_actor().clone();
		let target = ctx.clone();
		let ret = ret_some_to!([cx], first_done() as (Outcome));

		cx.defer(move |s| {
			target.apply(s, move |c, cx| {
				let h = c.query(cx, "a.example.com", TYPE_A, Bits::default(), ret);

				cx.defer(move |s| me.apply(s, move |chain, _| chain.first = h));
			})
		});

		Some(Chain { ctx, first: None, seen })
	}

	fn first_done(&mut self, cx: CX![], _: Outcome) {
		self.seen.borrow_mut().push("first");

		let target = self.ctx.clone();
		let stale = self.first.take();
		let ret = ret_some_to!([cx], second_done() as (Outcome));

		cx.defer(move |s| {
			target.apply(s, move |c, cx| {
				// The first lookup already delivered; this must be a no-op.
				if let Some(h) = stale {
					c.cancel(cx, h);
				}

				c.query(cx, "b.example.com", TYPE_A, Bits::default(), ret);
			})
		});
	}

	fn second_done(&mut self, cx: CX![], _: Outcome) {
		self.seen.borrow_mut().push("second");
		cx.stop();
	}
}

#[test]
fn callbacks_may_reenter_the_resolver() {
	let socks = bind_all(&["127.0.0.1"]);
	let config = config_for(&[&socks[0]]);

	udp_server(socks.into_iter().next().unwrap(), |q| Some(reply(q, rcode::NOERROR, false, &[Ipv4Addr::new(2, 2, 2, 2)])));

	Logger::init(LevelFilter::Debug);

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let seen = Rc::new(RefCell::new(Vec::new()));
	let ctx = actor!(s, Context::init(config, Hosts::default()), ret_nop!());

	let chain: Actor<Context> = ctx.clone();
	let _driver = actor!(s, Chain::init(chain, seen.clone()), ret_shutdown!(s));

	runtime::exec(&mut stakker, || {}).unwrap();

	assert_eq!(*seen.borrow(), vec!["first", "second"]);
}
