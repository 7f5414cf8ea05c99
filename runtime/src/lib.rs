extern crate alloc;

use alloc::collections::VecDeque;
use core::cell::RefCell;
use core::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use core::time::Duration;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, UdpSocket};

use log::{debug, error, trace, warn};
use socket2::{Domain, Socket, Type};
use stakker::{Fwd, Ret};

mod logger;
mod rt;

pub use logger::Logger;
pub use rt::*;

pub type Result<T = (), E = ()> = core::result::Result<T, E>;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub const INPROGRESS: Option<i32> = Some(libc::EINPROGRESS);

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub use windows_sys::Win32::Networking::WinSock::{
		WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub const INPROGRESS: Option<i32> = None;

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}
}

pub use sys::AsRawFd;
use sys::*;

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

/// Datagrams larger than the usual Internet MTU are not expected; peers are
/// told our receive limit out of band.
const DGRAM_BUF: usize = 2048;
const STREAM_BUF: usize = 4096;

thread_local! {
	static GLOBAL: RefCell<State> = const {
		RefCell::new(State {
			fds: Vec::new(),
			entries: Vec::new()
		})
	};
}

struct State {
	fds: Vec<Poll>,
	entries: Vec<Entry>,
}

impl State {
	fn with<X, F: FnOnce(&mut Self) -> X>(f: F) -> X {
		GLOBAL.with(|x| f(&mut x.borrow_mut()))
	}

	fn idx_of(&self, raw: RawFd) -> Option<usize> {
		self.fds.iter().position(|f| f.fd == raw)
	}

	/// Returns whether any more I/O is waiting.
	fn is_io(&self) -> bool {
		!self.fds.is_empty()
	}

	/// Poll the fds. Returns whether any file descriptors are ready for I/O.
	fn poll(&mut self, timeout: Option<Duration>) -> Result<bool> {
		let ret = unsafe {
			poll(
				self.fds.as_mut_ptr(),
				self.fds.len().try_into().expect("Fewer than u32::MAX fds"),
				as_timeout(timeout),
			)
		};

		let pending: u32 = ret.try_into().map_err(|_| error!("poll() failed: {}", io::Error::last_os_error()))?;

		if pending == 0 {
			return Ok(false);
		}

		for idx in 0..self.fds.len() {
			let Poll { events, revents, .. } = &mut self.fds[idx];
			let entry = &mut self.entries[idx];

			if *revents == 0 {
				continue;
			}

			let r = *revents;
			*revents = 0;

			if r & POLLNVAL != 0 {
				error!("Polled socket is invalid");
				entry.die(false);
			} else if r & POLLERR != 0 {
				entry.die(false);
			} else {
				if r & POLLIN != 0 {
					entry.flush_read();
				}

				if r & POLLOUT != 0 {
					entry.flush_write();
				}

				if r & POLLHUP != 0 {
					entry.die(true);
				}
			}

			// A dead entry stops asking for events; its slot is reclaimed
			// when the owning handle drops.
			*events = entry.interest() as _;
		}

		Ok(true)
	}

	fn register(&mut self, raw: RawFd, entry: Entry) {
		let events = entry.interest() as _;

		self.fds.push(Poll { fd: raw, events, revents: 0 });
		self.entries.push(entry);
	}

	fn deregister(&mut self, raw: RawFd) {
		if let Some(idx) = self.idx_of(raw) {
			self.fds.swap_remove(idx);
			self.entries.swap_remove(idx);
		}
	}
}

enum Entry {
	/// An unconnected datagram socket. Each inbound datagram is forwarded
	/// together with its source address.
	Datagram { sock: UdpSocket, fwd: Fwd<(SocketAddr, Box<[u8]>)> },
	/// A byte stream. Inbound bytes are forwarded as chunks in arrival order;
	/// framing is the receiver's concern.
	Stream(Stream),
}

struct Stream {
	sock: TcpStream,
	fwd: Fwd<Box<[u8]>>,
	/// Pending connect notification, consumed on first writability or on a
	/// socket error.
	ready: Option<Ret<bool>>,
	/// Invoked once when the connection ends; the flag tells an orderly
	/// close from a lost connection.
	closed: Option<Fwd<bool>>,
	/// Bytes accepted by `send` but not yet by the kernel.
	queue: VecDeque<Box<[u8]>>,
	/// How much of the queue front has been written already.
	sent: usize,
}

impl Stream {
	fn is_dead(&self) -> bool {
		self.ready.is_none() && self.closed.is_none()
	}

	/// Tear the stream down. A death while the connect notification is still
	/// pending reports a failed connect; afterwards it reports the end of the
	/// connection, orderly (`eof`) or not.
	fn die(&mut self, eof: bool) {
		if let Some(ready) = self.ready.take() {
			trace!("Connect failed");
			ready.ret(false);
			self.closed = None;
		} else if let Some(closed) = self.closed.take() {
			closed.fwd(eof);
		}

		self.queue.clear();
		self.sent = 0;
	}

	fn flush_write(&mut self) {
		if let Some(ready) = self.ready.take() {
			ready.ret(true);
		}

		while let Some(buf) = self.queue.front() {
			match self.sock.write(&buf[self.sent..]) {
				Ok(n) => {
					self.sent += n;

					if self.sent == buf.len() {
						self.queue.pop_front();
						self.sent = 0;
					}
				}
				Err(e) if e.kind() == ErrorKind::WouldBlock => return,
				Err(e) if e.kind() == ErrorKind::Interrupted => {}
				Err(e) => {
					debug!("Stream write failed: {e}");
					return self.die(false);
				}
			}
		}
	}
}

impl Entry {
	fn die(&mut self, eof: bool) {
		match self {
			// A datagram socket has no connection to lose; an error here is
			// transient (e.g. a routed ICMP error) and the socket stays usable.
			Entry::Datagram { .. } => debug!("Datagram socket error: {}", io::Error::last_os_error()),
			Entry::Stream(s) => s.die(eof),
		}
	}

	fn flush_read(&mut self) {
		match self {
			Entry::Datagram { sock, fwd } => {
				let mut buf = [0u8; DGRAM_BUF];

				loop {
					match sock.recv_from(&mut buf) {
						Ok((n, peer)) => fwd.fwd((peer, buf[..n].into())),
						Err(e) if e.kind() == ErrorKind::WouldBlock => break,
						Err(e) if e.kind() == ErrorKind::Interrupted => {}
						Err(e) => {
							debug!("Datagram receive failed: {e}");
							break;
						}
					}
				}
			}
			Entry::Stream(s) => {
				let mut buf = [0u8; STREAM_BUF];

				loop {
					match s.sock.read(&mut buf) {
						Ok(0) => return s.die(true),
						Ok(n) => s.fwd.fwd(buf[..n].into()),
						Err(e) if e.kind() == ErrorKind::WouldBlock => break,
						Err(e) if e.kind() == ErrorKind::Interrupted => {}
						Err(e) => {
							debug!("Stream receive failed: {e}");
							return s.die(false);
						}
					}
				}
			}
		}
	}

	fn flush_write(&mut self) {
		match self {
			Entry::Datagram { .. } => {}
			Entry::Stream(s) => s.flush_write(),
		}
	}

	/// The poll events this entry still cares about.
	fn interest(&self) -> i32 {
		(match self {
			Entry::Datagram { .. } => POLLIN,
			Entry::Stream(s) if s.is_dead() => 0,
			Entry::Stream(s) if s.ready.is_some() || !s.queue.is_empty() => POLLIN | POLLOUT,
			Entry::Stream(_) => POLLIN,
		}) as _
	}
}

/// A registered unconnected UDP socket. Dropping the handle closes the socket
/// and removes it from the poll set.
pub struct Udp {
	raw: RawFd,
}

impl Udp {
	/// Open a non-blocking UDP socket of the given family, bound to an
	/// ephemeral port, and register it. `buffer` overrides the kernel
	/// send/receive buffer sizes.
	pub fn bind(v6: bool, buffer: Option<usize>, fwd: Fwd<(SocketAddr, Box<[u8]>)>) -> Result<Self> {
		let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };

		let sock = Socket::new(domain, Type::DGRAM, None).map_err(|e| error!("Failed to open UDP socket: {e}"))?;

		sock.set_nonblocking(true).map_err(|e| error!("Failed to unblock UDP socket: {e}"))?;

		if let Some(n) = buffer {
			sock.set_recv_buffer_size(n).map_err(|e| warn!("Failed to size receive buffer: {e}")).ok();
			sock.set_send_buffer_size(n).map_err(|e| warn!("Failed to size send buffer: {e}")).ok();
		}

		let any: SocketAddr = if v6 { (Ipv6Addr::UNSPECIFIED, 0).into() } else { (Ipv4Addr::UNSPECIFIED, 0).into() };

		sock.bind(&any.into()).map_err(|e| error!("Failed to bind UDP socket: {e}"))?;

		let sock: UdpSocket = sock.into();
		let raw = as_raw(&sock);

		State::with(|s| s.register(raw, Entry::Datagram { sock, fwd }));

		Ok(Udp { raw })
	}

	/// Write one datagram. A failed or partial write is reported but not
	/// retried; the datagram counts as dropped.
	pub fn send_to(&self, peer: SocketAddr, buf: &[u8]) -> Result {
		State::with(|s| {
			let idx = s.idx_of(self.raw).ok_or(())?;

			let Entry::Datagram { sock, .. } = &s.entries[idx] else { return Err(()) };

			match sock.send_to(buf, peer) {
				Ok(n) if n == buf.len() => Ok(()),
				Ok(n) => Err(warn!("Only sent {}/{} bytes to {}", n, buf.len(), peer)),
				Err(e) => Err(debug!("Datagram send to {peer} failed: {e}")),
			}
		})
	}
}

impl Drop for Udp {
	fn drop(&mut self) {
		State::with(|s| s.deregister(self.raw));
	}
}

/// A registered TCP connection, in progress or established. Dropping the
/// handle closes the connection and removes it from the poll set.
pub struct Tcp {
	raw: RawFd,
}

impl Tcp {
	/// Begin a non-blocking connect to `peer` and register the socket.
	/// `ready` is invoked once with the connect result; `fwd` receives
	/// inbound chunks and `closed` fires when an established connection ends.
	pub fn connect(peer: SocketAddr, fwd: Fwd<Box<[u8]>>, ready: Ret<bool>, closed: Fwd<bool>) -> Result<Self> {
		let domain = if peer.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };

		let sock = Socket::new(domain, Type::STREAM, None).map_err(|e| error!("Failed to open TCP socket: {e}"))?;

		sock.set_nonblocking(true).map_err(|e| error!("Failed to unblock TCP socket: {e}"))?;

		match sock.connect(&peer.into()) {
			Ok(()) => {}
			Err(e) if e.kind() == ErrorKind::WouldBlock => {}
			Err(e) if e.raw_os_error().is_some() && e.raw_os_error() == INPROGRESS => {}
			Err(e) => return Err(error!("Failed to connect to {peer}: {e}")),
		}

		let sock: TcpStream = sock.into();
		let raw = as_raw(&sock);

		let entry = Entry::Stream(Stream {
			sock,
			fwd,
			ready: Some(ready),
			closed: Some(closed),
			queue: VecDeque::new(),
			sent: 0,
		});

		State::with(|s| s.register(raw, entry));

		Ok(Tcp { raw })
	}

	/// Write bytes to the stream. Bytes the kernel does not take immediately,
	/// and all bytes while the connect is still in flight, are queued and
	/// flushed on writability.
	pub fn send(&self, buf: &[u8]) {
		State::with(|s| {
			let Some(idx) = s.idx_of(self.raw) else { return };

			let Entry::Stream(stream) = &mut s.entries[idx] else { return };

			if stream.is_dead() {
				return;
			}

			stream.queue.push_back(buf.into());

			if stream.ready.is_none() {
				stream.flush_write();
			}

			s.fds[idx].events = s.entries[idx].interest() as _;
		})
	}
}

impl Drop for Tcp {
	fn drop(&mut self) {
		State::with(|s| s.deregister(self.raw));
	}
}
