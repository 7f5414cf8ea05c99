use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use stakker::Stakker;

use crate::{Result, State};

/// Set from the signal handler; checked once per loop turn.
static EXIT: AtomicBool = AtomicBool::new(false);
/// Whether the signal handler has been installed. The hook is process-wide,
/// so only the first `exec` on a process installs it.
static HOOKED: AtomicBool = AtomicBool::new(false);

/// A Stakker instance anchored to the current monotonic and wall-clock time,
/// ready for `exec`.
pub fn init() -> Stakker {
	let mut stakker = Stakker::new(Instant::now());
	stakker.set_systime(Some(SystemTime::now()));
	stakker
}

/// Drive actors, timers, and the registered sockets until shutdown, until
/// nothing is left that could wake us, or until an interrupt arrives. On
/// interrupt, `exit_fn` gets one chance to queue cleanup work before the
/// final queue run.
pub fn exec(stakker: &mut Stakker, exit_fn: impl FnOnce()) -> Result {
	if !HOOKED.swap(true, Ordering::Relaxed) {
		ctrlc::set_handler(|| EXIT.store(true, Ordering::Relaxed)).map_err(|e| log::error!("Failed to install the interrupt handler: {e}"))?;
	}

	// A leftover interrupt from an earlier run must not kill this one.
	EXIT.store(false, Ordering::Relaxed);

	let mut now = Instant::now();
	let mut idle = stakker.run(now, false);

	while stakker.not_shutdown() {
		if EXIT.load(Ordering::Relaxed) {
			exit_fn();
			stakker.run(now, false);
			break;
		}

		// With idle work queued, only glance at the sockets; otherwise
		// sleep until the next timer is due.
		let timeout = if idle { Some(Duration::ZERO) } else { stakker.next_wait(now) };

		// No timer armed and no socket registered: nothing can ever wake
		// us again.
		if timeout.is_none() && !State::with(|s| s.is_io()) {
			break;
		}

		let Ok(ready) = State::with(|s| s.poll(timeout)) else {
			// A broken poll set is not recoverable from here; let the exit
			// path clean up on the next turn.
			EXIT.store(true, Ordering::Relaxed);
			continue;
		};

		now = Instant::now();

		// Idle work runs only after a glance at the sockets found nothing.
		idle = stakker.run(now, idle && !ready);
	}

	Ok(())
}
