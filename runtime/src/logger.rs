use std::time::Instant;

use log::{Level, LevelFilter};
use nu_ansi_term::ansi::RESET;
use nu_ansi_term::{Color, Style};

/// Terminal logger stamping each line with the time since installation.
/// Retransmit and timeout behavior reads much better against a relative
/// clock than against wall-clock timestamps.
pub struct Logger {
	level: LevelFilter,
	start: Instant,
}

impl Logger {
	/// Install the logger with the given verbosity. Does nothing if some
	/// logger is already installed, so repeated calls are harmless.
	pub fn init(level: LevelFilter) {
		let logger: &'static Logger = Box::leak(Box::new(Logger { level, start: Instant::now() }));

		if log::set_logger(logger).is_ok() {
			log::set_max_level(level);
		}
	}
}

impl log::Log for Logger {
	fn enabled(&self, meta: &log::Metadata) -> bool {
		meta.level() <= self.level
	}

	fn log(&self, record: &log::Record) {
		if !self.enabled(record.metadata()) {
			return;
		}

		let color = match record.level() {
			Level::Error => Color::Red,
			Level::Warn => Color::Yellow,
			Level::Info => Color::Green,
			Level::Debug => Color::Blue,
			Level::Trace => Color::Purple,
		};

		let elapsed = self.start.elapsed();
		let dim = Style::new().dimmed().prefix();

		eprintln!(
			"{dim}{:4}.{:03}{RESET} {}{:5}{RESET} {dim}{}:{RESET} {}",
			elapsed.as_secs(),
			elapsed.subsec_millis(),
			color.bold().prefix(),
			record.level(),
			record.target(),
			record.args()
		);
	}

	fn flush(&self) {}
}
