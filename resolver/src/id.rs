use std::collections::HashSet;

use rand::Rng;

/// How query IDs are chosen. Monotonic IDs are fine when every socket has a
/// random source port; randomized IDs are for deployments where the port is
/// fixed and the ID carries all the entropy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdStrategy {
	#[default]
	Monotonic,
	Random,
}

/// Allocator for 16-bit query IDs. Zero is never handed out, so it can mark
/// "no ID assigned".
pub enum Ids {
	/// Wraps through 1..=65535. Freeing is a no-op.
	Monotonic { cur: u16 },
	/// Uniform draws without replacement. Capped at half the ID space so a
	/// free slot is never more than a couple of redraws away.
	Random { taken: HashSet<u16> },
}

impl Ids {
	pub fn new(strategy: IdStrategy) -> Self {
		match strategy {
			IdStrategy::Monotonic => Ids::Monotonic { cur: 0 },
			IdStrategy::Random => Ids::Random { taken: HashSet::new() },
		}
	}

	/// How many IDs may be outstanding at once.
	pub fn capacity(&self) -> usize {
		match self {
			Ids::Monotonic { .. } => u16::MAX as usize,
			Ids::Random { .. } => 1 << 15,
		}
	}

	/// Produce a fresh ID, or `None` when the allocator is at capacity and
	/// the caller has to wait for a `free`.
	pub fn generate(&mut self) -> Option<u16> {
		match self {
			Ids::Monotonic { cur } => {
				*cur = (*cur % u16::MAX) + 1;
				Some(*cur)
			}
			Ids::Random { taken } => {
				if taken.len() >= 1 << 15 {
					return None;
				}

				let mut rng = rand::thread_rng();

				loop {
					let id = rng.gen_range(1..=u16::MAX);

					if taken.insert(id) {
						return Some(id);
					}
				}
			}
		}
	}

	/// Return an ID to the pool. The randomized strategy relies on prompt
	/// freeing to keep the space dense.
	pub fn free(&mut self, id: u16) {
		match self {
			Ids::Monotonic { .. } => {}
			Ids::Random { taken } => {
				taken.remove(&id);
			}
		}
	}
}
