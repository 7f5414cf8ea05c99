use slab::Slab;

/// Identifies one admitted lookup. The generation stamp detects a recycled
/// slot, so holding a handle past the end of its lookup is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
	idx: u32,
	gen: u32,
}

/// Which queue a lookup sits in. A lookup is in exactly one queue from
/// admission to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Queue {
	/// Has attempts left; its next send may be in the future.
	Pending,
	/// Admitted while the in-flight pool was saturated.
	Overflow,
	/// Out of attempts or escalated to TCP; kept until its deadline.
	Waiting,
}

struct Slot<T> {
	item: T,
	queue: Option<Queue>,
	prev: Option<u32>,
	next: Option<u32>,
}

/// Slab arena plus three intrusive FIFO queues over it. Push-back, pop-front,
/// and removal from the middle of a queue are all O(1); the links live inside
/// the slots.
pub(crate) struct Sched<T> {
	slots: Slab<Slot<T>>,
	/// Generation per slot index; bumped when the slot is vacated. Never
	/// shrinks.
	gens: Vec<u32>,
	/// Head and tail per queue.
	ends: [(Option<u32>, Option<u32>); 3],
	lens: [usize; 3],
}

impl<T> Sched<T> {
	pub fn new() -> Self {
		Sched {
			slots: Slab::new(),
			gens: Vec::new(),
			ends: [(None, None); 3],
			lens: [0; 3],
		}
	}

	fn slot(&self, h: Handle) -> Option<&Slot<T>> {
		(self.gens.get(h.idx as usize) == Some(&h.gen)).then(|| self.slots.get(h.idx as usize))?
	}

	fn slot_mut(&mut self, h: Handle) -> Option<&mut Slot<T>> {
		(self.gens.get(h.idx as usize) == Some(&h.gen)).then(|| self.slots.get_mut(h.idx as usize))?
	}

	/// Place an item in the arena. It belongs to no queue yet.
	pub fn insert(&mut self, item: T) -> Handle {
		let idx = self.slots.insert(Slot { item, queue: None, prev: None, next: None });

		if idx >= self.gens.len() {
			self.gens.resize(idx + 1, 0);
		}

		Handle { idx: idx as u32, gen: self.gens[idx] }
	}

	pub fn get(&self, h: Handle) -> Option<&T> {
		self.slot(h).map(|s| &s.item)
	}

	pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
		self.slot_mut(h).map(|s| &mut s.item)
	}

	pub fn queue_of(&self, h: Handle) -> Option<Queue> {
		self.slot(h)?.queue
	}

	/// Unlink and take the item out; the handle goes stale.
	pub fn remove(&mut self, h: Handle) -> Option<T> {
		self.unlink(h);

		self.slot(h)?;
		self.gens[h.idx as usize] += 1;

		Some(self.slots.remove(h.idx as usize).item)
	}

	/// Total items in the arena, queued or not.
	pub fn total(&self) -> usize {
		self.slots.len()
	}

	pub fn len(&self, q: Queue) -> usize {
		self.lens[q as usize]
	}

	pub fn push_back(&mut self, q: Queue, h: Handle) {
		self.unlink(h);

		if self.slot(h).is_none() {
			return;
		}

		let tail = self.ends[q as usize].1;

		let slot = &mut self.slots[h.idx as usize];
		slot.queue = Some(q);
		slot.prev = tail;
		slot.next = None;

		match tail {
			Some(t) => self.slots[t as usize].next = Some(h.idx),
			None => self.ends[q as usize].0 = Some(h.idx),
		}

		self.ends[q as usize].1 = Some(h.idx);
		self.lens[q as usize] += 1;
	}

	pub fn front(&self, q: Queue) -> Option<Handle> {
		let idx = self.ends[q as usize].0?;

		Some(Handle { idx, gen: self.gens[idx as usize] })
	}

	pub fn pop_front(&mut self, q: Queue) -> Option<Handle> {
		let h = self.front(q)?;

		self.unlink(h);

		Some(h)
	}

	/// The successor of `h` within its queue, captured before `h` is touched
	/// so queue walks survive the current element moving elsewhere.
	pub fn next_in(&self, h: Handle) -> Option<Handle> {
		let idx = self.slot(h)?.next?;

		Some(Handle { idx, gen: self.gens[idx as usize] })
	}

	/// Walk one queue front to back.
	pub fn iter(&self, q: Queue) -> impl Iterator<Item = Handle> + '_ {
		let mut next = self.front(q);

		core::iter::from_fn(move || {
			let h = next?;
			next = self.next_in(h);
			Some(h)
		})
	}

	pub fn unlink(&mut self, h: Handle) {
		let Some(slot) = self.slot_mut(h) else { return };

		let Some(q) = slot.queue.take() else { return };

		let prev = slot.prev.take();
		let next = slot.next.take();

		match prev {
			Some(p) => self.slots[p as usize].next = next,
			None => self.ends[q as usize].0 = next,
		}

		match next {
			Some(n) => self.slots[n as usize].prev = prev,
			None => self.ends[q as usize].1 = prev,
		}

		self.lens[q as usize] -= 1;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fifo_order() {
		let mut s = Sched::new();

		let a = s.insert('a');
		let b = s.insert('b');
		let c = s.insert('c');

		for h in [a, b, c] {
			s.push_back(Queue::Pending, h);
		}

		assert_eq!(s.len(Queue::Pending), 3);
		assert_eq!(s.iter(Queue::Pending).collect::<Vec<_>>(), vec![a, b, c]);

		assert_eq!(s.pop_front(Queue::Pending), Some(a));
		assert_eq!(s.pop_front(Queue::Pending), Some(b));
		assert_eq!(s.pop_front(Queue::Pending), Some(c));
		assert_eq!(s.pop_front(Queue::Pending), None);
	}

	#[test]
	fn unlink_from_the_middle() {
		let mut s = Sched::new();

		let hs: Vec<_> = "abcd".chars().map(|c| s.insert(c)).collect();

		for &h in &hs {
			s.push_back(Queue::Pending, h);
		}

		s.unlink(hs[1]);
		s.unlink(hs[3]);

		assert_eq!(s.iter(Queue::Pending).collect::<Vec<_>>(), vec![hs[0], hs[2]]);
		assert_eq!(s.len(Queue::Pending), 2);

		// Unlinking twice is a no-op.
		s.unlink(hs[1]);
		assert_eq!(s.len(Queue::Pending), 2);
	}

	#[test]
	fn moving_between_queues() {
		let mut s = Sched::new();

		let a = s.insert('a');
		let b = s.insert('b');

		s.push_back(Queue::Pending, a);
		s.push_back(Queue::Pending, b);

		s.push_back(Queue::Waiting, a);

		assert_eq!(s.queue_of(a), Some(Queue::Waiting));
		assert_eq!(s.iter(Queue::Pending).collect::<Vec<_>>(), vec![b]);
		assert_eq!(s.iter(Queue::Waiting).collect::<Vec<_>>(), vec![a]);
	}

	#[test]
	fn stale_handles_are_inert() {
		let mut s = Sched::new();

		let a = s.insert('a');
		s.push_back(Queue::Overflow, a);

		assert_eq!(s.remove(a), Some('a'));
		assert_eq!(s.len(Queue::Overflow), 0);

		// The slot is recycled; the old handle must not reach the new item.
		let b = s.insert('b');
		assert_eq!(b.idx, a.idx);
		assert!(s.get(a).is_none());
		assert_eq!(s.remove(a), None);
		assert_eq!(s.get(b), Some(&'b'));
	}
}
