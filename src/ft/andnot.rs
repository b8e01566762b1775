use std::{cmp::Ordering, collections::BinaryHeap};

use super::{
	children_equal_unordered, compare_children, serial, Direction, FtIterator, FtIteratorType,
	FtKey, MutateFn, MutateOutcome,
};

/// Subtrahend heap entry: ranked so the producer closest to the base
/// iterator's key surfaces first.
struct HeapItem<K: FtKey> {
	key: K,
	index: usize,
	forward: bool,
}

impl<K: FtKey> PartialEq for HeapItem<K> {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key && self.index == other.index
	}
}

impl<K: FtKey> Eq for HeapItem<K> {}

impl<K: FtKey> Ord for HeapItem<K> {
	fn cmp(&self, other: &Self) -> Ordering {
		let by_key = if self.forward {
			other.key.cmp(&self.key)
		} else {
			self.key.cmp(&other.key)
		};
		by_key.then_with(|| other.index.cmp(&self.index))
	}
}

impl<K: FtKey> PartialOrd for HeapItem<K> {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

/// AND-NOT joining iterator: yields the base iterator's keys except those
/// produced by any subtrahend. The first inner iterator is the base; the
/// rest feed the subtrahend heap.
pub struct FtAndNotIterator<K: FtKey = u64> {
	direction: Direction,
	// joinable[0] is the base iterator
	joinable: Vec<Box<dyn FtIterator<K>>>,
	heap: BinaryHeap<HeapItem<K>>,
	end: bool,
}

impl<K: FtKey> FtAndNotIterator<K> {
	pub fn new(inner: Vec<Box<dyn FtIterator<K>>>, direction: Direction) -> Self {
		assert!(
			!inner.is_empty(),
			"AND-NOT requires at least the base iterator"
		);
		let mut result = Self {
			direction,
			joinable: inner,
			heap: BinaryHeap::new(),
			end: false,
		};
		if result.joinable[0].is_end() {
			result.end = true;
			return result;
		}
		result.init_heap();
		let key = result.joinable[0].key();
		if !result.in_result(key) {
			result.step();
		}
		result
	}

	fn init_heap(&mut self) {
		let forward = self.direction == Direction::Forward;
		self.heap = self
			.joinable
			.iter()
			.enumerate()
			.skip(1)
			.filter(|(_, it)| !it.is_end())
			.map(|(index, it)| HeapItem {
				key: it.key(),
				index,
				forward,
			})
			.collect();
	}

	fn set_end(&mut self) {
		self.end = true;
	}

	/// Is `key` part of the result, i.e. not produced by any subtrahend?
	/// Lagging subtrahends are advanced (or dropped) on the way.
	fn in_result(&mut self, key: K) -> bool {
		while let Some(top) = self.heap.peek() {
			if top.key == key {
				return false;
			}
			if self.direction.cmp(&top.key, &key) == Ordering::Greater {
				break;
			}
			let mut item = self.heap.pop().unwrap();
			let it = &mut self.joinable[item.index];
			if it.join(key, self.direction) {
				item.key = it.key();
				self.heap.push(item);
			}
		}
		// re-check: the joined subtrahend may have landed exactly on the key
		match self.heap.peek() {
			Some(top) => top.key != key,
			None => true,
		}
	}

	/// Advance the base until it lands on a key that is in the result.
	/// Returns `false` when the base ends first.
	fn step(&mut self) -> bool {
		loop {
			self.joinable[0].advance();
			if self.joinable[0].is_end() {
				self.set_end();
				return false;
			}
			let key = self.joinable[0].key();
			if self.in_result(key) {
				return true;
			}
		}
	}

	fn base(&self) -> &dyn FtIterator<K> {
		self.joinable[0].as_ref()
	}
}

impl<K: FtKey> FtIterator<K> for FtAndNotIterator<K> {
	fn is_end(&self) -> bool {
		self.end
	}

	fn key(&self) -> K {
		debug_assert!(!self.end);
		self.base().key()
	}

	fn direction(&self) -> Direction {
		self.direction
	}

	fn advance(&mut self) {
		debug_assert!(!self.end);
		self.step();
	}

	fn join(&mut self, join_key: K, dir: Direction) -> bool {
		debug_assert_eq!(dir, self.direction);
		if self.end {
			return false;
		}
		// join the base first; if it survives, walk it forward until the
		// subtrahends no longer exclude its key
		if !self.joinable[0].join(join_key, dir) {
			self.set_end();
			return false;
		}
		let key = self.joinable[0].key();
		if self.in_result(key) {
			return true;
		}
		self.step()
	}

	fn join_bound(&mut self, join_key: K) {
		self.join(join_key, Direction::Backward);
	}

	fn peek(&self, join_key: K) -> Option<K> {
		// exclusions make a closed-form answer impossible; probe a fresh
		// backward stream over the same data
		let mut probe = self.begin_typed(Direction::Backward);
		if probe.is_end() {
			return None;
		}
		probe
			.join(join_key, Direction::Backward)
			.then(|| probe.key())
	}

	fn is_next_key_duplicated(&self) -> bool {
		self.base().is_next_key_duplicated()
	}

	fn begin_typed(&self, dir: Direction) -> Box<dyn FtIterator<K>> {
		let inner = self
			.joinable
			.iter()
			.map(|it| it.begin_typed(dir))
			.collect();
		Box::new(Self::new(inner, dir))
	}

	fn clone_boxed(&self) -> Box<dyn FtIterator<K>> {
		let mut copy = Self {
			direction: self.direction,
			joinable: self.joinable.iter().map(|it| it.clone_boxed()).collect(),
			heap: BinaryHeap::new(),
			end: self.end,
		};
		if !copy.end {
			copy.init_heap();
		}
		Box::new(copy)
	}

	fn limit_by(&mut self, key: Option<K>) -> bool {
		if !self.joinable[0].limit_by(key) {
			self.set_end();
			return false;
		}
		for it in self.joinable.iter_mut().skip(1) {
			it.limit_by(key);
		}
		self.init_heap();
		let current = self.joinable[0].key();
		if !self.in_result(current) && !self.step() {
			return false;
		}
		true
	}

	fn scan_query_tree(&self, scan: &mut dyn FnMut(&dyn FtIterator<K>, usize), depth: usize) {
		scan(self, depth);
		for it in &self.joinable {
			it.scan_query_tree(scan, depth + 1);
		}
	}

	fn depth(&self) -> usize {
		1 + self
			.joinable
			.iter()
			.map(|it| it.depth())
			.max()
			.unwrap_or(0)
	}

	fn stop(&mut self) {
		self.heap.clear();
		self.set_end();
	}

	fn find_by(&self, f: &mut dyn FnMut(&dyn FtIterator<K>) -> bool) -> bool {
		if !f(self) {
			return false;
		}
		self.joinable.iter().all(|it| it.find_by(f))
	}

	fn mutate_inner(&mut self, f: &mut MutateFn<K>) -> MutateOutcome {
		let (mutated, valid) = f(self);
		if mutated {
			return (mutated, valid);
		}
		let mut was_mutated = false;
		let mut was_end = false;
		for it in self.joinable.iter_mut() {
			let (inner_mutated, inner_valid) = it.mutate_inner(f);
			was_mutated |= inner_mutated;
			if !inner_valid {
				was_end = true;
				break;
			}
		}
		if was_end || self.joinable[0].is_end() {
			self.set_end();
			return (was_mutated, false);
		}
		self.init_heap();
		let key = self.joinable[0].key();
		if !self.in_result(key) && !self.step() {
			return (was_mutated, false);
		}
		(was_mutated, true)
	}

	fn serial_type(&self) -> FtIteratorType {
		FtIteratorType::JoinAndNot
	}

	fn serialize(&self, out: &mut Vec<u8>) {
		serial::write_header(out, FtIteratorType::JoinAndNot, K::TYPE_TAG);
		out.push(self.direction.as_i8() as u8);
		serial::write_children(out, &self.joinable);
	}

	fn signature(&self, out: &mut Vec<u8>) {
		serial::combine_signatures(b"ANDNOT", &self.children(), out);
	}

	fn equal(&self, other: &dyn FtIterator<K>) -> bool {
		if other.serial_type() != FtIteratorType::JoinAndNot {
			return false;
		}
		let mine = self.children();
		let theirs = other.children();
		if mine.len() != theirs.len() || mine.is_empty() || theirs.is_empty() {
			return false;
		}
		// the base is positional; the subtrahends are not
		if !mine[0].equal(theirs[0]) {
			return false;
		}
		children_equal_unordered(&mine[1..], &theirs[1..])
	}

	fn compare_to(&self, other: &dyn FtIterator<K>) -> f64 {
		if other.serial_type() != FtIteratorType::JoinAndNot {
			return 1.0;
		}
		let mine = self.children();
		let theirs = other.children();
		if mine.len() != theirs.len() || mine.is_empty() || theirs.is_empty() {
			return 1.0;
		}
		let base_distance = mine[0].compare_to(theirs[0]);
		if mine.len() == 1 {
			return base_distance;
		}
		let rest_distance = compare_children(&mine[1..], &theirs[1..]);
		(base_distance + rest_distance) / 2.0
	}

	fn children(&self) -> Vec<&dyn FtIterator<K>> {
		self.joinable.iter().map(|it| it.as_ref()).collect()
	}

	fn as_dyn(&self) -> &dyn FtIterator<K> {
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ft::{collect_keys, FtIndexIterator, PostingList};

	fn leaf(keys: &[u64], direction: Direction) -> Box<dyn FtIterator<u64>> {
		let index_key = keys.iter().sum();
		Box::new(FtIndexIterator::new(
			PostingList::new(keys.to_vec()),
			direction,
			index_key,
		))
	}

	#[test]
	fn subtracts_every_subtrahend_key() {
		// given: base = [1..10], not = {3, 6, 9}
		let mut it = FtAndNotIterator::new(
			vec![
				leaf(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], Direction::Forward),
				leaf(&[3, 6, 9], Direction::Forward),
			],
			Direction::Forward,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![1, 2, 4, 5, 7, 8, 10]);
	}

	#[test]
	fn multiple_subtrahends_union_their_exclusions() {
		// given
		let mut it = FtAndNotIterator::new(
			vec![
				leaf(&[1, 2, 3, 4, 5, 6], Direction::Forward),
				leaf(&[2, 5], Direction::Forward),
				leaf(&[3], Direction::Forward),
			],
			Direction::Forward,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![1, 4, 6]);
	}

	#[test]
	fn base_fully_subtracted_ends_immediately() {
		// given
		let it = FtAndNotIterator::new(
			vec![
				leaf(&[2, 4], Direction::Forward),
				leaf(&[2, 4], Direction::Forward),
			],
			Direction::Forward,
		);

		// then
		assert!(it.is_end());
	}

	#[test]
	fn join_lands_on_an_included_key() {
		// given
		let mut it = FtAndNotIterator::new(
			vec![
				leaf(&[1, 3, 5, 6, 9], Direction::Forward),
				leaf(&[5, 6], Direction::Forward),
			],
			Direction::Forward,
		);

		// when: 5 and 6 are excluded, so joining to 4 must land on 9
		assert!(it.join(4, Direction::Forward));

		// then
		assert_eq!(it.key(), 9);
	}

	#[test]
	fn works_backwards() {
		// given
		let mut it = FtAndNotIterator::new(
			vec![
				leaf(&[1, 2, 3, 4], Direction::Backward),
				leaf(&[2, 4], Direction::Backward),
			],
			Direction::Backward,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![3, 1]);
	}

	#[test]
	fn exhausted_subtrahends_stop_excluding() {
		// given: the subtrahend ends before the base
		let mut it = FtAndNotIterator::new(
			vec![
				leaf(&[1, 2, 10, 11], Direction::Forward),
				leaf(&[1], Direction::Forward),
			],
			Direction::Forward,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![2, 10, 11]);
	}

	#[test]
	fn equal_requires_the_same_base() {
		// given
		let make = |base: &[u64], sub: &[u64]| {
			FtAndNotIterator::new(
				vec![leaf(base, Direction::Forward), leaf(sub, Direction::Forward)],
				Direction::Forward,
			)
		};
		let a = make(&[1, 2], &[2]);
		let b = make(&[1, 2], &[2]);
		let c = make(&[2], &[1, 2]);

		// then
		assert!(a.equal(b.as_dyn()));
		assert!(!a.equal(c.as_dyn()));
	}
}
