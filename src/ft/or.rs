use std::{cmp::Ordering, collections::BinaryHeap};

use super::{
	children_equal_unordered, compare_children, serial, Direction, FtIterator, FtIteratorType,
	FtKey, MutateFn, MutateOutcome,
};

/// Heap entry referencing an inner iterator by index, ranked by its cached
/// current key. Direction determines whether the heap surfaces the smallest
/// or the greatest key.
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
		// BinaryHeap is a max-heap: reverse for forward iteration so the
		// smallest key surfaces first
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

/// OR / ORX joining iterator over a heap of inner iterators. Plain OR emits
/// every producer's key (duplicates included); ORX pops all producers of an
/// emitted key, enforcing at-most-one producer per key.
pub struct FtOrIterator<K: FtKey = u64> {
	direction: Direction,
	is_orx: bool,
	joinable: Vec<Box<dyn FtIterator<K>>>,
	heap: BinaryHeap<HeapItem<K>>,
	end: bool,
	join_key: K,
}

impl<K: FtKey> FtOrIterator<K> {
	pub fn new(inner: Vec<Box<dyn FtIterator<K>>>, direction: Direction, is_orx: bool) -> Self {
		assert!(!inner.is_empty(), "OR requires at least one inner iterator");
		let mut result = Self {
			direction,
			is_orx,
			joinable: inner,
			heap: BinaryHeap::new(),
			end: false,
			join_key: K::default(),
		};
		result.init_heap();
		result
	}

	pub fn is_orx(&self) -> bool {
		self.is_orx
	}

	fn init_heap(&mut self) {
		let forward = self.direction == Direction::Forward;
		self.heap = self
			.joinable
			.iter()
			.enumerate()
			.filter(|(_, it)| !it.is_end())
			.map(|(index, it)| HeapItem {
				key: it.key(),
				index,
				forward,
			})
			.collect();
		match self.heap.peek() {
			Some(top) => {
				self.join_key = top.key;
				self.end = false;
			}
			None => self.end = true,
		}
	}

	fn set_end(&mut self) {
		self.end = true;
	}

	/// Pop the top producer, advance it and re-insert it unless exhausted.
	fn step_top(&mut self) {
		let Some(mut top) = self.heap.pop() else {
			return;
		};
		let it = &mut self.joinable[top.index];
		it.advance();
		if !it.is_end() {
			top.key = it.key();
			self.heap.push(top);
		}
	}

	/// Number of inner iterators currently yielding the join key.
	pub fn join_count(&self) -> usize {
		self.heap
			.iter()
			.filter(|item| item.key == self.join_key)
			.count()
	}

	/// Are duplicate keys pending for the current element?
	pub fn has_duplicate_keys(&self) -> bool {
		self.join_count() > 1
			|| self
				.heap
				.iter()
				.any(|item| {
					item.key == self.join_key && self.joinable[item.index].is_next_key_duplicated()
				})
	}

	/// Drop the inner iterator currently yielding the result.
	/// Returns `false` when this renders the whole iterator end.
	pub fn stop_current_simple(&mut self) -> bool {
		self.heap.pop();
		match self.heap.peek() {
			Some(top) => {
				self.join_key = top.key;
				true
			}
			None => {
				self.set_end();
				false
			}
		}
	}
}

impl<K: FtKey> FtIterator<K> for FtOrIterator<K> {
	fn is_end(&self) -> bool {
		self.end
	}

	fn key(&self) -> K {
		debug_assert!(!self.end);
		self.join_key
	}

	fn direction(&self) -> Direction {
		self.direction
	}

	fn advance(&mut self) {
		debug_assert!(!self.end);
		if self.is_orx {
			let emitted = self.join_key;
			self.step_top();
			// pop all remaining producers of the emitted key
			while self
				.heap
				.peek()
				.is_some_and(|top| top.key == emitted)
			{
				self.step_top();
			}
		} else {
			self.step_top();
		}
		match self.heap.peek() {
			Some(top) => self.join_key = top.key,
			None => self.set_end(),
		}
	}

	fn join(&mut self, join_key: K, dir: Direction) -> bool {
		debug_assert_eq!(dir, self.direction);
		// advance every producer lagging behind the target, then re-rank
		while let Some(top) = self.heap.peek() {
			if dir.reached(&top.key, &join_key) {
				break;
			}
			let mut item = self.heap.pop().unwrap();
			let it = &mut self.joinable[item.index];
			if it.join(join_key, dir) {
				item.key = it.key();
				self.heap.push(item);
			}
		}
		match self.heap.peek() {
			Some(top) => {
				self.join_key = top.key;
				true
			}
			None => {
				self.set_end();
				false
			}
		}
	}

	fn join_bound(&mut self, join_key: K) {
		for it in self.joinable.iter_mut() {
			if !it.is_end() {
				it.join_bound(join_key);
			}
		}
		self.init_heap();
	}

	fn peek(&self, join_key: K) -> Option<K> {
		// the greatest inner peek not exceeding the target
		let mut best: Option<K> = None;
		for it in &self.joinable {
			if let Some(peeked) = it.peek(join_key) {
				if best.is_none() || peeked > best.unwrap() {
					best = Some(peeked);
					if peeked == join_key {
						break;
					}
				}
			}
		}
		best
	}

	fn is_next_key_duplicated(&self) -> bool {
		!self.is_orx && self.has_duplicate_keys()
	}

	fn begin_typed(&self, dir: Direction) -> Box<dyn FtIterator<K>> {
		let inner = self
			.joinable
			.iter()
			.map(|it| it.begin_typed(dir))
			.collect();
		Box::new(Self::new(inner, dir, self.is_orx))
	}

	fn clone_boxed(&self) -> Box<dyn FtIterator<K>> {
		let mut copy = Self {
			direction: self.direction,
			is_orx: self.is_orx,
			joinable: self.joinable.iter().map(|it| it.clone_boxed()).collect(),
			heap: BinaryHeap::new(),
			end: self.end,
			join_key: self.join_key,
		};
		if !copy.end {
			copy.init_heap();
			copy.join_key = self.join_key;
		}
		Box::new(copy)
	}

	fn limit_by(&mut self, key: Option<K>) -> bool {
		// bounds apply to the inner iterators; the heap must be rebuilt as
		// some of them may have been invalidated
		for it in self.joinable.iter_mut() {
			it.limit_by(key);
		}
		self.init_heap();
		!self.end
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
		for it in self.joinable.iter_mut() {
			let (inner_mutated, _) = it.mutate_inner(f);
			was_mutated |= inner_mutated;
		}
		// an OR stays valid while any producer remains
		self.init_heap();
		(was_mutated, !self.end)
	}

	fn serial_type(&self) -> FtIteratorType {
		FtIteratorType::JoinOr
	}

	fn serialize(&self, out: &mut Vec<u8>) {
		serial::write_header(out, FtIteratorType::JoinOr, K::TYPE_TAG);
		out.push(self.is_orx as u8);
		out.push(self.direction.as_i8() as u8);
		serial::write_children(out, &self.joinable);
	}

	fn signature(&self, out: &mut Vec<u8>) {
		serial::combine_signatures(b"OR", &self.children(), out);
	}

	fn equal(&self, other: &dyn FtIterator<K>) -> bool {
		if other.serial_type() != FtIteratorType::JoinOr {
			return false;
		}
		children_equal_unordered(&self.children(), &other.children())
	}

	fn compare_to(&self, other: &dyn FtIterator<K>) -> f64 {
		if other.serial_type() == FtIteratorType::JoinOr {
			return compare_children(&self.children(), &other.children());
		}
		if self.joinable.len() == 1 {
			return self.joinable[0].compare_to(other);
		}
		1.0
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
	use crate::ft::{collect_keys, FtAndIterator, FtIndexIterator, PostingList};

	fn leaf(keys: &[u64], direction: Direction) -> Box<dyn FtIterator<u64>> {
		let index_key = keys.iter().sum();
		Box::new(FtIndexIterator::new(
			PostingList::new(keys.to_vec()),
			direction,
			index_key,
		))
	}

	#[test]
	fn or_emits_duplicates_orx_does_not() {
		// given
		let inputs = || {
			vec![
				leaf(&[1, 3, 5], Direction::Forward),
				leaf(&[3, 4, 5], Direction::Forward),
			]
		};

		// when
		let mut or = FtOrIterator::new(inputs(), Direction::Forward, false);
		let mut orx = FtOrIterator::new(inputs(), Direction::Forward, true);

		// then
		assert_eq!(collect_keys(&mut or), vec![1, 3, 3, 4, 5, 5]);
		assert_eq!(collect_keys(&mut orx), vec![1, 3, 4, 5]);
	}

	#[test]
	fn orx_over_an_and_excludes_shared_keys() {
		// given: AND(A,B) = [2,3,5] and C = [5,6,7,8]
		let and = FtAndIterator::new(
			vec![
				leaf(&[1, 2, 3, 5, 8], Direction::Forward),
				leaf(&[2, 3, 4, 5, 7], Direction::Forward),
			],
			Direction::Forward,
			true,
		);
		let mut orx = FtOrIterator::new(
			vec![Box::new(and), leaf(&[5, 6, 7, 8], Direction::Forward)],
			Direction::Forward,
			true,
		);

		// then: 5 appears once even though both branches produce it
		assert_eq!(collect_keys(&mut orx), vec![2, 3, 5, 6, 7, 8]);
	}

	#[test]
	fn backward_or_merges_descending() {
		// given
		let mut or = FtOrIterator::new(
			vec![
				leaf(&[1, 4], Direction::Backward),
				leaf(&[2, 3], Direction::Backward),
			],
			Direction::Backward,
			true,
		);

		// then
		assert_eq!(collect_keys(&mut or), vec![4, 3, 2, 1]);
	}

	#[test]
	fn join_skips_lagging_producers() {
		// given
		let mut or = FtOrIterator::new(
			vec![
				leaf(&[1, 2, 9], Direction::Forward),
				leaf(&[3, 7], Direction::Forward),
			],
			Direction::Forward,
			false,
		);

		// when
		assert!(or.join(5, Direction::Forward));

		// then
		assert_eq!(or.key(), 7);
		assert_eq!(collect_keys(&mut or), vec![7, 9]);
	}

	#[test]
	fn exhausted_producers_drop_out() {
		// given
		let mut or = FtOrIterator::new(
			vec![
				leaf(&[1], Direction::Forward),
				leaf(&[2, 3], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// then
		assert_eq!(collect_keys(&mut or), vec![1, 2, 3]);
		assert!(or.is_end());
	}

	#[test]
	fn join_count_reports_current_producers() {
		// given
		let or = FtOrIterator::new(
			vec![
				leaf(&[2, 5], Direction::Forward),
				leaf(&[2, 7], Direction::Forward),
				leaf(&[3], Direction::Forward),
			],
			Direction::Forward,
			false,
		);

		// then
		assert_eq!(or.key(), 2);
		assert_eq!(or.join_count(), 2);
		assert!(or.has_duplicate_keys());
	}

	#[test]
	fn stop_current_simple_drops_one_producer() {
		// given
		let mut or = FtOrIterator::new(
			vec![
				leaf(&[1, 5], Direction::Forward),
				leaf(&[2, 6], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// when: the producer currently yielding key 1 is dropped
		assert!(or.stop_current_simple());

		// then
		assert_eq!(collect_keys(&mut or), vec![2, 6]);
	}

	#[test]
	fn clone_preserves_the_merge_position() {
		// given
		let mut or = FtOrIterator::new(
			vec![
				leaf(&[1, 4], Direction::Forward),
				leaf(&[2, 3], Direction::Forward),
			],
			Direction::Forward,
			true,
		);
		or.advance();

		// when
		let mut copy = or.clone_boxed();

		// then
		assert_eq!(collect_keys(copy.as_mut()), collect_keys(&mut or));
	}
}
