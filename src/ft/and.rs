use std::collections::VecDeque;

use super::{
	children_equal_unordered, compare_children, serial, Direction, FtIterator, FtIteratorType,
	FtKey, MutateFn, MutateOutcome,
};

/// AND-joining iterator: yields the keys produced by every inner iterator.
/// The inner list keeps the smallest-key leader at the front; `join_all`
/// rotates a new leader to the front whenever an inner iterator overshoots
/// the current join key.
///
/// With `unique_keys`, duplicate keys on the leader are skipped.
pub struct FtAndIterator<K: FtKey = u64> {
	direction: Direction,
	unique_keys: bool,
	joinable: VecDeque<Box<dyn FtIterator<K>>>,
	end: bool,
	join_key: K,
}

impl<K: FtKey> FtAndIterator<K> {
	pub fn new(
		inner: Vec<Box<dyn FtIterator<K>>>,
		direction: Direction,
		unique_keys: bool,
	) -> Self {
		assert!(!inner.is_empty(), "AND requires at least one inner iterator");
		let mut result = Self {
			direction,
			unique_keys,
			joinable: inner.into(),
			end: false,
			join_key: K::default(),
		};
		if result.joinable.iter().any(|it| it.is_end()) {
			result.set_end();
		} else {
			result.join_all();
		}
		result
	}

	/// Join a pair of iterators.
	pub fn join_pair(
		first: Box<dyn FtIterator<K>>,
		second: Box<dyn FtIterator<K>>,
		direction: Direction,
		unique_keys: bool,
	) -> Self {
		Self::new(vec![first, second], direction, unique_keys)
	}

	/// The inner iterator yielding the current key.
	pub fn simple(&self) -> &dyn FtIterator<K> {
		self.joinable
			.front()
			.expect("AND iterators are never empty")
			.as_ref()
	}

	fn set_end(&mut self) {
		self.end = true;
	}

	/// Re-establish agreement of all inner iterators on one key. When an
	/// inner iterator overshoots, it becomes the new leader and the scan
	/// restarts right after it.
	fn join_all(&mut self) {
		if self.joinable[0].is_end() {
			self.set_end();
			return;
		}
		let mut key = self.joinable[0].key();
		let mut index = 1;
		while index < self.joinable.len() {
			if self.joinable[index].is_end() {
				self.set_end();
				return;
			}
			if !self.joinable[index].join(key, self.direction) {
				self.set_end();
				return;
			}
			let reached = self.joinable[index].key();
			if reached != key {
				// new leader; restart the pass over the older entries
				key = reached;
				let leader = self.joinable.remove(index).unwrap();
				self.joinable.push_front(leader);
				index = 1;
				continue;
			}
			index += 1;
		}
		self.join_key = key;
	}

	fn advance_leader(&mut self) {
		if self.unique_keys {
			// skip duplicate keys on the leader
			loop {
				let leader = self.joinable.front_mut().unwrap();
				leader.advance();
				if leader.is_end() {
					self.set_end();
					return;
				}
				if leader.key() != self.join_key {
					break;
				}
			}
			self.join_all();
		} else {
			let diverged = {
				let leader = self.joinable.front_mut().unwrap();
				leader.advance();
				leader.is_end() || leader.key() != self.join_key
			};
			if diverged {
				// rotate the exhausted leader to the back
				let old = self.joinable.pop_front().unwrap();
				self.joinable.push_back(old);
				let front = self.joinable.front().unwrap();
				if front.is_end() {
					self.set_end();
					return;
				}
				if front.key() != self.join_key {
					self.join_all();
				}
				// otherwise another producer still yields the same key
			}
		}
	}
}

impl<K: FtKey> FtIterator<K> for FtAndIterator<K> {
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
		self.advance_leader();
	}

	fn join(&mut self, join_key: K, dir: Direction) -> bool {
		debug_assert_eq!(dir, self.direction);
		if self.end {
			return false;
		}
		if self.joinable.front_mut().unwrap().join(join_key, dir) {
			self.join_all();
			!self.end
		} else {
			self.set_end();
			false
		}
	}

	fn join_bound(&mut self, join_key: K) {
		let mut key = join_key;
		for it in self.joinable.iter_mut() {
			debug_assert!(!it.is_end());
			it.join_bound(key);
			self.join_key = it.key();
			if self.join_key != key {
				break;
			}
			key = self.join_key;
		}
	}

	fn peek(&self, join_key: K) -> Option<K> {
		let mut lead_key = join_key;
		for it in &self.joinable {
			let peeked = it.peek(lead_key)?;
			debug_assert!(peeked <= lead_key);
			if peeked < lead_key {
				lead_key = peeked;
			}
		}
		Some(lead_key)
	}

	fn is_next_key_duplicated(&self) -> bool {
		!self.unique_keys && self.simple().is_next_key_duplicated()
	}

	fn begin_typed(&self, dir: Direction) -> Box<dyn FtIterator<K>> {
		let inner = self
			.joinable
			.iter()
			.map(|it| it.begin_typed(dir))
			.collect();
		Box::new(Self::new(inner, dir, self.unique_keys))
	}

	fn clone_boxed(&self) -> Box<dyn FtIterator<K>> {
		Box::new(Self {
			direction: self.direction,
			unique_keys: self.unique_keys,
			joinable: self.joinable.iter().map(|it| it.clone_boxed()).collect(),
			end: self.end,
			join_key: self.join_key,
		})
	}

	fn limit_by(&mut self, key: Option<K>) -> bool {
		for it in self.joinable.iter_mut() {
			if !it.limit_by(key) {
				self.set_end();
				return false;
			}
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
			// an invalidated inner iterator invalidates the whole tree
			if !inner_valid {
				was_end = true;
				break;
			}
		}
		if was_end {
			self.set_end();
		} else {
			self.join_all();
		}
		(was_mutated, !was_end)
	}

	fn serial_type(&self) -> FtIteratorType {
		FtIteratorType::JoinAnd
	}

	fn serialize(&self, out: &mut Vec<u8>) {
		serial::write_header(out, FtIteratorType::JoinAnd, K::TYPE_TAG);
		out.push(self.unique_keys as u8);
		out.push(self.direction.as_i8() as u8);
		out.extend_from_slice(&(self.joinable.len() as u32).to_le_bytes());
		for it in &self.joinable {
			it.serialize(out);
		}
	}

	fn signature(&self, out: &mut Vec<u8>) {
		serial::combine_signatures(b"AND", &self.children(), out);
	}

	fn equal(&self, other: &dyn FtIterator<K>) -> bool {
		if other.serial_type() != FtIteratorType::JoinAnd {
			return false;
		}
		children_equal_unordered(&self.children(), &other.children())
	}

	fn compare_to(&self, other: &dyn FtIterator<K>) -> f64 {
		if other.serial_type() == FtIteratorType::JoinAnd {
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
	fn and_yields_the_intersection() {
		// given: A = [1,2,3,5,8], B = [2,3,4,5,7]
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 2, 3, 5, 8], Direction::Forward),
				leaf(&[2, 3, 4, 5, 7], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![2, 3, 5]);
	}

	#[test]
	fn and_works_backwards() {
		// given
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 2, 3, 5, 8], Direction::Backward),
				leaf(&[2, 3, 4, 5, 7], Direction::Backward),
			],
			Direction::Backward,
			true,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![5, 3, 2]);
	}

	#[test]
	fn three_way_and_restarts_on_new_leaders() {
		// given: inputs that force repeated leader rotation
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 10, 20, 30], Direction::Forward),
				leaf(&[5, 10, 25, 30], Direction::Forward),
				leaf(&[9, 10, 30, 40], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// then
		assert_eq!(collect_keys(&mut it), vec![10, 30]);
	}

	#[test]
	fn empty_inner_iterator_ends_the_join() {
		// given
		let it = FtAndIterator::new(
			vec![
				leaf(&[1, 2], Direction::Forward),
				leaf(&[], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// then
		assert!(it.is_end());
	}

	#[test]
	fn join_is_idempotent_once_positioned() {
		// given
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 3, 5, 7], Direction::Forward),
				leaf(&[3, 5, 7], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// when
		assert!(it.join(4, Direction::Forward));
		let first = it.key();
		assert!(it.join(4, Direction::Forward));

		// then
		assert_eq!(first, 5);
		assert_eq!(it.key(), first);
	}

	#[test]
	fn clone_yields_the_same_key_sequence() {
		// given
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 2, 3, 5], Direction::Forward),
				leaf(&[2, 3, 5], Direction::Forward),
			],
			Direction::Forward,
			true,
		);
		it.advance();

		// when
		let mut copy = it.clone_boxed();

		// then
		assert_eq!(collect_keys(copy.as_mut()), collect_keys(&mut it));
	}

	#[test]
	fn mutate_inner_replaces_a_leaf_and_rejoins() {
		// given: AND over lists 6 and 15
		let mut it = FtAndIterator::new(
			vec![
				leaf(&[1, 2, 3], Direction::Forward),
				leaf(&[3, 4, 8], Direction::Forward),
			],
			Direction::Forward,
			true,
		);

		// when: the leaf with index key 6 is stopped
		let (mutated, valid) = it.mutate_inner(&mut |inner| {
			if inner.leaf_id() == Some(6) {
				inner.stop();
				(true, false)
			} else {
				(false, true)
			}
		});

		// then: stopping an inner iterator invalidates the tree
		assert!(mutated);
		assert!(!valid);
		assert!(it.is_end());
	}

	#[test]
	fn depth_counts_nesting() {
		// given
		let inner = FtAndIterator::new(
			vec![
				leaf(&[1], Direction::Forward),
				leaf(&[1], Direction::Forward),
			],
			Direction::Forward,
			true,
		);
		let outer = FtAndIterator::new(
			vec![Box::new(inner), leaf(&[1], Direction::Forward)],
			Direction::Forward,
			true,
		);

		// then
		assert_eq!(outer.depth(), 3);
	}
}
