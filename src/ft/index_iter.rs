use std::sync::Arc;

use super::{
	serial, Direction, FtIterator, FtIteratorType, FtKey, MutateFn, MutateOutcome,
};

/// An immutable, sorted, snapshot-stable key stream backing the index
/// iterators. Sharing is by reference; clones are cheap.
#[derive(Debug, Clone)]
pub struct PostingList<K: FtKey = u64> {
	keys: Arc<Vec<K>>,
}

impl<K: FtKey> PostingList<K> {
	pub fn new(mut keys: Vec<K>) -> Self {
		keys.sort_unstable();
		Self {
			keys: Arc::new(keys),
		}
	}

	/// Wrap keys that are already sorted ascending.
	pub fn from_sorted(keys: Vec<K>) -> Self {
		debug_assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
		Self {
			keys: Arc::new(keys),
		}
	}

	pub fn len(&self) -> usize {
		self.keys.len()
	}

	pub fn is_empty(&self) -> bool {
		self.keys.is_empty()
	}

	pub fn keys(&self) -> &[K] {
		&self.keys
	}
}

/// Iterator over a [`PostingList`] with ordered-seek `join` support.
pub struct FtIndexIterator<K: FtKey = u64> {
	list: PostingList<K>,
	direction: Direction,
	// current position, `None` once the stream ended
	position: Option<usize>,
	limit: Option<K>,
	// identity of the underlying inverted list (for serialization)
	index_key: u64,
}

impl<K: FtKey> FtIndexIterator<K> {
	pub fn new(list: PostingList<K>, direction: Direction, index_key: u64) -> Self {
		let position = match direction {
			Direction::Forward if !list.is_empty() => Some(0),
			Direction::Backward if !list.is_empty() => Some(list.len() - 1),
			_ => None,
		};
		Self {
			list,
			direction,
			position,
			limit: None,
			index_key,
		}
	}

	pub fn index_key(&self) -> u64 {
		self.index_key
	}

	fn violates_limit(&self, key: &K) -> bool {
		match &self.limit {
			Some(limit) => self.direction.reached(key, limit),
			None => false,
		}
	}

	fn settle(&mut self) {
		if let Some(position) = self.position {
			if self.violates_limit(&self.list.keys()[position]) {
				self.position = None;
			}
		}
	}
}

impl<K: FtKey> FtIterator<K> for FtIndexIterator<K> {
	fn is_end(&self) -> bool {
		self.position.is_none()
	}

	fn key(&self) -> K {
		self.list.keys()[self.position.expect("key() called on an end iterator")]
	}

	fn direction(&self) -> Direction {
		self.direction
	}

	fn advance(&mut self) {
		let Some(position) = self.position else {
			return;
		};
		self.position = match self.direction {
			Direction::Forward => {
				if position + 1 < self.list.len() {
					Some(position + 1)
				} else {
					None
				}
			}
			Direction::Backward => position.checked_sub(1),
		};
		self.settle();
	}

	fn join(&mut self, join_key: K, dir: Direction) -> bool {
		debug_assert_eq!(dir, self.direction);
		if self.position.is_none() {
			return false;
		}
		let keys = self.list.keys();
		self.position = match dir {
			// first key >= join_key
			Direction::Forward => {
				let target = keys.partition_point(|key| *key < join_key);
				(target < keys.len()).then_some(target)
			}
			// last key <= join_key
			Direction::Backward => keys
				.partition_point(|key| *key <= join_key)
				.checked_sub(1),
		};
		self.settle();
		self.position.is_some()
	}

	fn join_bound(&mut self, join_key: K) {
		// a direct iterator has no inner branches to exclude
		self.join(join_key, Direction::Backward);
	}

	fn peek(&self, join_key: K) -> Option<K> {
		let keys = self.list.keys();
		let position = keys.partition_point(|key| *key <= join_key).checked_sub(1)?;
		Some(keys[position])
	}

	fn is_next_key_duplicated(&self) -> bool {
		let Some(position) = self.position else {
			return false;
		};
		let keys = self.list.keys();
		match self.direction {
			Direction::Forward => {
				position + 1 < keys.len() && keys[position + 1] == keys[position]
			}
			Direction::Backward => {
				position > 0 && keys[position - 1] == keys[position]
			}
		}
	}

	fn begin_typed(&self, dir: Direction) -> Box<dyn FtIterator<K>> {
		Box::new(Self::new(self.list.clone(), dir, self.index_key))
	}

	fn clone_boxed(&self) -> Box<dyn FtIterator<K>> {
		// clone preserving position; limits are iterator-local
		Box::new(Self {
			list: self.list.clone(),
			direction: self.direction,
			position: self.position,
			limit: None,
			index_key: self.index_key,
		})
	}

	fn limit_by(&mut self, key: Option<K>) -> bool {
		self.limit = key;
		self.settle();
		self.position.is_some()
	}

	fn scan_query_tree(&self, scan: &mut dyn FnMut(&dyn FtIterator<K>, usize), depth: usize) {
		scan(self, depth);
	}

	fn depth(&self) -> usize {
		1
	}

	fn stop(&mut self) {
		self.position = None;
	}

	fn mutate_inner(&mut self, f: &mut MutateFn<K>) -> MutateOutcome {
		f(self)
	}

	fn is_simple(&self) -> bool {
		true
	}

	fn serial_type(&self) -> FtIteratorType {
		FtIteratorType::Index
	}

	fn serialize(&self, out: &mut Vec<u8>) {
		serial::write_header(out, FtIteratorType::Index, K::TYPE_TAG);
		out.push(self.direction.as_i8() as u8);
		out.extend_from_slice(&self.index_key.to_le_bytes());
	}

	fn signature(&self, out: &mut Vec<u8>) {
		serial::leaf_signature(self.index_key, out);
	}

	fn equal(&self, other: &dyn FtIterator<K>) -> bool {
		other.serial_type() == FtIteratorType::Index && other.leaf_id() == Some(self.index_key)
	}

	fn compare_to(&self, other: &dyn FtIterator<K>) -> f64 {
		if self.equal(other) {
			0.0
		} else {
			1.0
		}
	}

	fn leaf_id(&self) -> Option<u64> {
		Some(self.index_key)
	}

	fn as_dyn(&self) -> &dyn FtIterator<K> {
		self
	}
}
