use std::{
	collections::{BTreeMap, BTreeSet, HashMap},
	fmt::Debug,
	sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use static_assertions::assert_impl_all;

use crate::ft::{Direction, FtIndexIterator, FtIterator, PostingList};

/// Above this size an inline posting list morphs into a tree representation
/// better suited for random insert/erase.
const MORPH_THRESHOLD: usize = 64;

/// Tag key of an inverted index.
pub trait TagKey: Copy + Ord + Eq + std::hash::Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Ord + Eq + std::hash::Hash + Debug + Send + Sync + 'static> TagKey for T {}

/// A morphing posting store: small lists stay as sorted vectors, large ones
/// move to a tree. Morphing relocates the data, which invalidates cached
/// snapshots of the list.
enum PostingStore {
	Inline(Vec<u64>),
	Tree(BTreeSet<u64>),
}

impl PostingStore {
	fn new() -> Self {
		Self::Inline(Vec::new())
	}

	fn len(&self) -> usize {
		match self {
			Self::Inline(keys) => keys.len(),
			Self::Tree(keys) => keys.len(),
		}
	}

	fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Insert `value` unless present. Returns (inserted, relocated).
	fn insert_unique(&mut self, value: u64) -> (bool, bool) {
		match self {
			Self::Inline(keys) => {
				let position = keys.partition_point(|key| *key < value);
				if keys.get(position) == Some(&value) {
					return (false, false);
				}
				keys.insert(position, value);
				if keys.len() > MORPH_THRESHOLD {
					// morph into the tree representation
					*self = Self::Tree(keys.iter().copied().collect());
					return (true, true);
				}
				(true, false)
			}
			Self::Tree(keys) => (keys.insert(value), false),
		}
	}

	fn erase(&mut self, value: u64) -> bool {
		match self {
			Self::Inline(keys) => {
				let position = keys.partition_point(|key| *key < value);
				if keys.get(position) == Some(&value) {
					keys.remove(position);
					return true;
				}
				false
			}
			Self::Tree(keys) => keys.remove(&value),
		}
	}

	fn snapshot(&self) -> PostingList<u64> {
		match self {
			Self::Inline(keys) => PostingList::from_sorted(keys.clone()),
			Self::Tree(keys) => PostingList::from_sorted(keys.iter().copied().collect()),
		}
	}
}

/// Statistics returned by a batch flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
	/// Posting lists touched by the batch.
	pub total_lists: usize,
	/// Lists created by the batch.
	pub new_lists: usize,
	/// Lists removed because they became empty.
	pub removed_lists: usize,
}

/// A tag → posting list mapping with lazily materialized, cached list
/// snapshots. Readers take the lock shared; writers upgrade. Bulk mutation
/// goes through the per-index [`BatchOperation`].
pub struct InvertedIndex<K: TagKey = u64> {
	lists: RwLock<BTreeMap<K, PostingStore>>,
	// snapshot cache, invalidated when a list mutates or relocates
	cache: Mutex<HashMap<K, PostingList<u64>>>,
	// at most one batch operation exists per index
	batch: Mutex<Weak<BatchOperation<K>>>,
}

assert_impl_all!(InvertedIndex: Send, Sync);

impl<K: TagKey> Default for InvertedIndex<K> {
	fn default() -> Self {
		Self::new()
	}
}

impl<K: TagKey> InvertedIndex<K> {
	pub fn new() -> Self {
		Self {
			lists: RwLock::new(BTreeMap::new()),
			cache: Mutex::new(HashMap::new()),
			batch: Mutex::new(Weak::new()),
		}
	}

	pub fn len(&self) -> usize {
		self.lists.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lists.read().is_empty()
	}

	/// Snapshot of a tag's posting list, pulled through the cache.
	pub fn existing_list(&self, tag: K) -> Option<PostingList<u64>> {
		if let Some(list) = self.cache.lock().get(&tag) {
			return Some(list.clone());
		}
		let lists = self.lists.read();
		let store = lists.get(&tag)?;
		let snapshot = store.snapshot();
		drop(lists);
		self.cache.lock().insert(tag, snapshot.clone());
		Some(snapshot)
	}

	/// A full-text iterator over a tag's posting list, or `None` for an
	/// unknown tag. `index_key` identifies the list for serialization.
	pub fn iterate(
		&self,
		tag: K,
		index_key: u64,
		direction: Direction,
	) -> Option<Box<dyn FtIterator<u64>>> {
		let list = self.existing_list(tag)?;
		Some(Box::new(FtIndexIterator::new(list, direction, index_key)))
	}

	fn invalidate_cache(&self, tag: K) {
		self.cache.lock().remove(&tag);
	}

	/// The index's batch operation, creating it on first use. All writers
	/// share a single instance until every handle is dropped.
	pub fn batch(self: &Arc<Self>) -> Arc<BatchOperation<K>> {
		let mut slot = self.batch.lock();
		if let Some(existing) = slot.upgrade() {
			return existing;
		}
		let created = Arc::new(BatchOperation {
			index: Arc::clone(self),
			pending: Mutex::new(PendingOps::default()),
		});
		*slot = Arc::downgrade(&created);
		created
	}

	/// Direct single-pair insert (tests and small updates); bulk writers use
	/// the batch operation.
	pub fn insert(&self, tag: K, value: u64) -> bool {
		let lists = self.lists.upgradable_read();
		let mut lists = RwLockUpgradableReadGuard::upgrade(lists);
		let store = lists.entry(tag).or_insert_with(PostingStore::new);
		let (inserted, _) = store.insert_unique(value);
		drop(lists);
		if inserted {
			self.invalidate_cache(tag);
		}
		inserted
	}
}

struct PendingOps<K> {
	adds: Vec<(K, u64)>,
	removes: Vec<(K, u64)>,
}

impl<K> Default for PendingOps<K> {
	fn default() -> Self {
		Self {
			adds: Vec::new(),
			removes: Vec::new(),
		}
	}
}

/// Accumulates `(tag, value)` additions and removals and applies them in one
/// exclusive pass over the index. Multiple writer threads share one batch;
/// `flush` is exclusive.
pub struct BatchOperation<K: TagKey = u64> {
	index: Arc<InvertedIndex<K>>,
	pending: Mutex<PendingOps<K>>,
}

impl<K: TagKey> BatchOperation<K> {
	pub fn add(&self, tag: K, value: u64) {
		self.pending.lock().adds.push((tag, value));
	}

	pub fn remove(&self, tag: K, value: u64) {
		self.pending.lock().removes.push((tag, value));
	}

	pub fn pending_len(&self) -> usize {
		let pending = self.pending.lock();
		pending.adds.len() + pending.removes.len()
	}

	/// Apply all accumulated operations under the index's exclusive lock.
	/// `on_insert` / `on_erase` observe every value actually written.
	pub fn flush(
		&self,
		mut on_insert: impl FnMut(K, u64),
		mut on_erase: impl FnMut(K, u64),
	) -> BatchStats {
		let (mut adds, mut removes) = {
			let mut pending = self.pending.lock();
			(
				std::mem::take(&mut pending.adds),
				std::mem::take(&mut pending.removes),
			)
		};
		adds.sort_unstable();
		adds.dedup();
		removes.sort_unstable();
		removes.dedup();
		if adds.is_empty() && removes.is_empty() {
			return BatchStats::default();
		}

		let mut stats = BatchStats::default();
		let mut touched: BTreeSet<K> = BTreeSet::new();

		let lists = self.index.lists.upgradable_read();
		let mut lists = RwLockUpgradableReadGuard::upgrade(lists);

		// the inputs are sorted by tag; every tag's run costs one lookup
		let mut adds_slice = adds.as_slice();
		while let Some((tag, _)) = adds_slice.first() {
			let tag = *tag;
			let run_len = adds_slice
				.iter()
				.take_while(|(run_tag, _)| *run_tag == tag)
				.count();
			let (run, rest) = adds_slice.split_at(run_len);
			adds_slice = rest;

			let is_new = !lists.contains_key(&tag);
			let store = lists.entry(tag).or_insert_with(PostingStore::new);
			let mut mutated = is_new;
			for (_, value) in run {
				let (inserted, relocated) = store.insert_unique(*value);
				if inserted {
					on_insert(tag, *value);
					mutated = true;
				}
				mutated |= relocated;
			}
			if is_new {
				stats.new_lists += 1;
			}
			if mutated {
				touched.insert(tag);
			}
		}

		let mut removes_slice = removes.as_slice();
		while let Some((tag, _)) = removes_slice.first() {
			let tag = *tag;
			let run_len = removes_slice
				.iter()
				.take_while(|(run_tag, _)| *run_tag == tag)
				.count();
			let (run, rest) = removes_slice.split_at(run_len);
			removes_slice = rest;

			let Some(store) = lists.get_mut(&tag) else {
				continue;
			};
			let mut mutated = false;
			for (_, value) in run {
				if store.erase(*value) {
					on_erase(tag, *value);
					mutated = true;
				}
			}
			if store.is_empty() {
				// empty lists drop their tag entry entirely
				lists.remove(&tag);
				stats.removed_lists += 1;
				mutated = true;
			}
			if mutated {
				touched.insert(tag);
			}
		}

		drop(lists);
		stats.total_lists = touched.len();
		for tag in touched {
			self.index.invalidate_cache(tag);
		}
		stats
	}
}
