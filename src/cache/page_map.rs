use std::{
	collections::BTreeMap,
	sync::{Arc, Weak},
};

use parking_lot::RwLock;

/// Result of a range lookup: either every covered page resolves to the same
/// lock at the same state, or an embedded entry conflicts.
pub(crate) enum RangeLookup<L> {
	Miss,
	Hit(Arc<L>, u64),
	Conflict {
		page: u64,
		lock: Arc<L>,
		state: u64,
	},
}

/// Page-wise cache of resource locks keyed by `(page, state)`. A single lock
/// may be registered under multiple pages (wide ranges). Entries hold weak
/// references; expired ones are dropped on the fly.
///
/// Lookup resolves the entry with the greatest `state <= requested` for a
/// page, mirroring the sparse index contract.
pub(crate) struct PageMap<L> {
	cache: RwLock<BTreeMap<(u64, u64), Weak<L>>>,
}

impl<L> PageMap<L> {
	pub fn new() -> Self {
		Self {
			cache: RwLock::new(BTreeMap::new()),
		}
	}

	/// Greatest `(page, s <= state)` entry for a page, dropping expired
	/// references as they are encountered.
	pub fn find(&self, page: u64, state: u64) -> Option<(Arc<L>, u64)> {
		let mut cache = self.cache.write();
		loop {
			let (&(found_page, found_state), weak) =
				cache.range(..=(page, state)).next_back()?;
			if found_page != page {
				return None;
			}
			match weak.upgrade() {
				Some(lock) => return Some((lock, found_state)),
				None => {
					cache.remove(&(found_page, found_state));
				}
			}
		}
	}

	/// Range lookup: all pages in `[first_page, end_page)` must resolve to
	/// the same lock at the same state.
	pub fn find_range(&self, first_page: u64, end_page: u64, state: u64) -> RangeLookup<L> {
		let mut resolved: Option<(Arc<L>, u64)> = None;
		for page in first_page..end_page {
			match self.find(page, state) {
				Some((lock, found_state)) => match &resolved {
					Some((first_lock, first_state)) => {
						if !Arc::ptr_eq(first_lock, &lock) || *first_state != found_state {
							return RangeLookup::Conflict {
								page,
								lock,
								state: found_state,
							};
						}
					}
					None => {
						if page != first_page {
							// a partially covered range counts as a conflict
							return RangeLookup::Conflict {
								page,
								lock,
								state: found_state,
							};
						}
						resolved = Some((lock, found_state));
					}
				},
				None => {
					if resolved.is_some() {
						return RangeLookup::Miss;
					}
				}
			}
		}
		match resolved {
			Some((lock, state)) => RangeLookup::Hit(lock, state),
			None => RangeLookup::Miss,
		}
	}

	/// Register a lock under every page of `[first_page, end_page)`.
	pub fn insert_range(&self, state: u64, lock: &Arc<L>, first_page: u64, end_page: u64) {
		let mut cache = self.cache.write();
		for page in first_page..end_page {
			cache.insert((page, state), Arc::downgrade(lock));
		}
	}

	pub fn insert(&self, state: u64, lock: &Arc<L>, page: u64) {
		self.insert_range(state, lock, page, page + 1);
	}

	/// Whether any page of the range resolves at `state`.
	pub fn range_exists(&self, first_page: u64, end_page: u64, state: u64) -> bool {
		(first_page..end_page).any(|page| self.find(page, state).is_some())
	}

	pub fn erase_range(&self, state: u64, first_page: u64, end_page: u64) {
		let mut cache = self.cache.write();
		for page in first_page..end_page {
			cache.remove(&(page, state));
		}
	}

	pub fn for_each(&self, mut f: impl FnMut(&Arc<L>)) {
		let cache = self.cache.read();
		let mut last: Option<Arc<L>> = None;
		for weak in cache.values() {
			if let Some(lock) = weak.upgrade() {
				// a wide lock registered under many pages is visited once
				if let Some(prev) = &last {
					if Arc::ptr_eq(prev, &lock) {
						continue;
					}
				}
				f(&lock);
				last = Some(lock);
			}
		}
	}

	pub fn clear(&self) {
		self.cache.write().clear();
	}

	pub fn is_empty(&self) -> bool {
		let cache = self.cache.read();
		cache.values().all(|weak| weak.upgrade().is_none())
	}

	/// Drop expired entries, returning how many were removed.
	pub fn clear_expired(&self) -> usize {
		let mut cache = self.cache.write();
		let before = cache.len();
		cache.retain(|_, weak| weak.upgrade().is_some());
		before - cache.len()
	}
}
