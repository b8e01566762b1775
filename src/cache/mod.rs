use std::{fs::File, sync::Arc};

use log::warn;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	files::FileBacking,
	storage::{AccessMode, Storage, StorageError},
	utils::page_shift,
};

pub(crate) mod lock;
pub(crate) mod page_map;
pub(crate) mod recycler;

pub use lock::{BoundaryLock, DpLock, ResourceLock};
pub use recycler::{CacheRecycler, Priority};

use page_map::{PageMap, RangeLookup};

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("Dist memory overflow: too many dirty locks to release cache space")]
	DistMemoryOverflow,

	#[error("Internal invariant violated: {0}")]
	Internal(String),

	#[error(transparent)]
	Storage(#[from] StorageError),
}

/// Is `[first_page, end_page)` with a non-zero page offset a boundary range
/// (an unaligned span of exactly two adjacent pages)?
pub(crate) fn is_boundary_range(first_page: u64, end_page: u64, addr_offset: u64) -> bool {
	end_page == first_page + 2 && addr_offset != 0
}

enum VolatileLock<F: FileBacking> {
	Dp(Arc<DpLock<F>>),
	Boundary(Arc<BoundaryLock<F>>),
}

/// Per-prefix cache mapping `(page, state)` to resource locks, split into
/// page-sized, wide-range and boundary-range maps. Enforces one writer per
/// `(range, state)` while older states stay readable for snapshots, and
/// performs copy-on-write promotion when a writer requests a range cached at
/// an older state.
pub struct PrefixCache<F: FileBacking = File> {
	storage: Arc<Storage<F>>,
	page_size: usize,
	shift: u32,
	recycler: Arc<CacheRecycler>,
	dp_map: PageMap<DpLock<F>>,
	wide_map: PageMap<DpLock<F>>,
	boundary_map: PageMap<BoundaryLock<F>>,
	// sentinel marking ranges invalidated by refresh
	missing_dp: Arc<DpLock<F>>,
	missing_wide: Arc<DpLock<F>>,
	// locks created under an atomic operation (no_flush)
	volatile: Mutex<Vec<VolatileLock<F>>>,
}

assert_impl_all!(PrefixCache: Send, Sync);

impl<F: FileBacking> PrefixCache<F> {
	pub fn new(storage: Arc<Storage<F>>, recycler: Arc<CacheRecycler>) -> Self {
		let page_size = storage.page_size();
		let sentinel_access = AccessMode::default().with_no_cache();
		let missing_dp = Arc::new(
			DpLock::new(Arc::clone(&storage), 0, 0, sentinel_access, 0, 0)
				.expect("sentinel locks perform no IO"),
		);
		let missing_wide = Arc::new(
			DpLock::new(Arc::clone(&storage), 0, 0, sentinel_access, 0, 0)
				.expect("sentinel locks perform no IO"),
		);
		Self {
			storage,
			page_size,
			shift: page_shift(page_size),
			recycler,
			dp_map: PageMap::new(),
			wide_map: PageMap::new(),
			boundary_map: PageMap::new(),
			missing_dp,
			missing_wide,
			volatile: Mutex::new(Vec::new()),
		}
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn recycler(&self) -> &Arc<CacheRecycler> {
		&self.recycler
	}

	fn touch(&self, lock: &Arc<DpLock<F>>, priority: Priority) -> Result<(), CacheError> {
		let shared: Arc<dyn ResourceLock> = lock.clone();
		self.recycler.update(&shared, priority)
	}

	fn register_volatile(&self, lock: VolatileLock<F>) {
		self.volatile.lock().push(lock);
	}

	/// Find or create the lock for a single page. Writers pass the current
	/// head (or atomic) state in `state`; readers their snapshot state.
	pub fn map_page(
		&self,
		page: u64,
		state: u64,
		access: AccessMode,
		priority: Priority,
	) -> Result<Arc<DpLock<F>>, CacheError> {
		// an older-state hit may be stale: the storage is authoritative for
		// the closest mutation below the requested state
		let hit = match self.find_page(page, state) {
			Some((lock, found_state)) if found_state != state => {
				let mutation = self.storage.try_find_mutation(page, state)?;
				if mutation.is_some_and(|found| found > found_state) {
					None
				} else {
					Some((lock, found_state))
				}
			}
			other => other,
		};
		if let Some((lock, found_state)) = hit {
			if !access.write || (found_state == state && lock.is_writable()) {
				self.touch(&lock, priority)?;
				return Ok(lock);
			}
			// a writer over an older-state lock: copy-on-write promotion,
			// the old lock stays for concurrent snapshot readers
			let promoted = Arc::new(DpLock::new_copy(&lock, state, access, None));
			self.dp_map.insert(state, &promoted, page);
			if access.no_flush {
				self.register_volatile(VolatileLock::Dp(Arc::clone(&promoted)));
			}
			self.touch(&promoted, priority)?;
			return Ok(promoted);
		}

		// cache miss: resolve the backing state in storage
		let resolved = self.storage.try_find_mutation(page, state)?;
		let lock = match resolved {
			Some(read_state) => {
				let lock = DpLock::new(
					Arc::clone(&self.storage),
					page << self.shift,
					self.page_size,
					access,
					read_state,
					state,
				)?;
				let insert_state = if access.write { state } else { read_state };
				let lock = Arc::new(lock);
				self.dp_map.insert(insert_state, &lock, page);
				lock
			}
			None => {
				if access.read && !access.create {
					return Err(CacheError::Storage(StorageError::PageNotFound {
						page,
						state,
					}));
				}
				// a page never written yet: materialize it zeroed
				let mut create_access = access;
				create_access.read = false;
				create_access.create = true;
				let lock = Arc::new(DpLock::new(
					Arc::clone(&self.storage),
					page << self.shift,
					self.page_size,
					create_access,
					0,
					state,
				)?);
				self.dp_map.insert(state, &lock, page);
				lock
			}
		};
		if access.no_flush {
			self.register_volatile(VolatileLock::Dp(Arc::clone(&lock)));
		}
		self.touch(&lock, priority)?;
		Ok(lock)
	}

	/// Cache-only single page lookup; missing-range sentinels read as absent.
	pub fn find_page(&self, page: u64, state: u64) -> Option<(Arc<DpLock<F>>, u64)> {
		let (lock, found_state) = self.dp_map.find(page, state)?;
		if Arc::ptr_eq(&lock, &self.missing_dp) {
			return None;
		}
		Some((lock, found_state))
	}

	/// Find or create a wide lock over `[address, address + size)` where
	/// `address` is page-aligned and `size > page_size`. An unaligned tail is
	/// backed by a residual page lock sharing bytes with the wide buffer.
	pub fn map_range(
		&self,
		address: u64,
		size: usize,
		state: u64,
		access: AccessMode,
	) -> Result<Arc<DpLock<F>>, CacheError> {
		debug_assert_eq!(address & (self.page_size as u64 - 1), 0);
		debug_assert!(size > self.page_size);
		let first_page = address >> self.shift;
		let full_pages = (size / self.page_size) as u64;
		let end_page = first_page + (size as u64).div_ceil(self.page_size as u64);
		let has_residual = size % self.page_size != 0;

		match self.wide_map.find_range(first_page, end_page, state) {
			RangeLookup::Hit(lock, found_state) => {
				let stale = found_state != state && {
					let mut newest = 0;
					for page in first_page..end_page {
						if let Some(found) = self.storage.try_find_mutation(page, state)? {
							newest = newest.max(found);
						}
					}
					newest > found_state
				};
				if stale || Arc::ptr_eq(&lock, &self.missing_wide) {
					// superseded in storage or invalidated by refresh; fall
					// through to recreation
				} else if !access.write || (found_state == state && lock.is_writable()) {
					self.touch(&lock, Priority::Low)?;
					return Ok(lock);
				} else {
					// promote, re-resolving the residual at the new state
					let residual = match lock.residual() {
						Some(_) => Some(self.map_page(
							first_page + full_pages,
							state,
							residual_access(access),
							Priority::High,
						)?),
						None => None,
					};
					let promoted =
						Arc::new(DpLock::new_copy(&lock, state, access, residual));
					self.wide_map
						.insert_range(state, &promoted, first_page, end_page);
					if access.no_flush {
						self.register_volatile(VolatileLock::Dp(Arc::clone(&promoted)));
					}
					self.touch(&promoted, Priority::Low)?;
					return Ok(promoted);
				}
			}
			RangeLookup::Miss | RangeLookup::Conflict { .. } => (),
		}

		// resolve the read state across the covered pages
		let mut read_state = 0_u64;
		let mut any_missing = false;
		for page in first_page..end_page {
			match self.storage.try_find_mutation(page, state)? {
				Some(found) => read_state = read_state.max(found),
				None => any_missing = true,
			}
		}
		let mut fetch_access = access;
		if any_missing {
			if access.read && !access.create {
				return Err(CacheError::Storage(StorageError::PageNotFound {
					page: first_page,
					state,
				}));
			}
			if read_state == 0 {
				fetch_access.read = false;
			}
			// missing pages within the range read as zeroes
			fetch_access.create = true;
		}

		let residual = if has_residual {
			Some(self.map_page(
				first_page + full_pages,
				state,
				residual_access(access),
				Priority::High,
			)?)
		} else {
			None
		};

		let lock = Arc::new(DpLock::new_wide(
			Arc::clone(&self.storage),
			address,
			size,
			fetch_access,
			if read_state > 0 { read_state } else { state },
			state,
			residual,
		)?);

		// conflict resolution: absorb embedded page-sized locks from other
		// states into the freshly built wide lock
		let mut conversions = 0;
		for page in first_page..first_page + full_pages {
			if let Some((embedded, embedded_state)) = self.find_page(page, state) {
				if conversions > 0 {
					return Err(CacheError::Internal(format!(
						"multiple conflicting page locks inside wide range at page {page}"
					)));
				}
				conversions += 1;
				let offset = ((page - first_page) << self.shift) as usize;
				embedded.with_buf(|src| {
					lock.with_buf_mut(|dst| {
						dst[offset..offset + self.page_size].copy_from_slice(src)
					})
				});
				if embedded.reset_dirty() {
					lock.set_dirty();
				}
				self.dp_map.erase_range(embedded_state, page, page + 1);
				let shared: Arc<dyn ResourceLock> = embedded.clone();
				self.recycler.release(&shared);
				if Arc::strong_count(&embedded) > 2 {
					warn!(
						"absorbed an actively referenced page lock at page {page}; \
						 holders keep a snapshot view"
					);
				}
			}
		}

		let insert_state = if access.write { state } else { read_state.max(1) };
		self.wide_map
			.insert_range(insert_state, &lock, first_page, end_page);
		if access.no_flush {
			self.register_volatile(VolatileLock::Dp(Arc::clone(&lock)));
		}
		self.touch(&lock, Priority::Low)?;
		Ok(lock)
	}

	/// Find or create a boundary lock for an unaligned range spanning two
	/// adjacent pages. The lock's buffer holds only the user's bytes; its
	/// parents carry them to storage.
	pub fn map_boundary(
		&self,
		address: u64,
		size: usize,
		state: u64,
		access: AccessMode,
	) -> Result<Arc<BoundaryLock<F>>, CacheError> {
		let first_page = address >> self.shift;
		debug_assert!(is_boundary_range(
			first_page,
			((address + size as u64 - 1) >> self.shift) + 1,
			address & (self.page_size as u64 - 1),
		));

		if let Some((found, found_state)) = self.boundary_map.find(first_page, state) {
			if found.address() == address && found.size() == size {
				if !access.write || found_state == state {
					return Ok(found);
				}
				// carry unflushed bytes into the parents before promoting
				found.flush_to_parents();
			} else {
				// a different allocation shares the first page; evict the
				// stale entry and materialize the requested one
				self.boundary_map
					.erase_range(found_state, first_page, first_page + 1);
			}
		}

		// parents must preserve the bytes around the user range
		let mut parent_access = access;
		parent_access.read = true;
		parent_access.create = true;
		let lhs = self.map_page(first_page, state, parent_access, Priority::High)?;
		let rhs = self.map_page(first_page + 1, state, parent_access, Priority::High)?;
		let boundary = Arc::new(BoundaryLock::new(
			address,
			size,
			access,
			state,
			lhs,
			rhs,
		));
		self.boundary_map.insert(state, &boundary, first_page);
		if access.no_flush {
			self.register_volatile(VolatileLock::Boundary(Arc::clone(&boundary)));
		}
		Ok(boundary)
	}

	/// Mark a page as no longer current (a writer republished it at
	/// `state`). Only ranges already cached are marked; later lookups
	/// refetch through the storage.
	pub fn mark_missing(&self, page: u64, state: u64) {
		if self.dp_map.range_exists(page, page + 1, state) {
			self.dp_map.insert(state, &self.missing_dp, page);
		}
		if self.wide_map.range_exists(page, page + 1, state) {
			self.wide_map.insert(state, &self.missing_wide, page);
		}
	}

	/// Flush all managed locks; boundary locks write back into their parents
	/// first so the parents carry consistent bytes.
	pub fn flush(&self) -> Result<(), CacheError> {
		self.flush_boundary();
		let mut failure: Option<StorageError> = None;
		let mut flush_lock = |lock: &Arc<DpLock<F>>| {
			if failure.is_none() {
				if let Err(error) = lock.flush() {
					failure = Some(error);
				}
			}
		};
		self.wide_map.for_each(&mut flush_lock);
		self.dp_map.for_each(&mut flush_lock);
		match failure {
			Some(error) => Err(error.into()),
			None => Ok(()),
		}
	}

	/// Write boundary bytes back into their parents (non-IO).
	pub fn flush_boundary(&self) {
		self.boundary_map.for_each(|lock| lock.flush_to_parents());
	}

	/// Flush up to `limit` dirty bytes (recycler starvation hook). Returns
	/// the number of bytes actually flushed.
	pub fn flush_dirty(&self, limit: usize) -> usize {
		let mut released = 0_usize;
		let mut flush_lock = |lock: &Arc<DpLock<F>>| {
			if released < limit && lock.is_dirty() && !lock.is_no_flush() {
				match lock.flush() {
					Ok(()) => released += lock.size(),
					Err(error) => warn!("dirty flush failed: {error}"),
				}
			}
		};
		self.wide_map.for_each(&mut flush_lock);
		self.dp_map.for_each(&mut flush_lock);
		released
	}

	/// Total dirty bytes held by this cache.
	pub fn dirty_size(&self) -> usize {
		let mut size = 0_usize;
		let mut count = |lock: &Arc<DpLock<F>>| {
			if lock.is_dirty() {
				size += lock.size();
			}
		};
		self.wide_map.for_each(&mut count);
		self.dp_map.for_each(&mut count);
		size
	}

	pub fn size_of_resources(&self) -> usize {
		let mut size = 0_usize;
		self.dp_map.for_each(|lock| size += lock.size());
		self.wide_map.for_each(|lock| size += lock.size());
		size
	}

	/// Discard every volatile lock created under `state` (atomic rollback).
	pub fn rollback(&self, state: u64) {
		let mut volatile = self.volatile.lock();
		for entry in volatile.drain(..) {
			match entry {
				VolatileLock::Dp(lock) => {
					lock.reset_dirty();
					let (first, end) = self.pages_of(&lock);
					self.dp_map.erase_range(state, first, end);
					self.wide_map.erase_range(state, first, end);
					let shared: Arc<dyn ResourceLock> = lock;
					self.recycler.release(&shared);
				}
				VolatileLock::Boundary(lock) => {
					lock.reset_dirty();
					let first = lock.address() >> self.shift;
					self.boundary_map.erase_range(state, first, first + 1);
				}
			}
		}
	}

	/// Merge volatile locks into the enclosing transaction: re-key from the
	/// atomic temporary state to `to_state` and clear the no-flush flag.
	pub fn merge(&self, from_state: u64, to_state: u64) {
		let mut volatile = self.volatile.lock();
		for entry in volatile.drain(..) {
			match entry {
				VolatileLock::Dp(lock) => {
					let (first, end) = self.pages_of(&lock);
					self.dp_map.erase_range(from_state, first, end);
					self.wide_map.erase_range(from_state, first, end);
					lock.update_state(to_state, false);
					// merge into an existing lock of the transaction, or
					// re-insert under the transactional state
					match self.find_page(first, to_state) {
						Some((existing, existing_state))
							if existing_state == to_state
								&& existing.size() == lock.size()
								&& !Arc::ptr_eq(&existing, &lock) =>
						{
							existing.copy_from(&lock);
						}
						_ => {
							if end - first > 1 {
								self.wide_map.insert_range(to_state, &lock, first, end);
							} else {
								self.dp_map.insert(to_state, &lock, first);
							}
						}
					}
				}
				VolatileLock::Boundary(lock) => {
					let first = lock.address() >> self.shift;
					self.boundary_map.erase_range(from_state, first, first + 1);
					lock.update_state(to_state, false);
					self.boundary_map.insert(to_state, &lock, first);
				}
			}
		}
	}

	fn pages_of(&self, lock: &Arc<DpLock<F>>) -> (u64, u64) {
		let first = lock.address() >> self.shift;
		let end = ((lock.address() + lock.size() as u64 - 1) >> self.shift) + 1;
		(first, end)
	}

	/// Undo pending writes and drop all cached locks.
	pub fn clear(&self) {
		self.volatile.lock().clear();
		self.boundary_map.for_each(|lock| {
			lock.reset_dirty();
		});
		let mut scrub = |lock: &Arc<DpLock<F>>| {
			lock.reset_dirty();
			let shared: Arc<dyn ResourceLock> = lock.clone();
			self.recycler.release(&shared);
		};
		self.dp_map.for_each(&mut scrub);
		self.wide_map.for_each(&mut scrub);
		self.boundary_map.clear();
		self.dp_map.clear();
		self.wide_map.clear();
	}

	pub fn is_empty(&self) -> bool {
		self.dp_map.is_empty() && self.wide_map.is_empty() && self.boundary_map.is_empty()
	}

	pub fn clear_expired(&self) -> usize {
		self.dp_map.clear_expired() + self.wide_map.clear_expired() + self.boundary_map.clear_expired()
	}
}

fn residual_access(access: AccessMode) -> AccessMode {
	let mut residual = access;
	// the residual parent must preserve bytes beyond the wide tail
	residual.read = true;
	residual.create = true;
	residual
}
