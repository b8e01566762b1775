use std::{
	fs::File,
	path::Path,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Weak,
	},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	cache::{
		is_boundary_range, BoundaryLock, CacheError, CacheRecycler, DpLock, PrefixCache, Priority,
	},
	files::FileBacking,
	storage::{AccessMode, AccessType, Storage, StorageError},
	utils::{page_mask, page_shift},
};

#[derive(Debug, Error)]
pub enum PrefixError {
	#[error("Operation not allowed: {0}")]
	Misuse(String),

	#[error("The prefix is closed")]
	Closed,

	#[error(transparent)]
	Cache(#[from] CacheError),

	#[error(transparent)]
	Storage(#[from] StorageError),
}

enum LockRef<F: FileBacking> {
	Page(Arc<DpLock<F>>),
	Boundary(Arc<BoundaryLock<F>>),
}

/// A mapped byte range of a prefix, keeping its backing resource lock alive.
/// Mutable access marks the lock dirty; the bytes reach storage on commit or
/// on eviction.
pub struct MemLock<F: FileBacking = File> {
	lock: LockRef<F>,
	offset: usize,
	len: usize,
}

impl<F: FileBacking> MemLock<F> {
	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		match &self.lock {
			LockRef::Page(lock) => lock.with_buf(|buf| f(&buf[self.offset..self.offset + self.len])),
			LockRef::Boundary(lock) => {
				lock.with_buf(|buf| f(&buf[self.offset..self.offset + self.len]))
			}
		}
	}

	pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		match &self.lock {
			LockRef::Page(lock) => {
				lock.with_buf_mut(|buf| f(&mut buf[self.offset..self.offset + self.len]))
			}
			LockRef::Boundary(lock) => {
				lock.with_buf_mut(|buf| f(&mut buf[self.offset..self.offset + self.len]))
			}
		}
	}

	pub fn read_into(&self, out: &mut [u8]) {
		self.with(|buf| out.copy_from_slice(&buf[..out.len()]));
	}

	pub fn write_from(&self, src: &[u8]) {
		self.with_mut(|buf| buf[..src.len()].copy_from_slice(src));
	}
}

#[derive(Default)]
struct TransactionState {
	// temporary state of an active atomic operation
	atomic: Option<u64>,
}

/// One storage file plus its cache and metadata indexes: the user-facing
/// mapping API. Writes target the in-progress transaction state
/// (`committed + 1`); readers at older states are never blocked by them.
pub struct Prefix<F: FileBacking = File> {
	storage: Arc<Storage<F>>,
	cache: Arc<PrefixCache<F>>,
	transaction: Mutex<TransactionState>,
	// serializes user commits with the auto-commit poller
	commit_mutex: Mutex<()>,
	closed: AtomicBool,
	shift: u32,
	mask: u64,
}

assert_impl_all!(Prefix: Send, Sync);

impl Prefix<File> {
	pub fn create(path: impl AsRef<Path>, page_size: Option<usize>) -> Result<(), PrefixError> {
		Storage::create(path, page_size)?;
		Ok(())
	}

	pub fn open(path: impl AsRef<Path>, access: AccessType) -> Result<Self, PrefixError> {
		let storage = Arc::new(Storage::open(path, access)?);
		Ok(Self::from_storage(storage, None))
	}
}

impl<F: FileBacking> Prefix<F> {
	pub fn from_storage(storage: Arc<Storage<F>>, recycler: Option<Arc<CacheRecycler>>) -> Self {
		let recycler = recycler.unwrap_or_default();
		let cache = Arc::new(PrefixCache::new(Arc::clone(&storage), recycler));
		// recycler starvation falls back to flushing this cache's dirty locks
		let weak_cache: Weak<PrefixCache<F>> = Arc::downgrade(&cache);
		cache.recycler().set_flush_dirty(move |limit| {
			weak_cache
				.upgrade()
				.map(|cache| cache.flush_dirty(limit))
				.unwrap_or(0)
		});
		let page_size = storage.page_size();
		Self {
			storage,
			cache,
			transaction: Mutex::new(TransactionState::default()),
			commit_mutex: Mutex::new(()),
			closed: AtomicBool::new(false),
			shift: page_shift(page_size),
			mask: page_mask(page_size),
		}
	}

	pub fn page_size(&self) -> usize {
		self.storage.page_size()
	}

	pub fn storage(&self) -> &Arc<Storage<F>> {
		&self.storage
	}

	pub fn cache(&self) -> &Arc<PrefixCache<F>> {
		&self.cache
	}

	/// The last committed state number.
	pub fn state_num(&self) -> u64 {
		self.storage.max_state()
	}

	/// The state the in-progress transaction writes under.
	fn write_state(&self) -> u64 {
		self.storage.max_state() + 1
	}

	fn check_open(&self) -> Result<(), PrefixError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(PrefixError::Closed);
		}
		Ok(())
	}

	/// Map a byte range at the given access. Writers receive the current
	/// transaction (or atomic) state; readers observe the newest committed
	/// data including their own transaction's writes.
	pub fn map_range(
		&self,
		address: u64,
		size: usize,
		access: AccessMode,
	) -> Result<MemLock<F>, PrefixError> {
		self.check_open()?;
		if access.write && self.storage.access_type() == AccessType::ReadOnly {
			return Err(PrefixError::Misuse(
				"write mapping on a read-only prefix".to_string(),
			));
		}

		let mut access = access;
		let state = if access.write {
			let transaction = self.transaction.lock();
			match transaction.atomic {
				Some(temp) => {
					// writes inside an atomic block are volatile
					access.no_flush = true;
					temp
				}
				None => self.write_state(),
			}
		} else {
			self.write_state()
		};
		self.map_range_at(address, size, access, state)
	}

	fn map_range_at(
		&self,
		address: u64,
		size: usize,
		access: AccessMode,
		state: u64,
	) -> Result<MemLock<F>, PrefixError> {
		if size == 0 {
			return Err(PrefixError::Misuse("cannot map an empty range".to_string()));
		}
		let first_page = address >> self.shift;
		let end_page = ((address + size as u64 - 1) >> self.shift) + 1;
		let offset = address & self.mask;

		if end_page == first_page + 1 {
			// contained in a single page; a partial cover must preserve the
			// surrounding bytes of the page
			let mut page_access = access;
			if offset != 0 || size != self.page_size() {
				page_access.read = true;
				page_access.create = true;
			}
			let lock = self
				.cache
				.map_page(first_page, state, page_access, Priority::Low)?;
			return Ok(MemLock {
				lock: LockRef::Page(lock),
				offset: offset as usize,
				len: size,
			});
		}

		if is_boundary_range(first_page, end_page, offset) {
			let lock = self.cache.map_boundary(address, size, state, access)?;
			return Ok(MemLock {
				lock: LockRef::Boundary(lock),
				offset: 0,
				len: size,
			});
		}

		if offset != 0 {
			return Err(PrefixError::Misuse(format!(
				"wide range at {address} must be page-aligned"
			)));
		}
		let lock = self.cache.map_range(address, size, state, access)?;
		Ok(MemLock {
			lock: LockRef::Page(lock),
			offset: 0,
			len: size,
		})
	}

	/// Commit the in-progress transaction, returning the new state number.
	pub fn commit(&self) -> Result<u64, PrefixError> {
		self.check_open()?;
		if self.storage.access_type() == AccessType::ReadOnly {
			return Err(PrefixError::Misuse("commit on a read-only prefix".to_string()));
		}
		if self.transaction.lock().atomic.is_some() {
			return Err(PrefixError::Misuse(
				"commit inside an atomic operation".to_string(),
			));
		}
		let _commit = self.commit_mutex.lock();
		self.cache.flush()?;
		self.storage.flush()?;
		Ok(self.storage.max_state())
	}

	/// Poll for changes published by a writer and invalidate affected cache
	/// ranges. Returns the file's last-updated stamp.
	pub fn refresh(&self) -> Result<u64, PrefixError> {
		self.check_open()?;
		let cache = Arc::clone(&self.cache);
		let last_updated = self
			.storage
			.refresh(move |page, state| cache.mark_missing(page, state))?;
		Ok(last_updated)
	}

	/// A read-only view pinned at `state` (defaults to the newest committed
	/// state). The snapshot stays stable while newer states are written.
	pub fn snapshot(&self, state: Option<u64>) -> Result<PrefixSnapshot<F>, PrefixError> {
		self.check_open()?;
		let state = state.unwrap_or_else(|| self.state_num());
		if state == 0 || state > self.write_state() {
			return Err(PrefixError::Misuse(format!(
				"no snapshot available at state {state}"
			)));
		}
		Ok(PrefixSnapshot {
			prefix: self,
			state,
		})
	}

	/// Start an atomic operation: subsequent writes land on a volatile
	/// temporary state until [`end_atomic`] folds them into the transaction
	/// or [`cancel_atomic`] discards them.
	pub fn begin_atomic(&self) -> Result<(), PrefixError> {
		self.check_open()?;
		if self.storage.access_type() == AccessType::ReadOnly {
			return Err(PrefixError::Misuse(
				"atomic operation on a read-only prefix".to_string(),
			));
		}
		let mut transaction = self.transaction.lock();
		if transaction.atomic.is_some() {
			return Err(PrefixError::Misuse(
				"atomic operations must not overlap".to_string(),
			));
		}
		// parents must be consistent at the atomic start point
		self.cache.flush_boundary();
		transaction.atomic = Some(self.write_state() + 1);
		Ok(())
	}

	/// Merge the atomic operation's mutations into the transaction.
	pub fn end_atomic(&self) -> Result<(), PrefixError> {
		self.check_open()?;
		let mut transaction = self.transaction.lock();
		let Some(temp) = transaction.atomic.take() else {
			return Err(PrefixError::Misuse("no active atomic operation".to_string()));
		};
		self.cache.merge(temp, self.write_state());
		Ok(())
	}

	/// Discard the atomic operation as if it never ran.
	pub fn cancel_atomic(&self) -> Result<(), PrefixError> {
		self.check_open()?;
		let mut transaction = self.transaction.lock();
		let Some(temp) = transaction.atomic.take() else {
			return Err(PrefixError::Misuse("no active atomic operation".to_string()));
		};
		self.cache.rollback(temp);
		Ok(())
	}

	pub fn last_updated(&self) -> Result<u64, PrefixError> {
		Ok(self.storage.last_updated()?)
	}

	/// Flush and detach; further operations fail with [`PrefixError::Closed`].
	pub fn close(&self) -> Result<(), PrefixError> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		if self.storage.access_type() == AccessType::ReadWrite {
			let _commit = self.commit_mutex.lock();
			self.cache.flush()?;
			self.storage.flush()?;
		}
		self.cache.clear();
		Ok(())
	}
}

/// Read-only view of a prefix at a fixed state number.
pub struct PrefixSnapshot<'a, F: FileBacking = File> {
	prefix: &'a Prefix<F>,
	state: u64,
}

impl<F: FileBacking> PrefixSnapshot<'_, F> {
	pub fn state_num(&self) -> u64 {
		self.state
	}

	pub fn map_range(&self, address: u64, size: usize) -> Result<MemLock<F>, PrefixError> {
		self.prefix
			.map_range_at(address, size, AccessMode::READ, self.state)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::files::PrefixFile;

	const PAGE: usize = 4096;

	fn test_prefix() -> Prefix<Cursor<Vec<u8>>> {
		let config = Storage::<Cursor<Vec<u8>>>::build_config(PAGE, 1024).unwrap();
		let file = PrefixFile::create(Cursor::new(Vec::new()), config).unwrap();
		let storage = Arc::new(Storage::open_backing(file, AccessType::ReadWrite).unwrap());
		Prefix::from_storage(storage, None)
	}

	fn write_page(prefix: &Prefix<Cursor<Vec<u8>>>, page: u64, byte: u8) {
		let lock = prefix
			.map_range(
				page * PAGE as u64,
				PAGE,
				AccessMode::READ_WRITE.with_create(),
			)
			.unwrap();
		lock.with_mut(|buf| buf.fill(byte));
	}

	fn read_page(prefix: &Prefix<Cursor<Vec<u8>>>, page: u64) -> Vec<u8> {
		let lock = prefix
			.map_range(page * PAGE as u64, PAGE, AccessMode::READ)
			.unwrap();
		let mut out = vec![0_u8; PAGE];
		lock.read_into(&mut out);
		out
	}

	#[test]
	fn mvcc_time_travel() {
		// given: page 3 written at state 1 and state 2
		let prefix = test_prefix();
		write_page(&prefix, 3, b'a');
		assert_eq!(prefix.commit().unwrap(), 1);
		write_page(&prefix, 3, b'b');
		assert_eq!(prefix.commit().unwrap(), 2);

		// when
		let snapshot = prefix.snapshot(Some(1)).unwrap();

		// then: the snapshot reads the old bytes, the head the new ones
		let old = snapshot.map_range(3 * PAGE as u64, PAGE).unwrap();
		old.with(|buf| assert!(buf.iter().all(|&b| b == b'a')));
		assert_eq!(read_page(&prefix, 3), vec![b'b'; PAGE]);

		// and the snapshot survives the head moving on
		write_page(&prefix, 3, b'c');
		prefix.commit().unwrap();
		let old = snapshot.map_range(3 * PAGE as u64, PAGE).unwrap();
		old.with(|buf| assert!(buf.iter().all(|&b| b == b'a')));
		assert_eq!(read_page(&prefix, 3), vec![b'c'; PAGE]);
	}

	#[test]
	fn uncommitted_writes_are_visible_in_program_order() {
		// given
		let prefix = test_prefix();
		write_page(&prefix, 5, b'x');

		// then: a read through the same prefix sees the pending write
		assert_eq!(read_page(&prefix, 5), vec![b'x'; PAGE]);
	}

	#[test]
	fn boundary_write_survives_eviction() {
		// given: a 12 byte range spanning pages 0 and 1
		let prefix = test_prefix();
		let bytes: Vec<u8> = (1..=12).collect();
		let lock = prefix
			.map_range(
				PAGE as u64 - 6,
				12,
				AccessMode::READ_WRITE.with_create(),
			)
			.unwrap();
		lock.write_from(&bytes);

		// when: the mapping is dropped and every lock is evicted
		drop(lock);
		prefix.cache().recycler().clear().unwrap();

		// then: re-mapping the same range reads back identical bytes
		let lock = prefix
			.map_range(PAGE as u64 - 6, 12, AccessMode::READ)
			.unwrap();
		let mut out = vec![0_u8; 12];
		lock.read_into(&mut out);
		assert_eq!(out, bytes);
	}

	#[test]
	fn wide_range_with_residual_tail_round_trips() {
		// given: two and a half pages
		let prefix = test_prefix();
		let size = 2 * PAGE + PAGE / 2;
		let lock = prefix
			.map_range(0, size, AccessMode::WRITE.with_create())
			.unwrap();
		lock.with_mut(|buf| {
			for (index, byte) in buf.iter_mut().enumerate() {
				*byte = (index % 251) as u8;
			}
		});
		drop(lock);
		prefix.commit().unwrap();

		// when: the cache is emptied and the range re-read
		prefix.cache().recycler().clear().unwrap();
		let lock = prefix.map_range(0, size, AccessMode::READ).unwrap();

		// then
		lock.with(|buf| {
			for (index, byte) in buf.iter().enumerate() {
				assert_eq!(*byte, (index % 251) as u8);
			}
		});
	}

	#[test]
	fn atomic_rollback_restores_pre_atomic_bytes() {
		// given: page 7 committed with known bytes
		let prefix = test_prefix();
		write_page(&prefix, 7, b'p');
		let head = prefix.commit().unwrap();

		// when: an atomic write is cancelled
		prefix.begin_atomic().unwrap();
		let lock = prefix
			.map_range(7 * PAGE as u64, PAGE, AccessMode::READ_WRITE)
			.unwrap();
		lock.with_mut(|buf| buf[0..2].copy_from_slice(b"XX"));
		drop(lock);
		prefix.cancel_atomic().unwrap();

		// then
		assert_eq!(read_page(&prefix, 7), vec![b'p'; PAGE]);
		assert_eq!(prefix.state_num(), head);
	}

	#[test]
	fn atomic_end_merges_into_the_transaction() {
		// given
		let prefix = test_prefix();
		write_page(&prefix, 7, b'p');
		prefix.commit().unwrap();

		// when
		prefix.begin_atomic().unwrap();
		let lock = prefix
			.map_range(7 * PAGE as u64, PAGE, AccessMode::READ_WRITE)
			.unwrap();
		lock.with_mut(|buf| buf[0] = b'q');
		drop(lock);
		prefix.end_atomic().unwrap();
		let state = prefix.commit().unwrap();

		// then: the atomic write committed with the transaction
		assert_eq!(read_page(&prefix, 7)[0], b'q');
		assert_eq!(prefix.state_num(), state);
	}

	#[test]
	fn overlapping_atomic_operations_are_refused() {
		// given
		let prefix = test_prefix();
		prefix.begin_atomic().unwrap();

		// then
		assert!(matches!(
			prefix.begin_atomic(),
			Err(PrefixError::Misuse(_))
		));
		prefix.cancel_atomic().unwrap();
	}

	#[test]
	fn commit_without_writes_keeps_the_state() {
		// given
		let prefix = test_prefix();
		write_page(&prefix, 0, 1);
		let state = prefix.commit().unwrap();

		// then
		assert_eq!(prefix.commit().unwrap(), state);
	}

	#[test]
	fn closed_prefix_rejects_operations() {
		// given
		let prefix = test_prefix();
		prefix.close().unwrap();

		// then
		assert!(matches!(
			prefix.map_range(0, PAGE, AccessMode::READ),
			Err(PrefixError::Closed)
		));
	}
}
