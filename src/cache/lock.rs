use std::{
	fs::File,
	sync::{
		atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering},
		Arc,
	},
};

use parking_lot::RwLock;

use crate::{
	files::FileBacking,
	storage::{AccessMode, Storage, StorageError},
};

const FLAG_DIRTY: u16 = 1 << 0;
const FLAG_FETCHED: u16 = 1 << 1;
const FLAG_RECYCLED: u16 = 1 << 2;

/// Write-once discipline over the dirty bit: the thread that clears it owns
/// the flush; on failure the bit is restored so the data is not lost.
fn acquire_flush(flags: &AtomicU16) -> bool {
	flags.fetch_and(!FLAG_DIRTY, Ordering::AcqRel) & FLAG_DIRTY != 0
}

/// Common contract of all cached locks, used by the recycler and the
/// cache-wide flush paths.
pub trait ResourceLock: Send + Sync {
	fn address(&self) -> u64;
	fn size(&self) -> usize;
	fn state(&self) -> u64;
	fn is_dirty(&self) -> bool;
	fn is_no_flush(&self) -> bool;
	fn flush(&self) -> Result<(), StorageError>;
	fn set_recycled(&self, recycled: bool);
	fn is_recycled(&self) -> bool;
	fn is_cached(&self) -> bool;
	/// Undo a pending write (transaction rollback).
	fn reset_dirty(&self) -> bool;
}

/// A lock over one data page, or a page-aligned run of pages in the wide
/// variant. Holds the page bytes, the access flags and the state number the
/// bytes were read at / will be written under.
pub struct DpLock<F: FileBacking = File> {
	storage: Arc<Storage<F>>,
	address: u64,
	flags: AtomicU16,
	access: AccessMode,
	// no_flush / write can change when an atomic operation is merged
	no_flush: AtomicBool,
	writable: AtomicBool,
	// the transaction state for writers, the resolved read state otherwise
	state: AtomicU64,
	data: RwLock<Box<[u8]>>,
	// wide locks keep a residual parent for their unaligned tail
	residual: Option<Arc<DpLock<F>>>,
}

impl<F: FileBacking> DpLock<F> {
	/// Create a page lock. With `access.read`, the buffer is fetched from
	/// storage at `read_state`; a create-new lock starts zeroed.
	pub fn new(
		storage: Arc<Storage<F>>,
		address: u64,
		size: usize,
		access: AccessMode,
		read_state: u64,
		write_state: u64,
	) -> Result<Self, StorageError> {
		let mut data = vec![0_u8; size].into_boxed_slice();
		let mut flags = 0_u16;
		// a lock over a never-written page (read_state 0) starts zeroed
		if access.read && !access.is_create_new() && read_state > 0 {
			storage.read(address, read_state, &mut data, access)?;
			flags |= FLAG_FETCHED;
		}
		let state = if access.write { write_state } else { read_state };
		Ok(Self {
			storage,
			address,
			flags: AtomicU16::new(flags),
			access,
			no_flush: AtomicBool::new(access.no_flush),
			writable: AtomicBool::new(access.write),
			state: AtomicU64::new(state),
			data: RwLock::new(data),
			residual: None,
		})
	}

	/// Wide variant: a multi-page run with an optional residual parent
	/// covering the unaligned tail.
	pub fn new_wide(
		storage: Arc<Storage<F>>,
		address: u64,
		size: usize,
		access: AccessMode,
		read_state: u64,
		write_state: u64,
		residual: Option<Arc<DpLock<F>>>,
	) -> Result<Self, StorageError> {
		let page_size = storage.page_size();
		let mut data = vec![0_u8; size].into_boxed_slice();
		let mut flags = 0_u16;
		if access.read && !access.is_create_new() && read_state > 0 {
			let dp_size = size / page_size * page_size;
			match &residual {
				Some(residual_lock) => {
					// the tail page is already held by the residual parent
					debug_assert!(dp_size > 0 && dp_size < size);
					storage.read(address, read_state, &mut data[..dp_size], access)?;
					residual_lock.with_buf(|tail| {
						data[dp_size..].copy_from_slice(&tail[..size - dp_size]);
					});
				}
				None => storage.read(address, read_state, &mut data, access)?,
			}
			flags |= FLAG_FETCHED;
		}
		let state = if access.write { write_state } else { read_state };
		Ok(Self {
			storage,
			address,
			flags: AtomicU16::new(flags),
			access,
			no_flush: AtomicBool::new(access.no_flush),
			writable: AtomicBool::new(access.write),
			state: AtomicU64::new(state),
			data: RwLock::new(data),
			residual,
		})
	}

	/// Copy-on-write promotion: a new lock at `write_state` initialized from
	/// an older lock's buffer. The source stays untouched for snapshot
	/// readers.
	pub fn new_copy(
		src: &DpLock<F>,
		write_state: u64,
		access: AccessMode,
		residual: Option<Arc<DpLock<F>>>,
	) -> Self {
		let data = src.data.read().clone();
		Self {
			storage: Arc::clone(&src.storage),
			address: src.address,
			flags: AtomicU16::new(FLAG_FETCHED),
			access,
			no_flush: AtomicBool::new(access.no_flush),
			writable: AtomicBool::new(access.write),
			state: AtomicU64::new(write_state),
			data: RwLock::new(data),
			residual,
		}
	}

	pub fn access(&self) -> AccessMode {
		let mut access = self.access;
		access.no_flush = self.no_flush.load(Ordering::SeqCst);
		access.write = self.writable.load(Ordering::SeqCst);
		access
	}

	pub fn is_writable(&self) -> bool {
		self.writable.load(Ordering::SeqCst)
	}

	pub fn residual(&self) -> Option<&Arc<DpLock<F>>> {
		self.residual.as_ref()
	}

	pub fn set_dirty(&self) {
		self.flags.fetch_or(FLAG_DIRTY, Ordering::AcqRel);
	}

	/// Re-key the lock into a different transaction state. Used when merging
	/// an atomic operation into the enclosing transaction; also upgrades the
	/// lock to a writable one and settles the no-flush exemption.
	pub fn update_state(&self, state: u64, no_flush: bool) {
		self.state.store(state, Ordering::SeqCst);
		self.no_flush.store(no_flush, Ordering::SeqCst);
		self.writable.store(true, Ordering::SeqCst);
	}

	pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		f(&self.data.read())
	}

	pub fn with_buf_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let result = f(&mut self.data.write());
		self.set_dirty();
		result
	}

	/// Copy a source lock's bytes over this lock's buffer (atomic merge of
	/// equal-sized ranges).
	pub fn copy_from(&self, other: &DpLock<F>) {
		debug_assert_eq!(self.size(), other.size());
		let src = other.data.read();
		self.data.write().copy_from_slice(&src);
		self.set_dirty();
	}
}

impl<F: FileBacking> ResourceLock for DpLock<F> {
	fn address(&self) -> u64 {
		self.address
	}

	fn size(&self) -> usize {
		self.data.read().len()
	}

	fn state(&self) -> u64 {
		self.state.load(Ordering::SeqCst)
	}

	fn is_dirty(&self) -> bool {
		self.flags.load(Ordering::Acquire) & FLAG_DIRTY != 0
	}

	fn is_no_flush(&self) -> bool {
		self.no_flush.load(Ordering::SeqCst)
	}

	fn flush(&self) -> Result<(), StorageError> {
		if self.is_no_flush() || !self.is_writable() {
			return Ok(());
		}
		if !acquire_flush(&self.flags) {
			return Ok(());
		}
		let result = (|| {
			let data = self.data.read();
			let state = self.state();
			match &self.residual {
				Some(residual) => {
					let page_size = self.storage.page_size();
					let dp_size = data.len() / page_size * page_size;
					self.storage.write(self.address, state, &data[..dp_size])?;
					// the tail flows through the residual parent, which may
					// be flushed independently
					residual.with_buf_mut(|tail| {
						tail[..data.len() - dp_size].copy_from_slice(&data[dp_size..]);
					});
					Ok(())
				}
				None => self.storage.write(self.address, state, &data),
			}
		})();
		if result.is_err() {
			// flush failures leave the lock dirty and re-raise
			self.set_dirty();
		}
		result
	}

	fn set_recycled(&self, recycled: bool) {
		if recycled {
			self.flags.fetch_or(FLAG_RECYCLED, Ordering::AcqRel);
		} else {
			self.flags.fetch_and(!FLAG_RECYCLED, Ordering::AcqRel);
		}
	}

	fn is_recycled(&self) -> bool {
		self.flags.load(Ordering::Acquire) & FLAG_RECYCLED != 0
	}

	fn is_cached(&self) -> bool {
		!self.access.no_cache
	}

	fn reset_dirty(&self) -> bool {
		self.flags.fetch_and(!FLAG_DIRTY, Ordering::AcqRel) & FLAG_DIRTY != 0
	}
}

/// An unaligned range spanning exactly two adjacent pages, materialized over
/// two page-sized parents. The buffer stores only the user's bytes; flushing
/// copies them back into the parents (a non-IO operation, safe on drop).
pub struct BoundaryLock<F: FileBacking = File> {
	address: u64,
	flags: AtomicU16,
	no_flush: AtomicBool,
	state: AtomicU64,
	data: RwLock<Box<[u8]>>,
	lhs: Arc<DpLock<F>>,
	lhs_size: usize,
	rhs: Arc<DpLock<F>>,
}

impl<F: FileBacking> BoundaryLock<F> {
	pub fn new(
		address: u64,
		size: usize,
		access: AccessMode,
		state: u64,
		lhs: Arc<DpLock<F>>,
		rhs: Arc<DpLock<F>>,
	) -> Self {
		let lhs_size = (lhs.address() + lhs.size() as u64 - address) as usize;
		debug_assert!(lhs_size > 0 && lhs_size < size);
		let mut data = vec![0_u8; size].into_boxed_slice();
		if !access.is_create_new() {
			let lhs_offset = (address - lhs.address()) as usize;
			lhs.with_buf(|buf| data[..lhs_size].copy_from_slice(&buf[lhs_offset..]));
			rhs.with_buf(|buf| data[lhs_size..].copy_from_slice(&buf[..size - lhs_size]));
		}
		Self {
			address,
			flags: AtomicU16::new(FLAG_FETCHED),
			no_flush: AtomicBool::new(access.no_flush),
			state: AtomicU64::new(state),
			data: RwLock::new(data),
			lhs,
			lhs_size,
			rhs,
		}
	}

	pub fn parents(&self) -> (&Arc<DpLock<F>>, &Arc<DpLock<F>>) {
		(&self.lhs, &self.rhs)
	}

	pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		f(&self.data.read())
	}

	pub fn with_buf_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
		let result = f(&mut self.data.write());
		self.flags.fetch_or(FLAG_DIRTY, Ordering::AcqRel);
		result
	}

	/// Write the bytes back into the parents without any IO. Performed even
	/// under `no_flush`: the parents carry the volatile data onwards.
	pub fn flush_to_parents(&self) {
		if !acquire_flush(&self.flags) {
			return;
		}
		let data = self.data.read();
		let lhs_offset = (self.address - self.lhs.address()) as usize;
		self.lhs
			.with_buf_mut(|buf| buf[lhs_offset..].copy_from_slice(&data[..self.lhs_size]));
		self.rhs
			.with_buf_mut(|buf| buf[..data.len() - self.lhs_size].copy_from_slice(&data[self.lhs_size..]));
	}

	pub fn update_state(&self, state: u64, no_flush: bool) {
		self.state.store(state, Ordering::SeqCst);
		self.no_flush.store(no_flush, Ordering::SeqCst);
		self.lhs.update_state(state, no_flush);
		self.rhs.update_state(state, no_flush);
	}
}

impl<F: FileBacking> ResourceLock for BoundaryLock<F> {
	fn address(&self) -> u64 {
		self.address
	}

	fn size(&self) -> usize {
		self.data.read().len()
	}

	fn state(&self) -> u64 {
		self.state.load(Ordering::SeqCst)
	}

	fn is_dirty(&self) -> bool {
		self.flags.load(Ordering::Acquire) & FLAG_DIRTY != 0
	}

	fn is_no_flush(&self) -> bool {
		self.no_flush.load(Ordering::SeqCst)
	}

	fn flush(&self) -> Result<(), StorageError> {
		self.flush_to_parents();
		if self.is_no_flush() {
			return Ok(());
		}
		self.lhs.flush()?;
		self.rhs.flush()
	}

	fn set_recycled(&self, recycled: bool) {
		if recycled {
			self.flags.fetch_or(FLAG_RECYCLED, Ordering::AcqRel);
		} else {
			self.flags.fetch_and(!FLAG_RECYCLED, Ordering::AcqRel);
		}
	}

	fn is_recycled(&self) -> bool {
		self.flags.load(Ordering::Acquire) & FLAG_RECYCLED != 0
	}

	fn is_cached(&self) -> bool {
		// boundary locks never enter the recycler; their parents do
		false
	}

	fn reset_dirty(&self) -> bool {
		self.flags.fetch_and(!FLAG_DIRTY, Ordering::AcqRel) & FLAG_DIRTY != 0
	}
}

impl<F: FileBacking> Drop for BoundaryLock<F> {
	fn drop(&mut self) {
		// non-IO flush into the parents is safe on destruction
		self.flush_to_parents();
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::{
		files::PrefixFile,
		storage::AccessType,
	};

	const PAGE: usize = 4096;

	fn test_storage() -> Arc<Storage<Cursor<Vec<u8>>>> {
		let config = Storage::<Cursor<Vec<u8>>>::build_config(PAGE, 1024).unwrap();
		let file = PrefixFile::create(Cursor::new(Vec::new()), config).unwrap();
		Arc::new(Storage::open_backing(file, AccessType::ReadWrite).unwrap())
	}

	#[test]
	fn write_lock_flushes_to_storage() {
		// given
		let storage = test_storage();
		let lock = DpLock::new(
			Arc::clone(&storage),
			0,
			PAGE,
			AccessMode::WRITE.with_create(),
			0,
			1,
		)
		.unwrap();

		// when
		lock.with_buf_mut(|buf| buf[0..3].copy_from_slice(&[1, 2, 3]));
		assert!(lock.is_dirty());
		lock.flush().unwrap();

		// then
		assert!(!lock.is_dirty());
		let mut buf = vec![0_u8; PAGE];
		storage.read(0, 1, &mut buf, AccessMode::READ).unwrap();
		assert_eq!(&buf[0..3], &[1, 2, 3]);
	}

	#[test]
	fn no_flush_lock_never_reaches_storage() {
		// given
		let storage = test_storage();
		let lock = DpLock::new(
			Arc::clone(&storage),
			0,
			PAGE,
			AccessMode::WRITE.with_create().with_no_flush(),
			0,
			1,
		)
		.unwrap();
		lock.with_buf_mut(|buf| buf[0] = 9);

		// when
		lock.flush().unwrap();

		// then: the page was never written
		assert!(storage.try_find_mutation(0, 1).unwrap().is_none());
	}

	#[test]
	fn copy_on_write_promotion_keeps_source_intact() {
		// given
		let storage = test_storage();
		storage.write(0, 1, &vec![b'a'; PAGE]).unwrap();
		let old = DpLock::new(Arc::clone(&storage), 0, PAGE, AccessMode::READ, 1, 0).unwrap();

		// when
		let promoted = DpLock::new_copy(&old, 2, AccessMode::READ_WRITE, None);
		promoted.with_buf_mut(|buf| buf[0] = b'b');

		// then
		old.with_buf(|buf| assert_eq!(buf[0], b'a'));
		promoted.with_buf(|buf| assert_eq!(buf[0], b'b'));
		assert_eq!(promoted.state(), 2);
	}

	#[test]
	fn boundary_lock_writes_back_into_both_parents() {
		// given: a range crossing the first page boundary
		let storage = test_storage();
		let access = AccessMode::READ_WRITE.with_create();
		let lhs = Arc::new(
			DpLock::new(Arc::clone(&storage), 0, PAGE, access, 0, 1).unwrap(),
		);
		let rhs = Arc::new(
			DpLock::new(Arc::clone(&storage), PAGE as u64, PAGE, access, 0, 1).unwrap(),
		);
		let address = PAGE as u64 - 6;
		let boundary = BoundaryLock::new(address, 12, access, 1, Arc::clone(&lhs), Arc::clone(&rhs));

		// when
		boundary.with_buf_mut(|buf| {
			buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12])
		});
		boundary.flush().unwrap();

		// then: both parents carry their half and reached storage
		let mut buf = vec![0_u8; PAGE];
		storage.read(0, 1, &mut buf, AccessMode::READ).unwrap();
		assert_eq!(&buf[PAGE - 6..], &[1, 2, 3, 4, 5, 6]);
		storage
			.read(PAGE as u64, 1, &mut buf, AccessMode::READ)
			.unwrap();
		assert_eq!(&buf[..6], &[7, 8, 9, 10, 11, 12]);
	}

	#[test]
	fn wide_lock_tail_flows_through_residual() {
		// given: two pages plus half a page of tail
		let storage = test_storage();
		let access = AccessMode::WRITE.with_create();
		let residual = Arc::new(
			DpLock::new(Arc::clone(&storage), 2 * PAGE as u64, PAGE, access, 0, 1).unwrap(),
		);
		let size = 2 * PAGE + PAGE / 2;
		let wide = DpLock::new_wide(
			Arc::clone(&storage),
			0,
			size,
			access,
			0,
			1,
			Some(Arc::clone(&residual)),
		)
		.unwrap();

		// when
		wide.with_buf_mut(|buf| buf.fill(b'w'));
		wide.flush().unwrap();

		// then: the aligned part hit storage, the tail landed in the residual
		let mut buf = vec![0_u8; 2 * PAGE];
		storage.read(0, 1, &mut buf, AccessMode::READ).unwrap();
		assert!(buf.iter().all(|&b| b == b'w'));
		assert!(residual.is_dirty());
		residual.with_buf(|buf| {
			assert!(buf[..PAGE / 2].iter().all(|&b| b == b'w'));
			assert!(buf[PAGE / 2..].iter().all(|&b| b == 0));
		});
	}
}
