use std::{collections::VecDeque, sync::Arc};

use log::warn;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::consts::{DEFAULT_CACHE_CAPACITY, DEFAULT_FLUSH_SIZE};

use super::{lock::ResourceLock, CacheError};

/// Priority classes of the recycler. Boundary-supporting parents go to the
/// high priority queue and are evicted last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
	High = 0,
	Low = 1,
}

type SharedLock = Arc<dyn ResourceLock>;

struct RecyclerInner {
	// queue 0 holds high priority locks, queue 1 the rest; eviction pops
	// from the front of the low priority queue first
	queues: [VecDeque<SharedLock>; 2],
	sizes: [usize; 2],
	capacity: usize,
	flush_size: usize,
}

impl RecyclerInner {
	fn queue_of(&mut self, priority: Priority) -> &mut VecDeque<SharedLock> {
		&mut self.queues[priority as usize]
	}

	fn total_size(&self) -> usize {
		self.sizes[0] + self.sizes[1]
	}

	fn remove_ptr(&mut self, lock: &SharedLock) -> bool {
		for priority in [Priority::Low, Priority::High] {
			let index = priority as usize;
			if let Some(pos) = self.queues[index]
				.iter()
				.position(|held| Arc::ptr_eq(held, lock))
			{
				self.queues[index].remove(pos);
				self.sizes[index] -= lock.size();
				return true;
			}
		}
		false
	}
}

/// Byte-bounded LRU of inactive resource locks. A lock is only released when
/// the recycler holds the last reference to it; released dirty locks are
/// flushed before they are dropped, except `no_flush` locks which must
/// survive until their atomic operation settles.
pub struct CacheRecycler {
	inner: Mutex<RecyclerInner>,
	// releases dirty bytes held outside the recycler when eviction starves
	flush_dirty: Mutex<Option<Box<dyn Fn(usize) -> usize + Send>>>,
	error_on_overflow: bool,
}

assert_impl_all!(CacheRecycler: Send, Sync);

impl Default for CacheRecycler {
	fn default() -> Self {
		Self::new(DEFAULT_CACHE_CAPACITY, None, true)
	}
}

impl CacheRecycler {
	pub fn new(capacity: usize, flush_size: Option<usize>, error_on_overflow: bool) -> Self {
		Self {
			inner: Mutex::new(RecyclerInner {
				queues: [VecDeque::new(), VecDeque::new()],
				sizes: [0, 0],
				capacity,
				flush_size: flush_size.unwrap_or(DEFAULT_FLUSH_SIZE),
			}),
			flush_dirty: Mutex::new(None),
			error_on_overflow,
		}
	}

	/// Install the dirty-flush fallback invoked when eviction alone cannot
	/// release enough bytes. Returns the number of bytes it released.
	pub fn set_flush_dirty(&self, hook: impl Fn(usize) -> usize + Send + 'static) {
		*self.flush_dirty.lock() = Some(Box::new(hook));
	}

	/// Track an access to `lock`, inserting it on first sight and bumping it
	/// to the back of its queue otherwise. May trigger eviction.
	pub fn update(&self, lock: &SharedLock, priority: Priority) -> Result<(), CacheError> {
		if !lock.is_cached() {
			return Ok(());
		}
		let mut inner = self.inner.lock();
		if lock.is_recycled() {
			// bring to the back, lowest removal priority
			if inner.remove_ptr(lock) {
				let index = priority as usize;
				inner.sizes[index] += lock.size();
				inner.queue_of(priority).push_back(Arc::clone(lock));
			}
			return Ok(());
		}

		let lock_size = lock.size();
		if lock_size > inner.capacity {
			// cache too small to ever hold this resource
			return Ok(());
		}
		let index = priority as usize;
		inner.sizes[index] += lock_size;
		inner.queue_of(priority).push_back(Arc::clone(lock));
		lock.set_recycled(true);

		if inner.total_size() > inner.capacity {
			let target = inner.capacity.saturating_sub(inner.flush_size);
			self.shrink_to(&mut inner, target)?;
		}
		Ok(())
	}

	/// Evict inactive locks until the held size drops to `target`. Victims
	/// are unlinked from the queues first and flushed afterwards.
	fn shrink_to(
		&self,
		inner: &mut RecyclerInner,
		target: usize,
	) -> Result<(), CacheError> {
		// two passes: locks pinned by a boundary parent on the first pass
		// become inactive once their dependants are released
		for _ in 0..2 {
			if inner.total_size() <= target {
				return Ok(());
			}
			let mut victims: Vec<SharedLock> = Vec::new();
			let mut need = inner.total_size() - target;
			for queue_index in [1_usize, 0] {
				let mut scan = 0;
				while need > 0 && scan < inner.queues[queue_index].len() {
					// only release locks with no active external references
					let inactive = Arc::strong_count(&inner.queues[queue_index][scan]) == 1;
					let volatile = inner.queues[queue_index][scan].is_no_flush()
						&& inner.queues[queue_index][scan].is_dirty();
					if inactive && !volatile {
						let victim = inner.queues[queue_index].remove(scan).unwrap();
						inner.sizes[queue_index] -= victim.size();
						need = need.saturating_sub(victim.size());
						victim.set_recycled(false);
						victims.push(victim);
					} else {
						scan += 1;
					}
				}
			}
			for victim in victims {
				victim.flush().map_err(CacheError::Storage)?;
			}
		}

		if inner.total_size() > target {
			// eviction starved on dirty locks; ask the cache to flush some
			let released = self
				.flush_dirty
				.lock()
				.as_ref()
				.map(|hook| hook(inner.total_size() - target))
				.unwrap_or(0);
			if released == 0 && inner.total_size() > inner.capacity {
				if self.error_on_overflow {
					return Err(CacheError::DistMemoryOverflow);
				}
				warn!("cache recycler over capacity and unable to release locks");
			}
		}
		Ok(())
	}

	/// Remove a specific lock from the recycler (cache clear path).
	pub fn release(&self, lock: &SharedLock) {
		let mut inner = self.inner.lock();
		if lock.is_recycled() && inner.remove_ptr(lock) {
			lock.set_recycled(false);
		}
	}

	/// Release every inactive lock, flushing dirty ones.
	pub fn clear(&self) -> Result<(), CacheError> {
		let mut inner = self.inner.lock();
		self.shrink_to(&mut inner, 0)
	}

	pub fn size(&self) -> usize {
		self.inner.lock().total_size()
	}

	pub fn capacity(&self) -> usize {
		self.inner.lock().capacity
	}

	/// Change capacity at runtime, releasing the excess.
	pub fn resize(&self, capacity: usize) -> Result<(), CacheError> {
		let mut inner = self.inner.lock();
		inner.capacity = capacity;
		let target = capacity;
		self.shrink_to(&mut inner, target)
	}

	pub fn for_each(&self, mut f: impl FnMut(&SharedLock)) {
		let inner = self.inner.lock();
		for queue in &inner.queues {
			for lock in queue {
				f(lock);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Weak,
	};

	use super::*;
	use crate::storage::StorageError;

	struct FakeLock {
		size: usize,
		dirty: AtomicBool,
		no_flush: bool,
		recycled: AtomicBool,
		flushes: Arc<AtomicUsize>,
	}

	impl FakeLock {
		fn new(size: usize, dirty: bool, no_flush: bool) -> (Arc<Self>, Arc<AtomicUsize>) {
			let flushes = Arc::new(AtomicUsize::new(0));
			let lock = Arc::new(Self {
				size,
				dirty: AtomicBool::new(dirty),
				no_flush,
				recycled: AtomicBool::new(false),
				flushes: Arc::clone(&flushes),
			});
			(lock, flushes)
		}
	}

	impl ResourceLock for FakeLock {
		fn address(&self) -> u64 {
			0
		}

		fn size(&self) -> usize {
			self.size
		}

		fn state(&self) -> u64 {
			1
		}

		fn is_dirty(&self) -> bool {
			self.dirty.load(Ordering::SeqCst)
		}

		fn is_no_flush(&self) -> bool {
			self.no_flush
		}

		fn flush(&self) -> Result<(), StorageError> {
			self.flushes.fetch_add(1, Ordering::SeqCst);
			self.dirty.store(false, Ordering::SeqCst);
			Ok(())
		}

		fn set_recycled(&self, recycled: bool) {
			self.recycled.store(recycled, Ordering::SeqCst);
		}

		fn is_recycled(&self) -> bool {
			self.recycled.load(Ordering::SeqCst)
		}

		fn is_cached(&self) -> bool {
			true
		}

		fn reset_dirty(&self) -> bool {
			self.dirty.swap(false, Ordering::SeqCst)
		}
	}

	/// Insert a lock and drop the caller's reference, leaving the recycler
	/// as the only holder (the page maps only keep weak references).
	fn insert_inactive(
		recycler: &CacheRecycler,
		lock: Arc<FakeLock>,
	) -> Result<Weak<dyn ResourceLock>, CacheError> {
		let shared: SharedLock = lock;
		let weak = Arc::downgrade(&shared);
		recycler.update(&shared, Priority::Low)?;
		Ok(weak)
	}

	#[test]
	fn inactive_locks_are_evicted_and_flushed() {
		// given: capacity for two locks
		let recycler = CacheRecycler::new(200, Some(100), true);
		let (lock_a, flushes_a) = FakeLock::new(100, true, false);
		let (lock_b, _) = FakeLock::new(100, false, false);
		let (lock_c, _) = FakeLock::new(100, false, false);

		let weak_a = insert_inactive(&recycler, lock_a).unwrap();
		insert_inactive(&recycler, lock_b).unwrap();

		// when: inserting a third overflows and evicts the oldest
		let held: SharedLock = lock_c;
		recycler.update(&held, Priority::Low).unwrap();

		// then: the dirty victim was flushed before being dropped
		assert_eq!(flushes_a.load(Ordering::SeqCst), 1);
		assert!(weak_a.upgrade().is_none());
		assert!(held.is_recycled());
		assert!(recycler.size() <= 200);
	}

	#[test]
	fn active_locks_are_not_evicted() {
		// given
		let recycler = CacheRecycler::new(100, Some(50), false);
		let (active, flushes) = FakeLock::new(100, false, false);
		let held: SharedLock = active.clone();
		recycler.update(&held, Priority::Low).unwrap();

		// when: an insert overflows while `held` pins the first lock
		let (other, _) = FakeLock::new(100, false, false);
		insert_inactive(&recycler, other).unwrap();

		// then
		assert!(active.is_recycled());
		assert_eq!(flushes.load(Ordering::SeqCst), 0);
	}

	#[test]
	fn volatile_dirty_locks_survive_eviction() {
		// given
		let recycler = CacheRecycler::new(100, Some(100), true);
		let (volatile, flushes) = FakeLock::new(100, true, true);
		insert_inactive(&recycler, Arc::clone(&volatile)).unwrap();

		// when
		let (other, _) = FakeLock::new(100, false, false);
		let err = insert_inactive(&recycler, other).unwrap_err();

		// then: the volatile lock was neither flushed nor dropped
		assert!(matches!(err, CacheError::DistMemoryOverflow));
		assert_eq!(flushes.load(Ordering::SeqCst), 0);
		assert!(volatile.is_recycled());
	}

	#[test]
	fn flush_dirty_hook_relieves_pressure() {
		// given
		let recycler = CacheRecycler::new(100, Some(100), true);
		let released = Arc::new(AtomicUsize::new(0));
		let hook_released = Arc::clone(&released);
		recycler.set_flush_dirty(move |limit| {
			hook_released.store(limit, Ordering::SeqCst);
			limit
		});
		let (volatile, _) = FakeLock::new(100, true, true);
		insert_inactive(&recycler, Arc::clone(&volatile)).unwrap();

		// when: the hook reports enough released bytes
		let (other, _) = FakeLock::new(50, false, false);
		insert_inactive(&recycler, other).unwrap();

		// then
		assert!(released.load(Ordering::SeqCst) > 0);
	}
}
