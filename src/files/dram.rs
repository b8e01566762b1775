use std::{
	collections::{HashMap, HashSet, VecDeque},
	sync::Arc,
};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{
	block::BlockStream, changelog::ChangeLogStream, BlockAllocator, FileBacking, FileError,
	PrefixFile,
};

/// In-memory paged heap serving as a lightweight "filesystem" for the
/// metadata indexes. Page 0 is reserved for index headers by convention.
pub(crate) struct DramSpace {
	page_size: usize,
	pages: Vec<Box<[u8]>>,
	dirty: HashSet<u64>,
}

impl DramSpace {
	pub fn new(page_size: usize) -> Self {
		Self {
			page_size,
			pages: Vec::new(),
			dirty: HashSet::new(),
		}
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	pub fn page_count(&self) -> u64 {
		self.pages.len() as u64
	}

	pub fn is_empty(&self) -> bool {
		self.pages.is_empty()
	}

	pub fn alloc_page(&mut self) -> u64 {
		let page_num = self.pages.len() as u64;
		self.pages.push(vec![0_u8; self.page_size].into());
		self.dirty.insert(page_num);
		page_num
	}

	pub fn page(&self, page_num: u64) -> &[u8] {
		&self.pages[page_num as usize]
	}

	pub fn page_mut(&mut self, page_num: u64) -> &mut [u8] {
		self.dirty.insert(page_num);
		&mut self.pages[page_num as usize]
	}

	/// Overwrite a page with externally published bytes, growing the heap as
	/// needed. Used by readers; does not mark the page dirty.
	pub fn overlay_page(&mut self, page_num: u64, data: &[u8]) {
		assert_eq!(data.len(), self.page_size);
		while self.pages.len() <= page_num as usize {
			self.pages.push(vec![0_u8; self.page_size].into());
		}
		self.pages[page_num as usize].copy_from_slice(data);
	}

	pub fn take_dirty(&mut self) -> Vec<u64> {
		let mut dirty: Vec<u64> = self.dirty.drain().collect();
		dirty.sort_unstable();
		dirty
	}
}

#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct DramChunkHeaderRepr {
	state: u64,
	page_num: u64,
}

const DRAM_CHUNK_HEADER_SIZE: usize = 16;

/// Persists a [`DramSpace`] into the prefix file: one chunk per dirty DRAM
/// page, published to readers through the DRAM change-log stream which lists
/// the file addresses of the chunks written by each flush.
///
/// Chunk checksums are disabled in this stream; torn writes are detected via
/// the (checksummed) change-log instead.
pub(crate) struct DramStream<F: FileBacking> {
	stream: BlockStream<F>,
	dram_page_size: usize,
	// most recent chunk address of every DRAM page
	page_map: HashMap<u64, u64>,
	// stale chunk addresses free for overwriting
	reusable: VecDeque<u64>,
	// stale addresses still referenced by the last change-log chunk
	deferred: Vec<u64>,
	last_changelog: HashSet<u64>,
}

impl<F: FileBacking> DramStream<F> {
	pub fn new(
		file: Arc<PrefixFile<F>>,
		allocator: Arc<BlockAllocator>,
		first_block: u64,
		block_size: u64,
		dram_page_size: usize,
	) -> Self {
		Self {
			stream: BlockStream::new(file, allocator, first_block, block_size, false),
			dram_page_size,
			page_map: HashMap::new(),
			reusable: VecDeque::new(),
			deferred: Vec::new(),
			last_changelog: HashSet::new(),
		}
	}

	pub fn size_of_header() -> usize {
		DRAM_CHUNK_HEADER_SIZE
	}

	/// Replay the change-log history, overlaying every published DRAM page
	/// into `space` and (for writers) rebuilding the reuse bookkeeping.
	pub fn load(
		&mut self,
		space: &mut DramSpace,
		changelog: &mut ChangeLogStream<F>,
	) -> Result<bool, FileError> {
		let mut applied = false;
		while let Some(chunk) = changelog.read_change_log_chunk()? {
			// first element is the state number, the rest are chunk addresses
			let addrs = &chunk[1..];
			for &addr in addrs {
				let payload = self.stream.read_chunk_at(addr)?;
				let (_, page_num, data) = Self::decode_chunk(&payload, self.dram_page_size)?;
				space.overlay_page(page_num, data);
				if let Some(old) = self.page_map.insert(page_num, addr) {
					self.reusable.push_back(old);
				}
				applied = true;
			}
			self.last_changelog = addrs.iter().copied().collect();
		}
		// addresses from the last chunk must remain readable
		self.reusable.retain(|addr| !self.last_changelog.contains(addr));
		Ok(applied)
	}

	fn decode_chunk(payload: &[u8], dram_page_size: usize) -> Result<(u64, u64, &[u8]), FileError> {
		if payload.len() != DRAM_CHUNK_HEADER_SIZE + dram_page_size {
			return Err(FileError::Corrupted(
				"DRAM chunk size mismatch".to_string(),
			));
		}
		let header = DramChunkHeaderRepr::read_from(&payload[..DRAM_CHUNK_HEADER_SIZE])
			.ok_or(FileError::UnexpectedEof)?;
		Ok((
			header.state,
			header.page_num,
			&payload[DRAM_CHUNK_HEADER_SIZE..],
		))
	}

	/// Position the writer after the last stored chunk. Must be called before
	/// the first [`flush_updates`] on a reopened stream.
	pub fn seek_to_end(&mut self) -> Result<(), FileError> {
		self.stream.seek_to_end()
	}

	/// Flush all dirty DRAM pages under `state` and publish their chunk
	/// addresses as one change-log chunk.
	pub fn flush_updates(
		&mut self,
		state: u64,
		space: &mut DramSpace,
		changelog: &mut ChangeLogStream<F>,
	) -> Result<bool, FileError> {
		let dirty = space.take_dirty();
		if dirty.is_empty() {
			return Ok(false);
		}

		let mut written = Vec::with_capacity(dirty.len());
		for page_num in dirty {
			let mut payload =
				Vec::with_capacity(DRAM_CHUNK_HEADER_SIZE + self.dram_page_size);
			let header = DramChunkHeaderRepr { state, page_num };
			payload.extend_from_slice(header.as_bytes());
			payload.extend_from_slice(space.page(page_num));

			let addr = match self.reusable.pop_front() {
				Some(addr) => {
					self.stream.overwrite_chunk(addr, &payload)?;
					addr
				}
				None => self.stream.append_chunk(&payload)?,
			};
			if let Some(old) = self.page_map.insert(page_num, addr) {
				if self.last_changelog.contains(&old) {
					self.deferred.push(old);
				} else {
					self.reusable.push_back(old);
				}
			}
			written.push(addr);
		}

		let mut entries = Vec::with_capacity(written.len() + 1);
		entries.push(state);
		entries.extend_from_slice(&written);
		changelog.append_change_log(&entries)?;

		// the previous change-log chunk is now superseded, its stale
		// addresses become reusable
		self.reusable.extend(self.deferred.drain(..));
		self.last_changelog = written.into_iter().collect();
		Ok(true)
	}

	/// Apply newly published changes (readers). Continues until the
	/// change-log stream is exhausted.
	pub fn apply_changes(
		&mut self,
		space: &mut DramSpace,
		changelog: &mut ChangeLogStream<F>,
	) -> Result<bool, FileError> {
		self.load(space, changelog)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::files::{PrefixConfig, CONFIG_BLOCK_SIZE};

	const BLOCK_SIZE: u64 = 512;
	const DRAM_PAGE_SIZE: usize = 128;

	struct TestRig {
		file: Arc<PrefixFile<Cursor<Vec<u8>>>>,
		allocator: Arc<BlockAllocator>,
	}

	impl TestRig {
		fn new() -> Self {
			let config = PrefixConfig {
				block_size: BLOCK_SIZE as u32,
				page_size: 64,
				dram_page_size: DRAM_PAGE_SIZE as u32,
				dram_io_offset: CONFIG_BLOCK_SIZE,
				wal_offset: 0,
				dram_changelog_offset: CONFIG_BLOCK_SIZE + BLOCK_SIZE,
				dp_changelog_offset: 0,
			};
			let file = Arc::new(PrefixFile::create(Cursor::new(Vec::new()), config).unwrap());
			let allocator = Arc::new(BlockAllocator::new(
				CONFIG_BLOCK_SIZE + 2 * BLOCK_SIZE,
				BLOCK_SIZE,
			));
			Self { file, allocator }
		}

		fn dram_stream(&self) -> DramStream<Cursor<Vec<u8>>> {
			DramStream::new(
				Arc::clone(&self.file),
				Arc::clone(&self.allocator),
				CONFIG_BLOCK_SIZE,
				BLOCK_SIZE,
				DRAM_PAGE_SIZE,
			)
		}

		fn changelog(&self) -> ChangeLogStream<Cursor<Vec<u8>>> {
			ChangeLogStream::new(
				Arc::clone(&self.file),
				Arc::clone(&self.allocator),
				CONFIG_BLOCK_SIZE + BLOCK_SIZE,
				BLOCK_SIZE,
			)
		}
	}

	#[test]
	fn flush_and_reload_round_trip() {
		// given
		let rig = TestRig::new();
		let mut space = DramSpace::new(DRAM_PAGE_SIZE);
		let page = space.alloc_page();
		space.page_mut(page)[0..4].copy_from_slice(&[1, 2, 3, 4]);

		// when
		let mut stream = rig.dram_stream();
		let mut changelog = rig.changelog();
		assert!(stream.flush_updates(1, &mut space, &mut changelog).unwrap());

		// then: a reader replaying the change-log sees the page
		let mut reader_space = DramSpace::new(DRAM_PAGE_SIZE);
		let mut reader_stream = rig.dram_stream();
		let mut reader_changelog = rig.changelog();
		assert!(reader_stream
			.apply_changes(&mut reader_space, &mut reader_changelog)
			.unwrap());
		assert_eq!(&reader_space.page(page)[0..4], &[1, 2, 3, 4]);
	}

	#[test]
	fn flush_without_dirty_pages_is_a_no_op() {
		// given
		let rig = TestRig::new();
		let mut space = DramSpace::new(DRAM_PAGE_SIZE);

		// when
		let mut stream = rig.dram_stream();
		let mut changelog = rig.changelog();

		// then
		assert!(!stream.flush_updates(1, &mut space, &mut changelog).unwrap());
	}

	#[test]
	fn reader_sees_latest_version_after_repeated_flushes() {
		// given
		let rig = TestRig::new();
		let mut space = DramSpace::new(DRAM_PAGE_SIZE);
		let page = space.alloc_page();
		let mut stream = rig.dram_stream();
		let mut changelog = rig.changelog();

		// when: three flushes of the same page
		for round in 1..=3_u8 {
			space.page_mut(page)[0] = round;
			stream
				.flush_updates(round as u64, &mut space, &mut changelog)
				.unwrap();
		}

		// then
		let mut reader_space = DramSpace::new(DRAM_PAGE_SIZE);
		let mut reader_stream = rig.dram_stream();
		let mut reader_changelog = rig.changelog();
		reader_stream
			.apply_changes(&mut reader_space, &mut reader_changelog)
			.unwrap();
		assert_eq!(reader_space.page(page)[0], 3);
	}

	#[test]
	fn incremental_refresh_applies_only_new_chunks() {
		// given: a reader caught up with the first flush
		let rig = TestRig::new();
		let mut space = DramSpace::new(DRAM_PAGE_SIZE);
		let page = space.alloc_page();
		space.page_mut(page)[0] = 1;
		let mut stream = rig.dram_stream();
		let mut changelog = rig.changelog();
		stream.flush_updates(1, &mut space, &mut changelog).unwrap();

		let mut reader_space = DramSpace::new(DRAM_PAGE_SIZE);
		let mut reader_stream = rig.dram_stream();
		let mut reader_changelog = rig.changelog();
		reader_stream
			.apply_changes(&mut reader_space, &mut reader_changelog)
			.unwrap();

		// when: the writer publishes another state
		space.page_mut(page)[0] = 2;
		stream.flush_updates(2, &mut space, &mut changelog).unwrap();

		// then: an incremental apply picks it up, a second one is a no-op
		assert!(reader_stream
			.apply_changes(&mut reader_space, &mut reader_changelog)
			.unwrap());
		assert_eq!(reader_space.page(page)[0], 2);
		assert!(!reader_stream
			.apply_changes(&mut reader_space, &mut reader_changelog)
			.unwrap());
	}
}
