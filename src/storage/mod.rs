use std::{fs::File, path::Path, sync::Arc};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	consts::{DEFAULT_DRAM_PAGE_SIZE, DEFAULT_MAX_DIFF_RUN, DEFAULT_PAGE_SIZE},
	files::{
		block::BlockStream, changelog::ChangeLogStream, dram::DramSpace, dram::DramStream,
		page_io::PageIo, BlockAllocator, FileBacking, FileError, PrefixConfig, PrefixFile,
		CONFIG_BLOCK_SIZE,
	},
	index::{
		diff::DiffIndex,
		sparse::{PageType, SparseIndex},
	},
};

#[derive(Debug, Error)]
pub enum StorageError {
	#[error("Page {page} not found at state {state}")]
	PageNotFound { page: u64, state: u64 },

	#[error("The storage is read-only")]
	ReadOnly,

	#[error("Invalid argument: {0}")]
	InvalidArgument(String),

	#[error("Internal invariant violated: {0}")]
	Internal(String),

	#[error(transparent)]
	File(#[from] FileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
	ReadOnly,
	ReadWrite,
}

/// Access flags attached to reads and resource locks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessMode {
	pub read: bool,
	pub write: bool,
	pub create: bool,
	pub no_flush: bool,
	pub no_cache: bool,
}

impl AccessMode {
	pub const READ: Self = Self {
		read: true,
		write: false,
		create: false,
		no_flush: false,
		no_cache: false,
	};
	pub const WRITE: Self = Self {
		read: false,
		write: true,
		create: false,
		no_flush: false,
		no_cache: false,
	};
	pub const READ_WRITE: Self = Self {
		read: true,
		write: true,
		create: false,
		no_flush: false,
		no_cache: false,
	};

	pub fn with_create(mut self) -> Self {
		self.create = true;
		self
	}

	pub fn with_no_flush(mut self) -> Self {
		self.no_flush = true;
		self
	}

	pub fn with_no_cache(mut self) -> Self {
		self.no_cache = true;
		self
	}

	/// A lock created for writing without reading starts from zeroes.
	pub fn is_create_new(&self) -> bool {
		self.create && !self.read
	}
}

struct StorageInner<F: FileBacking> {
	dram_space: DramSpace,
	dram_stream: DramStream<F>,
	dram_changelog: ChangeLogStream<F>,
	dp_changelog: ChangeLogStream<F>,
	page_io: PageIo<F>,
	sparse: SparseIndex,
	diff: DiffIndex,
}

/// Block-device style storage over a single prefix file. The sparse index is
/// held in DRAM space; modifications reach readers through the DRAM and
/// data-page change logs appended on every flush.
pub struct Storage<F: FileBacking = File> {
	file: Arc<PrefixFile<F>>,
	config: PrefixConfig,
	access: AccessType,
	max_diff_run: usize,
	inner: Mutex<StorageInner<F>>,
}

assert_impl_all!(Storage: Send, Sync);

impl Storage<File> {
	/// Create a new prefix file. `page_size` defaults to 4096 and must be a
	/// power of two.
	pub fn create(path: impl AsRef<Path>, page_size: Option<usize>) -> Result<(), StorageError> {
		let config = Self::build_config(
			page_size.unwrap_or(DEFAULT_PAGE_SIZE),
			DEFAULT_DRAM_PAGE_SIZE,
		)?;
		PrefixFile::create_file(path, config)?;
		Ok(())
	}

	pub fn open(path: impl AsRef<Path>, access: AccessType) -> Result<Self, StorageError> {
		let file = PrefixFile::open_file(path, access == AccessType::ReadOnly)?;
		Self::open_backing(file, access)
	}
}

impl<F: FileBacking> Storage<F> {
	pub(crate) fn build_config(
		page_size: usize,
		dram_page_size_hint: usize,
	) -> Result<PrefixConfig, StorageError> {
		if !page_size.is_power_of_two() || page_size < 512 {
			return Err(StorageError::InvalidArgument(format!(
				"invalid page size {page_size}"
			)));
		}
		// the block must be page-aligned and fit one DRAM page chunk
		let overhead = BlockStream::<F>::size_of_headers(true) + DramStream::<F>::size_of_header();
		let min_block_size = dram_page_size_hint + overhead;
		let block_size = min_block_size.div_ceil(page_size) * page_size;
		let dram_page_size = block_size - overhead;

		let block = block_size as u64;
		Ok(PrefixConfig {
			block_size: block_size as u32,
			page_size: page_size as u32,
			dram_page_size: dram_page_size as u32,
			dram_io_offset: CONFIG_BLOCK_SIZE,
			wal_offset: CONFIG_BLOCK_SIZE + block,
			dram_changelog_offset: CONFIG_BLOCK_SIZE + 2 * block,
			dp_changelog_offset: CONFIG_BLOCK_SIZE + 3 * block,
		})
	}

	pub(crate) fn open_backing(file: PrefixFile<F>, access: AccessType) -> Result<Self, StorageError> {
		let file = Arc::new(file);
		let config = file.read_config()?;
		let block_size = config.block_size as u64;
		// the four stream head blocks are pre-assigned even in a fresh file
		let reserved_end = CONFIG_BLOCK_SIZE + 4 * block_size;
		let allocator = BlockAllocator::from_file_len(file.len()?, block_size);
		allocator.observe(reserved_end);
		let allocator = Arc::new(allocator);

		let mut dram_space = DramSpace::new(config.dram_page_size as usize);
		let mut dram_stream = DramStream::new(
			Arc::clone(&file),
			Arc::clone(&allocator),
			config.dram_io_offset,
			block_size,
			config.dram_page_size as usize,
		);
		let mut dram_changelog = ChangeLogStream::new(
			Arc::clone(&file),
			Arc::clone(&allocator),
			config.dram_changelog_offset,
			block_size,
		);
		let mut dp_changelog = ChangeLogStream::new(
			Arc::clone(&file),
			Arc::clone(&allocator),
			config.dp_changelog_offset,
			block_size,
		);
		// the WAL region declared by the config block stays reserved; its
		// blocks are accounted for by the allocator

		// replay published DRAM pages into the in-memory heap
		dram_stream.load(&mut dram_space, &mut dram_changelog)?;
		let mut sparse = SparseIndex::new(&mut dram_space);
		let diff = DiffIndex::new(&dram_space);

		if access == AccessType::ReadWrite {
			dram_stream.seek_to_end()?;
			dram_changelog.seek_to_end()?;
			dp_changelog.drain()?;
			dp_changelog.seek_to_end()?;
			// creating the header page dirtied the space; a fresh storage
			// has nothing worth publishing yet
			if sparse.max_state() == 0 {
				dram_space.take_dirty();
			}
		} else {
			// readers only consume what writers published
			dp_changelog.drain()?;
			dram_space.take_dirty();
			sparse.refresh(&dram_space);
		}

		let page_io = if access == AccessType::ReadWrite {
			PageIo::new_writer(
				Arc::clone(&file),
				Arc::clone(&allocator),
				config.page_size,
				sparse.next_physical_page(),
			)
		} else {
			PageIo::new_reader(Arc::clone(&file), Arc::clone(&allocator), config.page_size)
		};

		Ok(Self {
			file,
			config,
			access,
			max_diff_run: DEFAULT_MAX_DIFF_RUN,
			inner: Mutex::new(StorageInner {
				dram_space,
				dram_stream,
				dram_changelog,
				dp_changelog,
				page_io,
				sparse,
				diff,
			}),
		})
	}

	pub fn page_size(&self) -> usize {
		self.config.page_size as usize
	}

	pub fn access_type(&self) -> AccessType {
		self.access
	}

	fn check_range(&self, address: u64, size: usize, op: &str) -> Result<(), StorageError> {
		let page_size = self.config.page_size as u64;
		if address % page_size != 0 || size as u64 % page_size != 0 || size == 0 {
			return Err(StorageError::InvalidArgument(format!(
				"{op}: range {address}+{size} is not page-aligned"
			)));
		}
		Ok(())
	}

	/// Read `buf.len()` bytes at a page-aligned address as observed at
	/// `state`. With `flags.read` unset, missing pages read as zeroes
	/// (write-only create path) instead of failing.
	pub fn read(
		&self,
		address: u64,
		state: u64,
		buf: &mut [u8],
		flags: AccessMode,
	) -> Result<(), StorageError> {
		self.check_range(address, buf.len(), "read")?;
		if state == 0 {
			return Err(StorageError::InvalidArgument(
				"read: state number must be > 0".to_string(),
			));
		}
		if flags.write && self.access == AccessType::ReadOnly {
			return Err(StorageError::ReadOnly);
		}

		let page_size = self.config.page_size as usize;
		let inner = self.inner.lock();
		let begin_page = address / page_size as u64;
		for (index, chunk) in buf.chunks_mut(page_size).enumerate() {
			let page = begin_page + index as u64;
			match inner.sparse.lookup(&inner.dram_space, page, state_u32(state)?) {
				Some(entry) => {
					inner.page_io.read(entry.phys, chunk)?;
					// overlay any diff-encoded updates between the full page
					// state and the requested state
					let updates = inner.diff.collect_updates(
						&inner.dram_space,
						page,
						entry.state,
						state_u32(state)?,
					);
					for (_, diff_phys) in updates {
						let mut diff_page = vec![0_u8; page_size];
						inner.page_io.read(diff_phys, &mut diff_page)?;
						apply_diff_page(&diff_page, chunk)?;
					}
				}
				None => {
					// read+create tolerates missing pages (they read as
					// zeroes); a plain read does not
					if flags.read && !flags.create {
						return Err(StorageError::PageNotFound { page, state });
					}
					chunk.fill(0);
				}
			}
		}
		Ok(())
	}

	/// Write full pages at `state`. A repeated write of the same
	/// `(page, state)` rewrites the physical page in place.
	pub fn write(&self, address: u64, state: u64, buf: &[u8]) -> Result<(), StorageError> {
		self.check_range(address, buf.len(), "write")?;
		if self.access == AccessType::ReadOnly {
			return Err(StorageError::ReadOnly);
		}
		let state32 = state_u32(state)?;
		if state32 == 0 {
			return Err(StorageError::InvalidArgument(
				"write: state number must be > 0".to_string(),
			));
		}

		let page_size = self.config.page_size as usize;
		let mut inner = self.inner.lock();
		let inner = &mut *inner;
		let begin_page = address / page_size as u64;
		for (index, chunk) in buf.chunks(page_size).enumerate() {
			let page = begin_page + index as u64;
			match inner.sparse.lookup(&inner.dram_space, page, state32) {
				Some(entry) if entry.state == state32 => {
					// already added in the current transaction; this happens
					// after cache overflow and a later mutation of the page
					inner.page_io.write(entry.phys, chunk)?;
					inner.sparse.log_page(&mut inner.dram_space, page, state32);
				}
				_ => {
					let phys = inner.page_io.append(chunk)?;
					inner.sparse.insert(
						&mut inner.dram_space,
						crate::index::sparse::SparseEntry {
							page,
							state: state32,
							phys,
							page_type: PageType::Fixed,
						},
					);
				}
			}
		}
		Ok(())
	}

	/// Write one page as a diff against its previous version. `diffs` lists
	/// alternating `(changed, unchanged)` run lengths from the page start.
	/// Falls back to a full write when the encoding does not pay off, the
	/// run chain grows past `max_len`, or no base page exists.
	pub fn write_diffs(
		&self,
		address: u64,
		state: u64,
		buf: &[u8],
		diffs: &[(u16, u16)],
		max_len: Option<usize>,
	) -> Result<(), StorageError> {
		let page_size = self.config.page_size as usize;
		if buf.len() != page_size {
			return Err(StorageError::InvalidArgument(
				"write_diffs: diff writes cover exactly one page".to_string(),
			));
		}
		self.check_range(address, buf.len(), "write_diffs")?;
		if self.access == AccessType::ReadOnly {
			return Err(StorageError::ReadOnly);
		}
		let state32 = state_u32(state)?;
		let max_len = max_len.unwrap_or(self.max_diff_run);
		let page = address / page_size as u64;

		let encoded = encode_diff_page(buf, diffs, page_size);
		{
			let mut inner = self.inner.lock();
			let inner = &mut *inner;
			let base = inner.sparse.lookup(&inner.dram_space, page, state32);
			if let (Some(base), Some(encoded)) = (base, encoded) {
				if base.state < state32 {
					let run_len =
						inner
							.diff
							.peek_run_len(&inner.dram_space, page, state32, base.state);
					if run_len < max_len {
						let phys = inner.page_io.append(&encoded)?;
						inner
							.diff
							.insert(&mut inner.dram_space, page, state32, phys, base.state);
						inner.sparse.log_page(&mut inner.dram_space, page, state32);
						return Ok(());
					}
				}
			}
		}
		self.write(address, state, buf)
	}

	/// State of the newest mutation of `page` visible at `state`.
	pub fn try_find_mutation(&self, page: u64, state: u64) -> Result<Option<u64>, StorageError> {
		let inner = self.inner.lock();
		Ok(inner
			.sparse
			.lookup(&inner.dram_space, page, state_u32(state)?)
			.map(|entry| entry.state as u64))
	}

	pub fn find_mutation(&self, page: u64, state: u64) -> Result<u64, StorageError> {
		self.try_find_mutation(page, state)?
			.ok_or(StorageError::PageNotFound { page, state })
	}

	/// Publish all pending modifications. Returns `false` when there was
	/// nothing to flush.
	pub fn flush(&self) -> Result<bool, StorageError> {
		if self.access == AccessType::ReadOnly {
			return Err(StorageError::ReadOnly);
		}
		let mut inner = self.inner.lock();
		let inner = &mut *inner;
		if inner.sparse.change_log_len() == 0 {
			return Ok(false);
		}

		// data pages are already on disk; publish the index, then the DRAM
		// pages, then their change log, then make it all durable
		inner.sparse.extract_change_log(&mut inner.dp_changelog)?;
		let state = inner.sparse.max_state() as u64;
		inner
			.dram_stream
			.flush_updates(state, &mut inner.dram_space, &mut inner.dram_changelog)?;
		self.file.sync()?;
		Ok(true)
	}

	/// Apply changes published by a writer (read-only storages). Invokes
	/// `on_page_updated(page, state)` for every mutated page and keeps
	/// draining until the change logs are exhausted.
	pub fn refresh(
		&self,
		mut on_page_updated: impl FnMut(u64, u64),
	) -> Result<u64, StorageError> {
		if self.access != AccessType::ReadOnly {
			return Err(StorageError::InvalidArgument(
				"refresh allowed only in read-only mode".to_string(),
			));
		}
		let mut inner = self.inner.lock();
		let inner = &mut *inner;

		loop {
			if inner
				.dram_stream
				.apply_changes(&mut inner.dram_space, &mut inner.dram_changelog)?
			{
				inner.dram_space.take_dirty();
				inner.sparse.refresh(&inner.dram_space);
				inner.diff.refresh(&inner.dram_space);
			}
			while let Some(chunk) = inner.dp_changelog.read_change_log_chunk()? {
				// first element is the updated state number
				let state = chunk[0];
				for &page in &chunk[1..] {
					on_page_updated(page, state);
				}
			}
			if !inner.dram_changelog.refresh()? {
				break;
			}
		}
		Ok(self.file.last_modified()?)
	}

	pub fn max_state(&self) -> u64 {
		self.inner.lock().sparse.max_state() as u64
	}

	pub fn last_updated(&self) -> Result<u64, StorageError> {
		Ok(self.file.last_modified()?)
	}

	pub fn stats(&self, mut callback: impl FnMut(&str, u64)) {
		let inner = self.inner.lock();
		let (bytes_read, bytes_written) = self.file.io_bytes();
		callback("file_bytes_read", bytes_read);
		callback("file_bytes_written", bytes_written);
		callback(
			"dram_prefix_size",
			inner.dram_space.page_count() * self.config.dram_page_size as u64,
		);
		callback(
			"dp_size_total",
			inner.sparse.len(&inner.dram_space) as u64 * self.config.page_size as u64,
		);
		if let Ok(len) = self.file.len() {
			callback("prefix_size", len);
		}
	}

	pub fn close(&self) -> Result<(), StorageError> {
		if self.access == AccessType::ReadWrite {
			self.flush()?;
		}
		Ok(())
	}
}

fn state_u32(state: u64) -> Result<u32, StorageError> {
	u32::try_from(state)
		.map_err(|_| StorageError::InvalidArgument(format!("state number {state} out of range")))
}

/// Diff page layout: `run_count: u16`, then `(changed, unchanged): (u16,
/// u16)` runs, then the changed bytes in order. Returns `None` when the
/// encoding does not fit one page.
fn encode_diff_page(buf: &[u8], diffs: &[(u16, u16)], page_size: usize) -> Option<Vec<u8>> {
	let covered: usize = diffs
		.iter()
		.map(|(changed, unchanged)| *changed as usize + *unchanged as usize)
		.sum();
	let diff_bytes: usize = diffs.iter().map(|(changed, _)| *changed as usize).sum();
	let encoded_size = 2 + diffs.len() * 4 + diff_bytes;
	if diffs.is_empty() || covered > buf.len() || encoded_size >= page_size {
		return None;
	}

	let mut encoded = Vec::with_capacity(page_size);
	encoded.extend_from_slice(&(diffs.len() as u16).to_le_bytes());
	for (changed, unchanged) in diffs {
		encoded.extend_from_slice(&changed.to_le_bytes());
		encoded.extend_from_slice(&unchanged.to_le_bytes());
	}
	let mut offset = 0_usize;
	for (changed, unchanged) in diffs {
		encoded.extend_from_slice(&buf[offset..offset + *changed as usize]);
		offset += *changed as usize + *unchanged as usize;
	}
	encoded.resize(page_size, 0);
	Some(encoded)
}

fn apply_diff_page(diff_page: &[u8], target: &mut [u8]) -> Result<(), StorageError> {
	let run_count = u16::from_le_bytes(diff_page[0..2].try_into().unwrap()) as usize;
	let runs_end = 2 + run_count * 4;
	if runs_end > diff_page.len() {
		return Err(StorageError::Internal(
			"diff page header out of bounds".to_string(),
		));
	}
	let mut data_offset = runs_end;
	let mut target_offset = 0_usize;
	for run in 0..run_count {
		let base = 2 + run * 4;
		let changed = u16::from_le_bytes(diff_page[base..base + 2].try_into().unwrap()) as usize;
		let unchanged =
			u16::from_le_bytes(diff_page[base + 2..base + 4].try_into().unwrap()) as usize;
		if data_offset + changed > diff_page.len() || target_offset + changed > target.len() {
			return Err(StorageError::Internal(
				"diff page runs out of bounds".to_string(),
			));
		}
		target[target_offset..target_offset + changed]
			.copy_from_slice(&diff_page[data_offset..data_offset + changed]);
		data_offset += changed;
		target_offset += changed + unchanged;
	}
	Ok(())
}
