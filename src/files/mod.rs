use std::{
	convert::Infallible,
	fs::{File, OpenOptions},
	io::{self, Cursor, Read, Seek, SeekFrom, Write},
	path::Path,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::repr::Serialized;

pub(crate) mod block;
pub(crate) mod changelog;
pub(crate) mod dram;
pub(crate) mod page_io;

/// All prefix configuration must fit into this leading block.
pub(crate) const CONFIG_BLOCK_SIZE: u64 = 4096;

const MAGIC: u64 = 0x0DB0_DB0D_B0DB_0DB0;
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum FileError {
	#[error("The file is not a hazel prefix file")]
	MissingMagic,

	#[error("Incompatible prefix file version: {0}")]
	IncompatibleVersion(u32),

	#[error("The file is corrupted: {0}")]
	Corrupted(String),

	#[error("The file is corrupted; a checksum mismatch occurred")]
	ChecksumMismatch,

	#[error("Unexpected end of file")]
	UnexpectedEof,

	#[error("The prefix file is opened read-only")]
	ReadOnly,

	#[error(transparent)]
	Io(io::Error),
}

impl From<io::Error> for FileError {
	fn from(value: io::Error) -> Self {
		match value.kind() {
			io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
			_ => Self::Io(value),
		}
	}
}

impl From<Infallible> for FileError {
	fn from(value: Infallible) -> Self {
		match value {}
	}
}

#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
pub(crate) struct PrefixConfigRepr {
	magic: u64,
	version: u32,
	block_size: u32,
	page_size: u32,
	dram_page_size: u32,
	dram_io_offset: u64,
	wal_offset: u64,
	dram_changelog_offset: u64,
	dp_changelog_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PrefixConfig {
	pub block_size: u32,
	pub page_size: u32,
	pub dram_page_size: u32,
	pub dram_io_offset: u64,
	pub wal_offset: u64,
	pub dram_changelog_offset: u64,
	pub dp_changelog_offset: u64,
}

impl From<PrefixConfig> for PrefixConfigRepr {
	fn from(value: PrefixConfig) -> Self {
		Self {
			magic: MAGIC,
			version: FORMAT_VERSION,
			block_size: value.block_size,
			page_size: value.page_size,
			dram_page_size: value.dram_page_size,
			dram_io_offset: value.dram_io_offset,
			wal_offset: value.wal_offset,
			dram_changelog_offset: value.dram_changelog_offset,
			dp_changelog_offset: value.dp_changelog_offset,
		}
	}
}

impl TryFrom<PrefixConfigRepr> for PrefixConfig {
	type Error = FileError;

	fn try_from(value: PrefixConfigRepr) -> Result<Self, Self::Error> {
		if value.magic != MAGIC {
			return Err(FileError::MissingMagic);
		}
		if value.version != FORMAT_VERSION {
			return Err(FileError::IncompatibleVersion(value.version));
		}
		Ok(Self {
			block_size: value.block_size,
			page_size: value.page_size,
			dram_page_size: value.dram_page_size,
			dram_io_offset: value.dram_io_offset,
			wal_offset: value.wal_offset,
			dram_changelog_offset: value.dram_changelog_offset,
			dp_changelog_offset: value.dp_changelog_offset,
		})
	}
}

impl Serialized for PrefixConfig {
	type Repr = PrefixConfigRepr;
}

/// Backing byte container of a prefix file. Real prefixes use [`File`];
/// tests use in-memory cursors.
pub trait FileBacking: Seek + Read + Write + Send + 'static {
	fn sync(&mut self) -> io::Result<()> {
		Ok(())
	}

	fn last_modified(&self) -> io::Result<SystemTime> {
		Ok(UNIX_EPOCH)
	}
}

impl FileBacking for File {
	fn sync(&mut self) -> io::Result<()> {
		self.sync_data()
	}

	fn last_modified(&self) -> io::Result<SystemTime> {
		self.metadata()?.modified()
	}
}

impl FileBacking for Cursor<Vec<u8>> {}

/// The single-file container of one prefix, offering positional IO.
#[derive(Debug)]
pub(crate) struct PrefixFile<F: FileBacking = File> {
	file: Mutex<F>,
	read_only: bool,
	// counters surfaced through Storage::stats
	bytes_read: AtomicU64,
	bytes_written: AtomicU64,
}

assert_impl_all!(PrefixFile: Send, Sync);

impl PrefixFile<File> {
	pub fn create_file(path: impl AsRef<Path>, config: PrefixConfig) -> Result<Self, FileError> {
		let file = OpenOptions::new()
			.create(true)
			.truncate(true)
			.read(true)
			.write(true)
			.open(path)?;
		Self::create(file, config)
	}

	pub fn open_file(path: impl AsRef<Path>, read_only: bool) -> Result<Self, FileError> {
		let file = OpenOptions::new()
			.read(true)
			.write(!read_only)
			.open(path)?;
		Self::open(file, read_only)
	}
}

impl<F: FileBacking> PrefixFile<F> {
	pub fn create(mut file: F, config: PrefixConfig) -> Result<Self, FileError> {
		let mut block = vec![0_u8; CONFIG_BLOCK_SIZE as usize];
		config.write_repr_bytes(&mut block);
		file.seek(SeekFrom::Start(0))?;
		file.write_all(&block)?;
		Ok(Self::new(file, false))
	}

	pub fn open(file: F, read_only: bool) -> Result<Self, FileError> {
		let this = Self::new(file, read_only);
		// validate the config block eagerly
		this.read_config()?;
		Ok(this)
	}

	fn new(file: F, read_only: bool) -> Self {
		Self {
			file: Mutex::new(file),
			read_only,
			bytes_read: AtomicU64::new(0),
			bytes_written: AtomicU64::new(0),
		}
	}

	pub fn read_config(&self) -> Result<PrefixConfig, FileError> {
		let mut buf = vec![0_u8; PrefixConfig::REPR_SIZE];
		self.read_at(0, &mut buf)?;
		PrefixConfig::from_repr_bytes(&buf)
	}

	pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), FileError> {
		let mut file = self.file.lock();
		file.seek(SeekFrom::Start(offset))?;
		file.read_exact(buf)?;
		self.bytes_read
			.fetch_add(buf.len() as u64, Ordering::Relaxed);
		Ok(())
	}

	pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), FileError> {
		if self.read_only {
			return Err(FileError::ReadOnly);
		}
		let mut file = self.file.lock();
		file.seek(SeekFrom::Start(offset))?;
		file.write_all(buf)?;
		self.bytes_written
			.fetch_add(buf.len() as u64, Ordering::Relaxed);
		Ok(())
	}

	pub fn len(&self) -> Result<u64, FileError> {
		let mut file = self.file.lock();
		Ok(file.seek(SeekFrom::End(0))?)
	}

	pub fn sync(&self) -> Result<(), FileError> {
		let mut file = self.file.lock();
		file.sync()?;
		Ok(())
	}

	/// Last-modified stamp in nanoseconds since the epoch.
	pub fn last_modified(&self) -> Result<u64, FileError> {
		let file = self.file.lock();
		let modified = file.last_modified()?;
		let nanos = modified
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_nanos();
		Ok(nanos as u64)
	}

	pub fn is_read_only(&self) -> bool {
		self.read_only
	}

	pub fn io_bytes(&self) -> (u64, u64) {
		(
			self.bytes_read.load(Ordering::Relaxed),
			self.bytes_written.load(Ordering::Relaxed),
		)
	}
}

/// Hands out block-aligned file regions at the current tail. Shared by all
/// streams of one prefix so their blocks never overlap.
pub(crate) struct BlockAllocator {
	next: AtomicU64,
	block_size: u64,
}

impl BlockAllocator {
	pub fn new(next: u64, block_size: u64) -> Self {
		debug_assert!(next >= CONFIG_BLOCK_SIZE);
		Self {
			next: AtomicU64::new(next),
			block_size,
		}
	}

	/// Compute the allocator position from an opened file's length.
	pub fn from_file_len(len: u64, block_size: u64) -> Self {
		let used = len.saturating_sub(CONFIG_BLOCK_SIZE);
		let blocks = used.div_ceil(block_size);
		Self::new(CONFIG_BLOCK_SIZE + blocks * block_size, block_size)
	}

	pub fn alloc_block(&self) -> u64 {
		self.next.fetch_add(self.block_size, Ordering::SeqCst)
	}

	pub fn tail(&self) -> u64 {
		self.next.load(Ordering::SeqCst)
	}

	/// Advance past a region observed in the file (e.g. after a refresh).
	pub fn observe(&self, end: u64) {
		let blocks = end.saturating_sub(CONFIG_BLOCK_SIZE).div_ceil(self.block_size);
		let aligned = CONFIG_BLOCK_SIZE + blocks * self.block_size;
		self.next.fetch_max(aligned, Ordering::SeqCst);
	}

	pub fn block_size(&self) -> u64 {
		self.block_size
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_config() -> PrefixConfig {
		PrefixConfig {
			block_size: 8192,
			page_size: 4096,
			dram_page_size: 4096,
			dram_io_offset: CONFIG_BLOCK_SIZE,
			wal_offset: CONFIG_BLOCK_SIZE + 8192,
			dram_changelog_offset: CONFIG_BLOCK_SIZE + 2 * 8192,
			dp_changelog_offset: CONFIG_BLOCK_SIZE + 3 * 8192,
		}
	}

	#[test]
	fn create_and_reopen() {
		// given
		let file = PrefixFile::create(Cursor::new(Vec::new()), test_config()).unwrap();

		// when
		let config = file.read_config().unwrap();

		// then
		assert_eq!(config, test_config());
	}

	#[test]
	fn try_open_with_missing_magic() {
		// given
		let data = vec![0_u8; CONFIG_BLOCK_SIZE as usize];

		// when
		let err = PrefixFile::open(Cursor::new(data), true).unwrap_err();

		// then
		assert_eq!(err.to_string(), "The file is not a hazel prefix file");
	}

	#[test]
	fn positional_io_roundtrip() {
		// given
		let file = PrefixFile::create(Cursor::new(Vec::new()), test_config()).unwrap();

		// when
		file.write_at(CONFIG_BLOCK_SIZE, &[1, 2, 3, 4]).unwrap();
		let mut buf = [0_u8; 4];
		file.read_at(CONFIG_BLOCK_SIZE, &mut buf).unwrap();

		// then
		assert_eq!(buf, [1, 2, 3, 4]);
	}

	#[test]
	fn write_to_read_only_file_fails() {
		// given
		let mut data = vec![0_u8; CONFIG_BLOCK_SIZE as usize];
		test_config().write_repr_bytes(&mut data);
		let file = PrefixFile::open(Cursor::new(data), true).unwrap();

		// when
		let result = file.write_at(CONFIG_BLOCK_SIZE, &[1]);

		// then
		assert!(matches!(result, Err(FileError::ReadOnly)));
	}

	#[test]
	fn block_allocator_hands_out_disjoint_blocks() {
		// given
		let alloc = BlockAllocator::new(CONFIG_BLOCK_SIZE, 8192);

		// when
		let b0 = alloc.alloc_block();
		let b1 = alloc.alloc_block();

		// then
		assert_eq!(b0, CONFIG_BLOCK_SIZE);
		assert_eq!(b1, CONFIG_BLOCK_SIZE + 8192);
		assert_eq!(alloc.tail(), CONFIG_BLOCK_SIZE + 2 * 8192);
	}

	#[test]
	fn block_allocator_from_partial_file() {
		// given a file whose last block is partially written
		let alloc = BlockAllocator::from_file_len(CONFIG_BLOCK_SIZE + 8192 + 17, 8192);

		// then the next block starts past the partial one
		assert_eq!(alloc.tail(), CONFIG_BLOCK_SIZE + 2 * 8192);
	}
}
