use std::sync::Arc;

use super::{BlockAllocator, FileBacking, FileError, PrefixFile, CONFIG_BLOCK_SIZE};

/// Organizes file data into blocks of fixed-size pages. Pages are identified
/// by absolute numbers derived from their block's file position, which makes
/// address calculation a single multiply.
pub(crate) struct PageIo<F: FileBacking> {
	file: Arc<PrefixFile<F>>,
	allocator: Arc<BlockAllocator>,
	page_size: u32,
	block_capacity: u32,
	// begin address of the current block (0 before the first allocation)
	address: u64,
	// pages already stored in the current block
	page_count: u32,
	// number of the first page in the current block
	first_page_num: u64,
	writable: bool,
}

impl<F: FileBacking> PageIo<F> {
	/// Read/write stream resuming after `next_page_hint` (the next physical
	/// page number the sparse index expects to be assigned).
	pub fn new_writer(
		file: Arc<PrefixFile<F>>,
		allocator: Arc<BlockAllocator>,
		page_size: u32,
		next_page_hint: u64,
	) -> Self {
		let block_size = allocator.block_size();
		assert_eq!(block_size % page_size as u64, 0);
		let block_capacity = (block_size / page_size as u64) as u32;

		if next_page_hint == 0 {
			// force a block allocation on the first append
			return Self {
				file,
				allocator,
				page_size,
				block_capacity,
				address: 0,
				page_count: block_capacity,
				first_page_num: 0,
				writable: true,
			};
		}

		let block_id = (next_page_hint * page_size as u64) / block_size;
		let mut address = CONFIG_BLOCK_SIZE + block_id * block_size;
		let mut page_count = (next_page_hint % block_capacity as u64) as u32;
		// position at the end of the last existing block
		if page_count == 0 {
			address -= block_size;
			page_count = block_capacity;
		}
		let first_page_num = (address - CONFIG_BLOCK_SIZE) / block_size * block_capacity as u64;

		Self {
			file,
			allocator,
			page_size,
			block_capacity,
			address,
			page_count,
			first_page_num,
			writable: true,
		}
	}

	pub fn new_reader(
		file: Arc<PrefixFile<F>>,
		allocator: Arc<BlockAllocator>,
		page_size: u32,
	) -> Self {
		let block_capacity = (allocator.block_size() / page_size as u64) as u32;
		Self {
			file,
			allocator,
			page_size,
			block_capacity,
			address: 0,
			page_count: 0,
			first_page_num: 0,
			writable: false,
		}
	}

	fn page_offset(&self, page_num: u64) -> u64 {
		CONFIG_BLOCK_SIZE + page_num * self.page_size as u64
	}

	fn allocate_next_block(&mut self) {
		self.address = self.allocator.alloc_block();
		self.first_page_num = (self.address - CONFIG_BLOCK_SIZE) / self.allocator.block_size()
			* self.block_capacity as u64;
		self.page_count = 0;
	}

	/// Append a new page, returning its physical page number.
	pub fn append(&mut self, buffer: &[u8]) -> Result<u64, FileError> {
		assert!(self.writable);
		assert_eq!(buffer.len(), self.page_size as usize);
		if self.page_count == self.block_capacity {
			self.allocate_next_block();
		}

		self.file.write_at(
			self.address + self.page_count as u64 * self.page_size as u64,
			buffer,
		)?;
		let page_num = self.first_page_num + self.page_count as u64;
		self.page_count += 1;
		Ok(page_num)
	}

	pub fn read(&self, page_num: u64, buffer: &mut [u8]) -> Result<(), FileError> {
		assert_eq!(buffer.len(), self.page_size as usize);
		self.file.read_at(self.page_offset(page_num), buffer)
	}

	/// Overwrite an existing page (same-transaction copy-on-write only).
	pub fn write(&self, page_num: u64, buffer: &[u8]) -> Result<(), FileError> {
		assert!(self.writable);
		assert_eq!(buffer.len(), self.page_size as usize);
		self.file.write_at(self.page_offset(page_num), buffer)
	}

	pub fn page_size(&self) -> u32 {
		self.page_size
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use super::*;
	use crate::files::PrefixConfig;

	const PAGE_SIZE: u32 = 64;
	const BLOCK_SIZE: u64 = 256;

	fn test_file() -> Arc<PrefixFile<Cursor<Vec<u8>>>> {
		let config = PrefixConfig {
			block_size: BLOCK_SIZE as u32,
			page_size: PAGE_SIZE,
			dram_page_size: 64,
			dram_io_offset: CONFIG_BLOCK_SIZE,
			wal_offset: 0,
			dram_changelog_offset: 0,
			dp_changelog_offset: 0,
		};
		Arc::new(PrefixFile::create(Cursor::new(Vec::new()), config).unwrap())
	}

	#[test]
	fn append_assigns_sequential_page_numbers() {
		// given
		let file = test_file();
		let allocator = Arc::new(BlockAllocator::new(CONFIG_BLOCK_SIZE, BLOCK_SIZE));
		let mut io = PageIo::new_writer(Arc::clone(&file), allocator, PAGE_SIZE, 0);

		// when: six pages span two blocks of four
		let pages: Vec<u64> = (0..6)
			.map(|i| io.append(&[i as u8; PAGE_SIZE as usize]).unwrap())
			.collect();

		// then
		assert_eq!(pages, vec![0, 1, 2, 3, 4, 5]);
		let mut buf = [0_u8; PAGE_SIZE as usize];
		io.read(5, &mut buf).unwrap();
		assert_eq!(buf, [5; PAGE_SIZE as usize]);
	}

	#[test]
	fn writer_resumes_from_page_hint() {
		// given
		let file = test_file();
		let allocator = Arc::new(BlockAllocator::new(CONFIG_BLOCK_SIZE, BLOCK_SIZE));
		let mut io = PageIo::new_writer(Arc::clone(&file), Arc::clone(&allocator), PAGE_SIZE, 0);
		for i in 0..3_u8 {
			io.append(&[i; PAGE_SIZE as usize]).unwrap();
		}

		// when: a fresh writer resumes after page 2 inside the same block
		let mut resumed = PageIo::new_writer(Arc::clone(&file), allocator, PAGE_SIZE, 3);
		let page = resumed.append(&[9; PAGE_SIZE as usize]).unwrap();

		// then
		assert_eq!(page, 3);
		let mut buf = [0_u8; PAGE_SIZE as usize];
		resumed.read(2, &mut buf).unwrap();
		assert_eq!(buf, [2; PAGE_SIZE as usize]);
	}

	#[test]
	fn in_place_write_overwrites_page() {
		// given
		let file = test_file();
		let allocator = Arc::new(BlockAllocator::new(CONFIG_BLOCK_SIZE, BLOCK_SIZE));
		let mut io = PageIo::new_writer(Arc::clone(&file), allocator, PAGE_SIZE, 0);
		let page = io.append(&[1; PAGE_SIZE as usize]).unwrap();

		// when
		io.write(page, &[2; PAGE_SIZE as usize]).unwrap();

		// then
		let mut buf = [0_u8; PAGE_SIZE as usize];
		io.read(page, &mut buf).unwrap();
		assert_eq!(buf, [2; PAGE_SIZE as usize]);
	}
}
