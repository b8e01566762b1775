use std::sync::Arc;

use crc::Crc;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use super::{BlockAllocator, FileBacking, FileError, PrefixFile};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

const BLOCK_HEADER_SIZE: u64 = 8;

#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct BlockHeaderRepr {
	next_block: u64,
}

#[derive(Debug, Clone, FromZeroes, FromBytes, AsBytes)]
#[repr(C)]
struct ChunkHeaderRepr {
	size: u32,
	checksum: u32,
}

/// Variable-length chunks inside fixed-size blocks. Blocks are chained by a
/// leading next-block link and allocated from the shared [`BlockAllocator`]
/// when a chunk does not fit the remainder of the current block.
///
/// Readers stop at the first zero-size marker, truncated tail or checksum
/// failure (last-chunk-atomic).
pub(crate) struct BlockStream<F: FileBacking> {
	file: Arc<PrefixFile<F>>,
	allocator: Arc<BlockAllocator>,
	block_size: u64,
	checksums: bool,
	// append position
	write_block: u64,
	write_offset: u64,
	// read position
	read_block: u64,
	read_offset: u64,
}

impl<F: FileBacking> BlockStream<F> {
	pub fn new(
		file: Arc<PrefixFile<F>>,
		allocator: Arc<BlockAllocator>,
		first_block: u64,
		block_size: u64,
		checksums: bool,
	) -> Self {
		Self {
			file,
			allocator,
			block_size,
			checksums,
			write_block: first_block,
			write_offset: BLOCK_HEADER_SIZE,
			read_block: first_block,
			read_offset: BLOCK_HEADER_SIZE,
		}
	}

	fn chunk_header_size(&self) -> u64 {
		if self.checksums {
			8
		} else {
			4
		}
	}

	pub fn max_payload_size(&self) -> usize {
		(self.block_size - BLOCK_HEADER_SIZE - self.chunk_header_size()) as usize
	}

	/// Combined per-chunk and per-block framing overhead.
	pub fn size_of_headers(checksums: bool) -> usize {
		(BLOCK_HEADER_SIZE + if checksums { 8 } else { 4 }) as usize
	}

	fn read_block_link(&self, block_addr: u64) -> Result<u64, FileError> {
		let mut repr = BlockHeaderRepr::new_zeroed();
		match self.file.read_at(block_addr, repr.as_bytes_mut()) {
			Ok(()) => Ok(repr.next_block),
			Err(FileError::UnexpectedEof) => Ok(0),
			Err(err) => Err(err),
		}
	}

	fn write_block_link(&self, block_addr: u64, next_block: u64) -> Result<(), FileError> {
		let repr = BlockHeaderRepr { next_block };
		self.file.write_at(block_addr, repr.as_bytes())
	}

	/// Append a chunk, returning the file address of its header.
	pub fn append_chunk(&mut self, payload: &[u8]) -> Result<u64, FileError> {
		assert!(
			payload.len() <= self.max_payload_size(),
			"chunk exceeds block capacity"
		);
		let needed = self.chunk_header_size() + payload.len() as u64;
		if self.write_offset + needed > self.block_size {
			// seal this block with a terminator and chain a fresh one
			self.write_terminator()?;
			let next = self.allocator.alloc_block();
			self.write_block_link(self.write_block, next)?;
			self.write_block_link(next, 0)?;
			self.write_block = next;
			self.write_offset = BLOCK_HEADER_SIZE;
		}

		let chunk_addr = self.write_block + self.write_offset;
		self.write_chunk_at(chunk_addr, payload)?;
		self.write_offset += needed;
		// terminate the stream after the new chunk (overwritten by the next append)
		self.write_terminator()?;
		Ok(chunk_addr)
	}

	/// Overwrite an existing chunk in place. The payload size must match the
	/// size recorded at `chunk_addr`.
	pub fn overwrite_chunk(&self, chunk_addr: u64, payload: &[u8]) -> Result<(), FileError> {
		let mut repr = ChunkHeaderRepr::new_zeroed();
		let header_bytes = &mut repr.as_bytes_mut()[..self.chunk_header_size() as usize];
		self.file.read_at(chunk_addr, header_bytes)?;
		if repr.size as usize != payload.len() {
			return Err(FileError::Corrupted(format!(
				"Chunk overwrite size mismatch: {} != {}",
				repr.size,
				payload.len()
			)));
		}
		self.write_chunk_at(chunk_addr, payload)
	}

	fn write_chunk_at(&self, chunk_addr: u64, payload: &[u8]) -> Result<(), FileError> {
		let header = ChunkHeaderRepr {
			size: payload.len() as u32,
			checksum: if self.checksums {
				CRC32.checksum(payload)
			} else {
				0
			},
		};
		let mut buf = Vec::with_capacity(self.chunk_header_size() as usize + payload.len());
		buf.extend_from_slice(&header.as_bytes()[..self.chunk_header_size() as usize]);
		buf.extend_from_slice(payload);
		self.file.write_at(chunk_addr, &buf)
	}

	fn write_terminator(&self) -> Result<(), FileError> {
		let pos = self.write_block + self.write_offset;
		if pos + 4 <= self.write_block + self.block_size {
			self.file.write_at(pos, &0_u32.to_le_bytes())?;
		}
		Ok(())
	}

	/// Read the next chunk, or `None` when the readable stream ends. The read
	/// position is retained so the stream can be resumed after [`refresh`].
	pub fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, FileError> {
		loop {
			if self.read_offset + self.chunk_header_size() > self.block_size {
				if !self.advance_read_block()? {
					return Ok(None);
				}
				continue;
			}
			let mut repr = ChunkHeaderRepr::new_zeroed();
			let header_bytes = &mut repr.as_bytes_mut()[..self.chunk_header_size() as usize];
			match self
				.file
				.read_at(self.read_block + self.read_offset, header_bytes)
			{
				Ok(()) => (),
				Err(FileError::UnexpectedEof) => return Ok(None),
				Err(err) => return Err(err),
			}
			if repr.size == 0 {
				// terminator: follow the block link if one exists
				if !self.advance_read_block()? {
					return Ok(None);
				}
				continue;
			}
			if self.read_offset + self.chunk_header_size() + repr.size as u64 > self.block_size {
				// stale header crossing the block boundary
				return Ok(None);
			}

			let mut payload = vec![0_u8; repr.size as usize];
			match self.file.read_at(
				self.read_block + self.read_offset + self.chunk_header_size(),
				&mut payload,
			) {
				Ok(()) => (),
				Err(FileError::UnexpectedEof) => return Ok(None),
				Err(err) => return Err(err),
			}
			if self.checksums && CRC32.checksum(&payload) != repr.checksum {
				// torn trailing chunk, stop here
				return Ok(None);
			}
			self.read_offset += self.chunk_header_size() + repr.size as u64;
			return Ok(Some(payload));
		}
	}

	/// Read the chunk stored at a known header address, independent of the
	/// sequential read position.
	pub fn read_chunk_at(&self, chunk_addr: u64) -> Result<Vec<u8>, FileError> {
		let mut repr = ChunkHeaderRepr::new_zeroed();
		let header_bytes = &mut repr.as_bytes_mut()[..self.chunk_header_size() as usize];
		self.file.read_at(chunk_addr, header_bytes)?;
		if repr.size == 0 {
			return Err(FileError::Corrupted(
				"Empty chunk at a recorded chunk address".to_string(),
			));
		}
		let mut payload = vec![0_u8; repr.size as usize];
		self.file
			.read_at(chunk_addr + self.chunk_header_size(), &mut payload)?;
		if self.checksums && CRC32.checksum(&payload) != repr.checksum {
			return Err(FileError::ChecksumMismatch);
		}
		Ok(payload)
	}

	fn advance_read_block(&mut self) -> Result<bool, FileError> {
		let next = self.read_block_link(self.read_block)?;
		if next == 0 {
			return Ok(false);
		}
		self.read_block = next;
		self.read_offset = BLOCK_HEADER_SIZE;
		Ok(true)
	}

	/// Probe whether more chunks became readable since the last read attempt.
	pub fn refresh(&mut self) -> Result<bool, FileError> {
		let saved = (self.read_block, self.read_offset);
		let available = self.read_chunk()?.is_some();
		(self.read_block, self.read_offset) = saved;
		Ok(available)
	}

	/// Exhaust the readable stream, positioning the writer after the last
	/// chunk. Used when opening an existing stream for appending.
	pub fn seek_to_end(&mut self) -> Result<(), FileError> {
		while self.read_chunk()?.is_some() {}
		self.write_block = self.read_block;
		self.write_offset = self.read_offset;
		Ok(())
	}
}
