use std::sync::Arc;

use super::{block::BlockStream, BlockAllocator, FileBacking, FileError, PrefixFile};

// chunk encodings; the RLE-compressed form is reserved
const FORMAT_PLAIN: u8 = 0;

/// A [`BlockStream`] specialization collecting change logs as separate
/// chunks. The first element of every chunk is the state number, the rest
/// are the affected page numbers (or chunk addresses, for the DRAM log).
///
/// Checksums are always enabled for change-log streams.
pub(crate) struct ChangeLogStream<F: FileBacking> {
	stream: BlockStream<F>,
}

impl<F: FileBacking> ChangeLogStream<F> {
	pub fn new(
		file: Arc<PrefixFile<F>>,
		allocator: Arc<BlockAllocator>,
		first_block: u64,
		block_size: u64,
	) -> Self {
		Self {
			stream: BlockStream::new(file, allocator, first_block, block_size, true),
		}
	}

	/// Encode and append one change-log chunk.
	pub fn append_change_log(&mut self, entries: &[u64]) -> Result<u64, FileError> {
		assert!(!entries.is_empty(), "change log chunks cannot be empty");
		let mut payload = Vec::with_capacity(5 + entries.len() * 8);
		payload.push(FORMAT_PLAIN);
		payload.extend_from_slice(&(entries.len() as u32).to_le_bytes());
		for entry in entries {
			payload.extend_from_slice(&entry.to_le_bytes());
		}
		self.stream.append_chunk(&payload)
	}

	/// Read a single change-log chunk, or `None` at the end of the stream.
	pub fn read_change_log_chunk(&mut self) -> Result<Option<Vec<u64>>, FileError> {
		let Some(payload) = self.stream.read_chunk()? else {
			return Ok(None);
		};
		if payload.len() < 5 {
			return Err(FileError::Corrupted(
				"Change log chunk shorter than its header".to_string(),
			));
		}
		if payload[0] != FORMAT_PLAIN {
			return Err(FileError::Corrupted(format!(
				"Unknown change log format {}",
				payload[0]
			)));
		}
		let count = u32::from_le_bytes(payload[1..5].try_into().unwrap()) as usize;
		if payload.len() != 5 + count * 8 {
			return Err(FileError::Corrupted(
				"Change log chunk length mismatch".to_string(),
			));
		}
		let entries = payload[5..]
			.chunks_exact(8)
			.map(|bytes| u64::from_le_bytes(bytes.try_into().unwrap()))
			.collect();
		Ok(Some(entries))
	}

	/// Exhaust all pending chunks (writer-side open).
	pub fn drain(&mut self) -> Result<(), FileError> {
		while self.read_change_log_chunk()?.is_some() {}
		Ok(())
	}

	pub fn seek_to_end(&mut self) -> Result<(), FileError> {
		self.stream.seek_to_end()
	}

	pub fn refresh(&mut self) -> Result<bool, FileError> {
		self.stream.refresh()
	}
}
