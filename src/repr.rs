use std::{
	io::{Read, Write},
	mem::size_of,
};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::files::FileError;

/// On-disk record glue: a native type with a zerocopy-backed
/// repr struct convertible in both directions.
pub(crate) trait Serialized: Sized
where
	FileError: From<<Self::Repr as TryInto<Self>>::Error>,
{
	type Repr: Clone + AsBytes + FromBytes + FromZeroes + From<Self> + TryInto<Self>;

	const REPR_SIZE: usize = size_of::<Self::Repr>();

	fn serialize(self, mut writer: impl Write) -> Result<(), FileError> {
		let repr = Self::Repr::from(self);
		writer.write_all(repr.as_bytes())?;
		Ok(())
	}

	fn deserialize(mut reader: impl Read) -> Result<Self, FileError> {
		let mut repr = Self::Repr::new_zeroed();
		reader.read_exact(repr.as_bytes_mut())?;
		let value: Self = repr.try_into()?;
		Ok(value)
	}

	fn from_repr_bytes(bytes: &[u8]) -> Result<Self, FileError> {
		let Some(repr) = Self::Repr::read_from_prefix(bytes) else {
			return Err(FileError::UnexpectedEof);
		};
		let value: Self = repr.try_into()?;
		Ok(value)
	}

	fn write_repr_bytes(self, bytes: &mut [u8]) {
		let repr = Self::Repr::from(self);
		bytes[0..Self::REPR_SIZE].copy_from_slice(repr.as_bytes());
	}
}
