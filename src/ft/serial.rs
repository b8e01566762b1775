#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};

use super::{
	and::FtAndIterator, andnot::FtAndNotIterator, index_iter::{FtIndexIterator, PostingList},
	or::FtOrIterator, Direction, FtError, FtIterator, FtIteratorType, FtKey, SIGNATURE_SIZE,
};

/// Resolves the identity of an inverted list to its posting data during
/// deserialization (a workspace / snapshot context). A dropped list resolves
/// to `None`, which deserializes the owning tree as absent.
#[cfg_attr(test, automock)]
pub trait IndexResolver<K: FtKey> {
	fn resolve(&self, index_key: u64) -> Option<PostingList<K>>;
}

impl<K: FtKey, F: Fn(u64) -> Option<PostingList<K>>> IndexResolver<K> for F {
	fn resolve(&self, index_key: u64) -> Option<PostingList<K>> {
		self(index_key)
	}
}

pub(crate) fn write_header(out: &mut Vec<u8>, serial_type: FtIteratorType, key_tag: u8) {
	out.extend_from_slice(&(serial_type as u16).to_le_bytes());
	out.push(key_tag);
}

/// Reader over a serialized iterator tree.
pub(crate) struct Reader<'a> {
	bytes: &'a [u8],
	offset: usize,
}

impl<'a> Reader<'a> {
	fn new(bytes: &'a [u8]) -> Self {
		Self { bytes, offset: 0 }
	}

	fn take(&mut self, len: usize) -> Result<&'a [u8], FtError> {
		let end = self.offset + len;
		let slice = self.bytes.get(self.offset..end).ok_or(FtError::UnexpectedEof)?;
		self.offset = end;
		Ok(slice)
	}

	fn read_u8(&mut self) -> Result<u8, FtError> {
		Ok(self.take(1)?[0])
	}

	fn read_u16(&mut self) -> Result<u16, FtError> {
		Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
	}

	fn read_u32(&mut self) -> Result<u32, FtError> {
		Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
	}

	fn read_u64(&mut self) -> Result<u64, FtError> {
		Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
	}

	fn read_direction(&mut self) -> Result<Direction, FtError> {
		let raw = self.read_u8()? as i8;
		Direction::from_i8(raw)
			.ok_or_else(|| FtError::Invalid(format!("invalid direction {raw}")))
	}

	fn read_key_tag<K: FtKey>(&mut self) -> Result<(), FtError> {
		let found = self.read_u8()?;
		if found != K::TYPE_TAG {
			return Err(FtError::KeyTypeMismatch {
				expected: K::TYPE_TAG,
				found,
			});
		}
		Ok(())
	}
}

/// Deserialize one iterator tree. Returns `Ok(None)` when a referenced
/// posting list no longer exists (a dropped token); structural problems are
/// errors.
pub fn deserialize_ft_iterator<K: FtKey>(
	resolver: &dyn IndexResolver<K>,
	bytes: &[u8],
) -> Result<Option<Box<dyn FtIterator<K>>>, FtError> {
	let mut reader = Reader::new(bytes);
	deserialize_node(resolver, &mut reader)
}

fn deserialize_node<K: FtKey>(
	resolver: &dyn IndexResolver<K>,
	reader: &mut Reader<'_>,
) -> Result<Option<Box<dyn FtIterator<K>>>, FtError> {
	let raw_type = reader.read_u16()?;
	let serial_type = FtIteratorType::from_u16(raw_type).ok_or(FtError::UnknownType(raw_type))?;
	reader.read_key_tag::<K>()?;

	match serial_type {
		FtIteratorType::Index => {
			let direction = reader.read_direction()?;
			let index_key = reader.read_u64()?;
			Ok(resolver.resolve(index_key).map(|list| {
				Box::new(FtIndexIterator::new(list, direction, index_key))
					as Box<dyn FtIterator<K>>
			}))
		}
		FtIteratorType::JoinAnd => {
			let unique_keys = reader.read_u8()? != 0;
			let direction = reader.read_direction()?;
			let children = deserialize_children(resolver, reader)?;
			Ok(children
				.map(|inner| {
					Box::new(FtAndIterator::new(inner, direction, unique_keys))
						as Box<dyn FtIterator<K>>
				}))
		}
		FtIteratorType::JoinOr => {
			let is_orx = reader.read_u8()? != 0;
			let direction = reader.read_direction()?;
			let children = deserialize_children(resolver, reader)?;
			Ok(children.map(|inner| {
				Box::new(FtOrIterator::new(inner, direction, is_orx)) as Box<dyn FtIterator<K>>
			}))
		}
		FtIteratorType::JoinAndNot => {
			let direction = reader.read_direction()?;
			let children = deserialize_children(resolver, reader)?;
			match children {
				Some(inner) => {
					if inner.is_empty() {
						return Err(FtError::Invalid(
							"AND-NOT requires at least one inner iterator".to_string(),
						));
					}
					Ok(Some(Box::new(FtAndNotIterator::new(inner, direction))
						as Box<dyn FtIterator<K>>))
				}
				None => Ok(None),
			}
		}
		FtIteratorType::Invalid | FtIteratorType::RangeTree => {
			Err(FtError::UnsupportedType(raw_type))
		}
	}
}

/// Read a length-prefixed child list. All children must parse; a single
/// missing child renders the whole list absent (while still consuming its
/// bytes).
fn deserialize_children<K: FtKey>(
	resolver: &dyn IndexResolver<K>,
	reader: &mut Reader<'_>,
) -> Result<Option<Vec<Box<dyn FtIterator<K>>>>, FtError> {
	let count = reader.read_u32()?;
	let mut children = Vec::with_capacity(count as usize);
	let mut complete = true;
	for _ in 0..count {
		match deserialize_node(resolver, reader)? {
			Some(child) => children.push(child),
			None => complete = false,
		}
	}
	Ok((complete && !children.is_empty()).then_some(children))
}

pub(crate) fn write_children<K: FtKey>(out: &mut Vec<u8>, children: &[Box<dyn FtIterator<K>>]) {
	out.extend_from_slice(&(children.len() as u32).to_le_bytes());
	for child in children {
		child.serialize(out);
	}
}

/// Signature of a leaf posting-list iterator.
pub(crate) fn leaf_signature(index_key: u64, out: &mut Vec<u8>) {
	let mut hasher = Sha256::new();
	hasher.update(b"INDEX");
	hasher.update(index_key.to_le_bytes());
	out.extend_from_slice(&hasher.finalize());
}

/// Sort fixed-size signatures stored back to back in `buf`.
pub(crate) fn sort_signatures(buf: &mut Vec<u8>) {
	debug_assert_eq!(buf.len() % SIGNATURE_SIZE, 0);
	let mut signatures: Vec<[u8; SIGNATURE_SIZE]> = buf
		.chunks_exact(SIGNATURE_SIZE)
		.map(|chunk| chunk.try_into().unwrap())
		.collect();
	signatures.sort_unstable();
	buf.clear();
	for signature in signatures {
		buf.extend_from_slice(&signature);
	}
}

/// Combine child signatures into a node signature: the smallest simple child
/// signature leads, non-simple signatures follow, the sorted whole is
/// hashed.
pub(crate) fn combine_signatures<K: FtKey>(
	tag: &[u8],
	children: &[&dyn FtIterator<K>],
	out: &mut Vec<u8>,
) {
	let mut buf = Vec::new();
	for child in children {
		if child.is_simple() {
			child.signature(&mut buf);
		}
	}
	sort_signatures(&mut buf);
	buf.truncate(SIGNATURE_SIZE.min(buf.len()));
	for child in children {
		if !child.is_simple() {
			child.signature(&mut buf);
		}
	}
	sort_signatures(&mut buf);

	let mut hasher = Sha256::new();
	hasher.update(tag);
	hasher.update(&buf);
	out.extend_from_slice(&hasher.finalize());
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::ft::collect_keys;

	fn resolver(lists: &[(u64, Vec<u64>)]) -> HashMap<u64, PostingList<u64>> {
		lists
			.iter()
			.map(|(key, keys)| (*key, PostingList::new(keys.clone())))
			.collect()
	}

	impl IndexResolver<u64> for HashMap<u64, PostingList<u64>> {
		fn resolve(&self, index_key: u64) -> Option<PostingList<u64>> {
			self.get(&index_key).cloned()
		}
	}

	fn index_iter(lists: &HashMap<u64, PostingList<u64>>, key: u64) -> Box<dyn FtIterator<u64>> {
		Box::new(FtIndexIterator::new(
			lists.get(&key).unwrap().clone(),
			Direction::Forward,
			key,
		))
	}

	#[test]
	fn round_trip_preserves_the_query_shape() {
		// given: AND(a, OR(b, c))
		let lists = resolver(&[(1, vec![1, 2, 3]), (2, vec![2, 3]), (3, vec![3, 4])]);
		let or = Box::new(FtOrIterator::new(
			vec![index_iter(&lists, 2), index_iter(&lists, 3)],
			Direction::Forward,
			false,
		));
		let and = FtAndIterator::new(
			vec![index_iter(&lists, 1), or],
			Direction::Forward,
			true,
		);
		let mut bytes = Vec::new();
		and.serialize(&mut bytes);

		// when
		let mut restored = deserialize_ft_iterator::<u64>(&lists, &bytes)
			.unwrap()
			.unwrap();

		// then
		assert!(restored.equal(and.as_dyn()));
		assert_eq!(collect_keys(restored.as_mut()), vec![2, 3]);
	}

	#[test]
	fn missing_posting_list_deserializes_as_none() {
		// given: a tree referencing list 9 which no longer exists
		let lists = resolver(&[(1, vec![1, 2]), (9, vec![5])]);
		let and = FtAndIterator::new(
			vec![index_iter(&lists, 1), index_iter(&lists, 9)],
			Direction::Forward,
			true,
		);
		let mut bytes = Vec::new();
		and.serialize(&mut bytes);

		// expect: the snapshot context no longer knows list 9
		let mut context = MockIndexResolver::<u64>::new();
		context
			.expect_resolve()
			.returning(|index_key| (index_key == 1).then(|| PostingList::new(vec![1, 2])));

		// when
		let restored = deserialize_ft_iterator::<u64>(&context, &bytes).unwrap();

		// then
		assert!(restored.is_none());
	}

	#[test]
	fn key_type_mismatch_is_an_error() {
		// given: a u64-keyed tree
		let lists = resolver(&[(1, vec![1])]);
		let mut bytes = Vec::new();
		index_iter(&lists, 1).serialize(&mut bytes);

		// when: deserializing with a pair key type
		let pair_resolver = MockIndexResolver::<(u64, u64)>::new();
		let result = deserialize_ft_iterator::<(u64, u64)>(&pair_resolver, &bytes);

		// then: the mismatch is detected before any list is resolved
		assert!(matches!(result, Err(FtError::KeyTypeMismatch { .. })));
	}

	#[test]
	fn truncated_input_is_an_error() {
		// given
		let lists = resolver(&[(1, vec![1])]);
		let mut bytes = Vec::new();
		index_iter(&lists, 1).serialize(&mut bytes);
		bytes.truncate(bytes.len() - 4);

		// then
		assert!(matches!(
			deserialize_ft_iterator::<u64>(&lists, &bytes),
			Err(FtError::UnexpectedEof)
		));
	}

	#[test]
	fn signatures_are_stable_across_equivalent_trees() {
		// given: the same AND with children in a different order
		let lists = resolver(&[(1, vec![1]), (2, vec![2])]);
		let first = FtAndIterator::new(
			vec![index_iter(&lists, 1), index_iter(&lists, 2)],
			Direction::Forward,
			true,
		);
		let second = FtAndIterator::new(
			vec![index_iter(&lists, 2), index_iter(&lists, 1)],
			Direction::Forward,
			true,
		);

		// when
		let mut sig_first = Vec::new();
		let mut sig_second = Vec::new();
		first.signature(&mut sig_first);
		second.signature(&mut sig_second);

		// then
		assert_eq!(sig_first.len(), SIGNATURE_SIZE);
		assert_eq!(sig_first, sig_second);
	}
}
