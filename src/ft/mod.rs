use std::{cmp::Ordering, fmt::Debug};

use thiserror::Error;

pub(crate) mod and;
pub(crate) mod andnot;
pub(crate) mod cartesian;
pub(crate) mod index_iter;
pub(crate) mod or;
pub(crate) mod serial;
pub(crate) mod tag_product;

pub use and::FtAndIterator;
pub use andnot::FtAndNotIterator;
pub use cartesian::CartesianProduct;
pub use index_iter::{FtIndexIterator, PostingList};
pub use or::FtOrIterator;
pub use serial::{deserialize_ft_iterator, IndexResolver};
pub use tag_product::TagProduct;

/// Size of a single query signature.
pub const SIGNATURE_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum FtError {
	#[error("Iterator type mismatch: expected {expected}, found {found}")]
	TypeMismatch { expected: u16, found: u16 },

	#[error("Key type mismatch: expected {expected}, found {found}")]
	KeyTypeMismatch { expected: u8, found: u8 },

	#[error("Unknown iterator type tag {0}")]
	UnknownType(u16),

	#[error("Iterator type {0} cannot be deserialized in this context")]
	UnsupportedType(u16),

	#[error("Serialized iterator is truncated")]
	UnexpectedEof,

	#[error("Invalid serialized iterator: {0}")]
	Invalid(String),
}

/// Iteration direction, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Forward,
	Backward,
}

impl Direction {
	pub fn reversed(self) -> Self {
		match self {
			Self::Forward => Self::Backward,
			Self::Backward => Self::Forward,
		}
	}

	pub fn as_i8(self) -> i8 {
		match self {
			Self::Forward => 1,
			Self::Backward => -1,
		}
	}

	pub fn from_i8(value: i8) -> Option<Self> {
		match value {
			1 => Some(Self::Forward),
			-1 => Some(Self::Backward),
			_ => None,
		}
	}

	/// Compare `a` to `b` along this direction: `Greater` means `a` is
	/// strictly ahead of `b`.
	pub fn cmp<K: Ord>(self, a: &K, b: &K) -> Ordering {
		match self {
			Self::Forward => a.cmp(b),
			Self::Backward => b.cmp(a),
		}
	}

	/// Is `a` positioned at or past `b` (the `join` post-condition)?
	pub fn reached<K: Ord>(self, a: &K, b: &K) -> bool {
		self.cmp(a, b) != Ordering::Less
	}
}

/// Serialization type tags of the iterator implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FtIteratorType {
	Invalid = 0,
	Index = 1,
	RangeTree = 2,
	JoinAnd = 3,
	JoinOr = 4,
	JoinAndNot = 5,
}

impl FtIteratorType {
	pub fn from_u16(value: u16) -> Option<Self> {
		match value {
			1 => Some(Self::Index),
			2 => Some(Self::RangeTree),
			3 => Some(Self::JoinAnd),
			4 => Some(Self::JoinOr),
			5 => Some(Self::JoinAndNot),
			_ => None,
		}
	}
}

/// Key types usable by the iterator algebra.
pub trait FtKey: Copy + Ord + Eq + Default + Debug + Send + Sync + 'static {
	const TYPE_TAG: u8;

	fn write_bytes(&self, out: &mut Vec<u8>);
	fn read_bytes(bytes: &[u8]) -> Option<(Self, usize)>;
}

impl FtKey for u64 {
	const TYPE_TAG: u8 = 1;

	fn write_bytes(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.to_le_bytes());
	}

	fn read_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
		let raw: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
		Some((u64::from_le_bytes(raw), 8))
	}
}

impl FtKey for (u64, u64) {
	const TYPE_TAG: u8 = 2;

	fn write_bytes(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&self.0.to_le_bytes());
		out.extend_from_slice(&self.1.to_le_bytes());
	}

	fn read_bytes(bytes: &[u8]) -> Option<(Self, usize)> {
		let first: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
		let second: [u8; 8] = bytes.get(8..16)?.try_into().ok()?;
		Some(((u64::from_le_bytes(first), u64::from_le_bytes(second)), 16))
	}
}

/// The result of a `mutate_inner` pass: was a mutation performed, and is the
/// query tree still valid.
pub type MutateOutcome = (bool, bool);

pub type MutateFn<'a, K> = dyn FnMut(&mut dyn FtIterator<K>) -> MutateOutcome + 'a;

/// Composable full-text iterator over sorted key streams.
///
/// `join(k, dir)` advances until the current key reaches `k` along `dir`;
/// it does not guarantee an exact match. `begin_typed` restarts over the
/// same data; `clone_boxed` preserves the position. `limit_by` bounds are
/// iterator-local: they are neither cloned nor serialized.
pub trait FtIterator<K: FtKey>: Send {
	fn is_end(&self) -> bool;

	/// Key of the current item; must not be called at end.
	fn key(&self) -> K;

	fn direction(&self) -> Direction;

	/// Step a single item along the iterator's direction.
	fn advance(&mut self);

	/// Advance along `dir` until the key reaches `join_key`.
	/// Returns `false` when the stream ends first.
	fn join(&mut self, join_key: K, dir: Direction) -> bool;

	/// Backward join that may skip inner branches; never crosses `join_key`.
	fn join_bound(&mut self, join_key: K);

	/// What `join(join_key, Backward)` would yield, without mutating state.
	fn peek(&self, join_key: K) -> Option<K>;

	/// Does the next item carry the same key as the current one?
	fn is_next_key_duplicated(&self) -> bool;

	/// Fresh iterator over the same data in `dir`, preserving sub-structure.
	fn begin_typed(&self, dir: Direction) -> Box<dyn FtIterator<K>>;

	/// Deep copy preserving direction and position.
	fn clone_boxed(&self) -> Box<dyn FtIterator<K>>;

	/// Restrict the stream not to reach `key`; `None` clears the limit.
	/// Returns `false` when the iterator is no longer valid within the
	/// limit.
	fn limit_by(&mut self, key: Option<K>) -> bool;

	/// Run `scan` over the whole query tree, this node included.
	fn scan_query_tree(&self, scan: &mut dyn FnMut(&dyn FtIterator<K>, usize), depth: usize);

	/// Depth of the query tree; 1 for a direct iterator.
	fn depth(&self) -> usize;

	/// Stop iterating; the iterator yields `is_end` from now on.
	fn stop(&mut self);

	/// Scan the tree until `f` returns `false`.
	/// Returns whether the scan was *not* stopped.
	fn find_by(&self, f: &mut dyn FnMut(&dyn FtIterator<K>) -> bool) -> bool {
		f(self.as_dyn())
	}

	/// Mutate the active inner iterator; may invalidate the whole tree.
	fn mutate_inner(&mut self, f: &mut MutateFn<K>) -> MutateOutcome;

	/// Simple iterators directly represent a parameter value (e.g. a single
	/// posting list).
	fn is_simple(&self) -> bool {
		false
	}

	fn serial_type(&self) -> FtIteratorType;

	fn serialize(&self, out: &mut Vec<u8>);

	/// Append this iterator's [`SIGNATURE_SIZE`] byte signature.
	fn signature(&self, out: &mut Vec<u8>);

	/// Structural equality (position-independent).
	fn equal(&self, other: &dyn FtIterator<K>) -> bool;

	/// Similarity to another query tree: 0.0 for identical, 1.0 for
	/// completely different.
	fn compare_to(&self, other: &dyn FtIterator<K>) -> f64;

	/// Identity of a leaf iterator's data source, when it has one.
	fn leaf_id(&self) -> Option<u64> {
		None
	}

	fn children(&self) -> Vec<&dyn FtIterator<K>> {
		Vec::new()
	}

	fn as_dyn(&self) -> &dyn FtIterator<K>;
}

/// Collect all keys of an iterator (tests and diagnostics).
pub fn collect_keys<K: FtKey>(it: &mut dyn FtIterator<K>) -> Vec<K> {
	let mut keys = Vec::new();
	while !it.is_end() {
		keys.push(it.key());
		it.advance();
	}
	keys
}

/// Greedy minimal-distance matching of two child lists, as used by the
/// combinators' `compare_to`.
pub(crate) fn compare_children<K: FtKey>(
	mine: &[&dyn FtIterator<K>],
	others: &[&dyn FtIterator<K>],
) -> f64 {
	if mine.len() != others.len() {
		return 1.0;
	}
	let mut remaining: Vec<&dyn FtIterator<K>> = others.to_vec();
	let mut result = 1.0;
	let p_diff = 1.0 / mine.len() as f64;
	for child in mine {
		let mut best = f64::MAX;
		let mut best_index = 0;
		for (index, other) in remaining.iter().enumerate() {
			let distance = child.compare_to(*other);
			if distance < best {
				best = distance;
				best_index = index;
			}
		}
		remaining.swap_remove(best_index);
		result *= p_diff - best * p_diff;
	}
	1.0 - result
}

/// Order-independent structural equality of two child lists.
pub(crate) fn children_equal_unordered<K: FtKey>(
	mine: &[&dyn FtIterator<K>],
	others: &[&dyn FtIterator<K>],
) -> bool {
	if mine.len() != others.len() {
		return false;
	}
	let mut remaining: Vec<&dyn FtIterator<K>> = others.to_vec();
	for child in mine {
		let Some(position) = remaining.iter().position(|other| child.equal(*other)) else {
			return false;
		};
		remaining.swap_remove(position);
	}
	true
}
