use super::{and::FtAndIterator, Direction, FtIterator, FtKey};

/// Factory resolving a tag to its posting-list iterator, or `None` when the
/// tag has no associated index.
pub type TagFactory<K> = Box<dyn FnMut(K, Direction) -> Option<Box<dyn FtIterator<K>>> + Send>;

/// The tag-product operator: combines an object iterator with a tag
/// iterator, yielding `(object, tag)` pairs. For every tag the object
/// stream is restarted and joined against the tag's posting list.
pub struct TagProduct<K: FtKey = u64> {
	direction: Direction,
	objects: Box<dyn FtIterator<K>>,
	tags: Box<dyn FtIterator<K>>,
	tag_factory: TagFactory<K>,
	// AND of the object stream and the current tag's posting list
	current: Option<Box<dyn FtIterator<K>>>,
	current_tag: K,
	end: bool,
}

impl<K: FtKey> TagProduct<K> {
	pub fn new(
		objects: Box<dyn FtIterator<K>>,
		tags: Box<dyn FtIterator<K>>,
		tag_factory: TagFactory<K>,
		direction: Direction,
	) -> Self {
		let mut result = Self {
			direction,
			objects,
			tags,
			tag_factory,
			current: None,
			current_tag: K::default(),
			end: false,
		};
		result.init_next_tag();
		result
	}

	/// Position at the next tag with a non-empty object join.
	fn init_next_tag(&mut self) {
		loop {
			if self.tags.is_end() {
				self.end = true;
				self.current = None;
				return;
			}
			let tag = self.tags.key();
			if let Some(tag_list) = (self.tag_factory)(tag, self.direction) {
				let pair = FtAndIterator::join_pair(
					self.objects.begin_typed(self.direction),
					tag_list,
					self.direction,
					true,
				);
				if !pair.is_end() {
					self.current_tag = tag;
					self.current = Some(Box::new(pair));
					return;
				}
			}
			self.tags.advance();
		}
	}

	pub fn is_end(&self) -> bool {
		self.end
	}

	/// The current `(object, tag)` pair.
	pub fn key(&self) -> (K, K) {
		debug_assert!(!self.end);
		let current = self.current.as_ref().expect("not at end");
		(current.key(), self.current_tag)
	}

	pub fn advance(&mut self) {
		debug_assert!(!self.end);
		let exhausted = {
			let current = self.current.as_mut().expect("not at end");
			current.advance();
			current.is_end()
		};
		if exhausted {
			self.tags.advance();
			self.init_next_tag();
		}
	}

	/// Advance to the first pair of `tag`, skipping earlier tags.
	pub fn join_tag(&mut self, tag: K) -> bool {
		if self.end {
			return false;
		}
		if !self.tags.join(tag, self.direction) {
			self.end = true;
			self.current = None;
			return false;
		}
		self.init_next_tag();
		!self.end
	}

	pub fn direction(&self) -> Direction {
		self.direction
	}
}
