use super::{Direction, FtIterator, FtKey};

/// Cartesian product of component iterators over tuple keys. Component 0 is
/// the fastest-moving position; advancing carries overflow into higher-order
/// components, restarting exhausted ones.
pub struct CartesianProduct<K: FtKey = u64> {
	direction: Direction,
	components: Vec<Box<dyn FtIterator<K>>>,
	current_key: Vec<K>,
	overflow: bool,
}

impl<K: FtKey> CartesianProduct<K> {
	pub fn new(components: Vec<Box<dyn FtIterator<K>>>, direction: Direction) -> Self {
		assert!(!components.is_empty(), "product of zero components");
		let mut current_key = vec![K::default(); components.len()];
		let mut started = Vec::with_capacity(components.len());
		let mut overflow = false;
		for (index, component) in components.into_iter().enumerate() {
			let component = component.begin_typed(direction);
			if component.is_end() {
				overflow = true;
			} else {
				current_key[index] = component.key();
			}
			started.push(component);
		}
		Self {
			direction,
			components: started,
			current_key,
			overflow,
		}
	}

	pub fn is_end(&self) -> bool {
		self.overflow
	}

	/// The current tuple, one key per component.
	pub fn key(&self) -> &[K] {
		debug_assert!(!self.is_end());
		&self.current_key
	}

	/// Step the product: advance component 0 and carry overflow upwards.
	pub fn advance(&mut self) {
		self.overflow = true;
		for index in 0..self.components.len() {
			if !self.overflow {
				break;
			}
			self.components[index].advance();
			self.overflow = self.components[index].is_end();
			if self.overflow {
				// restart this component and carry into the next one
				self.components[index] = self.components[index].begin_typed(self.direction);
			}
			self.current_key[index] = self.components[index].key();
		}
	}

	/// Join a single component, carrying overflow into the higher-order
	/// components.
	pub fn join_at(&mut self, at: usize, key: K, dir: Direction) {
		if self.components[at].join(key, dir) {
			self.current_key[at] = self.components[at].key();
			return;
		}

		// the component wrapped around; restart it and advance the rest
		self.components[at] = self.components[at].begin_typed(dir);
		self.current_key[at] = self.components[at].key();
		let mut index = at + 1;
		self.overflow = true;
		while self.overflow && index < self.components.len() {
			self.overflow = false;
			self.components[index].advance();
			if self.components[index].is_end() {
				self.components[index] = self.components[index].begin_typed(dir);
				self.overflow = true;
			}
			self.current_key[index] = self.components[index].key();
			index += 1;
		}
	}

	/// Join the whole tuple, highest-order component first.
	pub fn join(&mut self, join_key: &[K], dir: Direction) -> bool {
		debug_assert_eq!(join_key.len(), self.components.len());
		debug_assert!(!self.overflow);
		for index in (0..self.components.len()).rev() {
			self.join_at(index, join_key[index], dir);
			if self.overflow {
				return false;
			}
		}
		true
	}

	pub fn arity(&self) -> usize {
		self.components.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ft::{FtIndexIterator, PostingList};

	fn leaf(keys: &[u64]) -> Box<dyn FtIterator<u64>> {
		Box::new(FtIndexIterator::new(
			PostingList::new(keys.to_vec()),
			Direction::Forward,
			keys.iter().sum(),
		))
	}

	fn collect(product: &mut CartesianProduct<u64>, limit: usize) -> Vec<Vec<u64>> {
		let mut tuples = Vec::new();
		while !product.is_end() && tuples.len() < limit {
			tuples.push(product.key().to_vec());
			product.advance();
		}
		tuples
	}

	#[test]
	fn enumerates_all_tuples() {
		// given
		let mut product =
			CartesianProduct::new(vec![leaf(&[1, 2]), leaf(&[10, 20])], Direction::Forward);

		// then: component 0 varies fastest
		assert_eq!(
			collect(&mut product, 10),
			vec![
				vec![1, 10],
				vec![2, 10],
				vec![1, 20],
				vec![2, 20],
			]
		);
		assert!(product.is_end());
	}

	#[test]
	fn empty_component_empties_the_product() {
		// given
		let product = CartesianProduct::new(vec![leaf(&[1]), leaf(&[])], Direction::Forward);

		// then
		assert!(product.is_end());
	}

	#[test]
	fn join_at_carries_overflow_upwards() {
		// given
		let mut product =
			CartesianProduct::new(vec![leaf(&[1, 5]), leaf(&[10, 20])], Direction::Forward);

		// when: joining component 0 past its last key wraps it and advances
		// component 1
		product.join_at(0, 7, Direction::Forward);

		// then
		assert!(!product.is_end());
		assert_eq!(product.key(), &[1, 20]);
	}

	#[test]
	fn tuple_join_positions_all_components() {
		// given
		let mut product = CartesianProduct::new(
			vec![leaf(&[1, 3, 5]), leaf(&[10, 30])],
			Direction::Forward,
		);

		// when
		assert!(product.join(&[4, 20], Direction::Forward));

		// then
		assert_eq!(product.key(), &[5, 30]);
	}
}
