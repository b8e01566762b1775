use std::{
	collections::HashMap,
	io,
	path::{Path, PathBuf},
	sync::Arc,
};

use parking_lot::Mutex;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	consts::{DEFAULT_AUTO_COMMIT_PERIOD, DEFAULT_REFRESH_PERIOD},
	prefix::{Prefix, PrefixError},
	storage::AccessType,
	tasks::{TaskRunner, TimerHandle},
};

#[derive(Debug, Error)]
pub enum WorkspaceError {
	#[error("Fixture '{0}' is already open")]
	AlreadyOpen(String),

	#[error("Fixture '{0}' is not open")]
	NotOpen(String),

	#[error(transparent)]
	Prefix(#[from] PrefixError),

	#[error(transparent)]
	Io(#[from] io::Error),
}

const PREFIX_FILE_EXTENSION: &str = "hzl";

/// A prefix wrapped for the object layer: atomic operations and commits
/// forward to the prefix, serialized against the workspace's pollers.
pub struct Fixture {
	name: String,
	prefix: Arc<Prefix>,
}

impl Fixture {
	fn new(name: String, prefix: Arc<Prefix>) -> Self {
		Self { name, prefix }
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn prefix(&self) -> &Arc<Prefix> {
		&self.prefix
	}

	pub fn commit(&self) -> Result<u64, PrefixError> {
		self.prefix.commit()
	}

	pub fn refresh(&self) -> Result<u64, PrefixError> {
		self.prefix.refresh()
	}

	pub fn begin_atomic(&self) -> Result<(), PrefixError> {
		self.prefix.begin_atomic()
	}

	pub fn end_atomic(&self) -> Result<(), PrefixError> {
		self.prefix.end_atomic()
	}

	pub fn cancel_atomic(&self) -> Result<(), PrefixError> {
		self.prefix.cancel_atomic()
	}

	pub fn state_num(&self) -> u64 {
		self.prefix.state_num()
	}
}

struct OpenFixture {
	fixture: Arc<Fixture>,
	// auto-commit or refresh poller; stops when the fixture closes
	poller: Option<TimerHandle>,
}

/// Groups fixtures by name within one directory. Read/write workspaces run
/// an auto-commit poller per fixture; read-only workspaces poll for
/// refreshes instead.
pub struct Workspace {
	root: PathBuf,
	access: AccessType,
	runner: TaskRunner,
	fixtures: Mutex<HashMap<String, OpenFixture>>,
	auto_commit: bool,
}

assert_impl_all!(Workspace: Send, Sync);

impl Workspace {
	pub fn open(root: impl AsRef<Path>, access: AccessType) -> Result<Self, WorkspaceError> {
		std::fs::create_dir_all(root.as_ref())?;
		Ok(Self {
			root: root.as_ref().to_path_buf(),
			access,
			runner: TaskRunner::new()?,
			fixtures: Mutex::new(HashMap::new()),
			auto_commit: true,
		})
	}

	/// Open without background pollers (embedding hosts that drive commit
	/// and refresh themselves).
	pub fn open_manual(root: impl AsRef<Path>, access: AccessType) -> Result<Self, WorkspaceError> {
		let mut workspace = Self::open(root, access)?;
		workspace.auto_commit = false;
		Ok(workspace)
	}

	fn fixture_path(&self, name: &str) -> PathBuf {
		self.root.join(format!("{name}.{PREFIX_FILE_EXTENSION}"))
	}

	/// Open (creating as needed, for read/write workspaces) the named
	/// fixture and start its poller.
	pub fn open_fixture(
		&self,
		name: &str,
		page_size: Option<usize>,
	) -> Result<Arc<Fixture>, WorkspaceError> {
		let mut fixtures = self.fixtures.lock();
		if fixtures.contains_key(name) {
			return Err(WorkspaceError::AlreadyOpen(name.to_string()));
		}

		let path = self.fixture_path(name);
		if !path.exists() {
			if self.access == AccessType::ReadOnly {
				return Err(WorkspaceError::NotOpen(name.to_string()));
			}
			Prefix::create(&path, page_size)?;
		}
		let prefix = Arc::new(Prefix::open(&path, self.access)?);
		let fixture = Arc::new(Fixture::new(name.to_string(), Arc::clone(&prefix)));

		let poller = self.auto_commit.then(|| match self.access {
			AccessType::ReadWrite => {
				let prefix = Arc::clone(&prefix);
				self.runner.schedule(
					"auto-commit",
					move || prefix.commit().map(|_| ()).map_err(|err| err.to_string()),
					DEFAULT_AUTO_COMMIT_PERIOD,
				)
			}
			AccessType::ReadOnly => {
				let prefix = Arc::clone(&prefix);
				self.runner.schedule(
					"refresh",
					move || prefix.refresh().map(|_| ()).map_err(|err| err.to_string()),
					DEFAULT_REFRESH_PERIOD,
				)
			}
		});

		fixtures.insert(
			name.to_string(),
			OpenFixture {
				fixture: Arc::clone(&fixture),
				poller,
			},
		);
		Ok(fixture)
	}

	pub fn fixture(&self, name: &str) -> Option<Arc<Fixture>> {
		self.fixtures
			.lock()
			.get(name)
			.map(|open| Arc::clone(&open.fixture))
	}

	pub fn fixture_names(&self) -> Vec<String> {
		self.fixtures.lock().keys().cloned().collect()
	}

	/// Stop the fixture's poller, flush and close its prefix.
	pub fn close_fixture(&self, name: &str) -> Result<(), WorkspaceError> {
		let Some(open) = self.fixtures.lock().remove(name) else {
			return Err(WorkspaceError::NotOpen(name.to_string()));
		};
		if let Some(poller) = open.poller {
			poller.stop();
		}
		open.fixture.prefix().close()?;
		Ok(())
	}

	pub fn close(&self) -> Result<(), WorkspaceError> {
		let names = self.fixture_names();
		for name in names {
			self.close_fixture(&name)?;
		}
		Ok(())
	}
}

impl Drop for Workspace {
	fn drop(&mut self) {
		if let Err(error) = self.close() {
			log::warn!("workspace close failed: {error}");
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{thread, time::Duration};

	use super::*;
	use crate::storage::AccessMode;

	const PAGE: usize = 4096;

	#[test]
	fn fixture_lifecycle_round_trip() {
		// given
		let dir = tempfile::tempdir().unwrap();
		let workspace = Workspace::open_manual(dir.path(), AccessType::ReadWrite).unwrap();
		let fixture = workspace.open_fixture("users", Some(PAGE)).unwrap();

		// when
		let lock = fixture
			.prefix()
			.map_range(0, PAGE, AccessMode::READ_WRITE.with_create())
			.unwrap();
		lock.with_mut(|buf| buf[0] = 7);
		drop(lock);
		fixture.commit().unwrap();
		workspace.close_fixture("users").unwrap();

		// then: reopening reads the committed bytes
		let fixture = workspace.open_fixture("users", Some(PAGE)).unwrap();
		let lock = fixture
			.prefix()
			.map_range(0, PAGE, AccessMode::READ)
			.unwrap();
		lock.with(|buf| assert_eq!(buf[0], 7));
		assert_eq!(fixture.state_num(), 1);
	}

	#[test]
	fn atomic_operations_forward_to_the_prefix() {
		// given
		let dir = tempfile::tempdir().unwrap();
		let workspace = Workspace::open_manual(dir.path(), AccessType::ReadWrite).unwrap();
		let fixture = workspace.open_fixture("atomic", Some(PAGE)).unwrap();

		// when
		fixture.begin_atomic().unwrap();
		let lock = fixture
			.prefix()
			.map_range(0, PAGE, AccessMode::READ_WRITE.with_create())
			.unwrap();
		lock.with_mut(|buf| buf[0] = 1);
		drop(lock);
		fixture.cancel_atomic().unwrap();
		fixture.commit().unwrap();

		// then: the cancelled write never committed
		assert_eq!(fixture.state_num(), 0);
	}

	#[test]
	fn opening_a_fixture_twice_fails() {
		// given
		let dir = tempfile::tempdir().unwrap();
		let workspace = Workspace::open_manual(dir.path(), AccessType::ReadWrite).unwrap();
		workspace.open_fixture("dup", Some(PAGE)).unwrap();

		// then
		assert!(matches!(
			workspace.open_fixture("dup", Some(PAGE)),
			Err(WorkspaceError::AlreadyOpen(_))
		));
	}

	#[test]
	fn read_only_workspace_requires_an_existing_fixture() {
		// given
		let dir = tempfile::tempdir().unwrap();
		let workspace = Workspace::open_manual(dir.path(), AccessType::ReadOnly).unwrap();

		// then
		assert!(matches!(
			workspace.open_fixture("absent", Some(PAGE)),
			Err(WorkspaceError::NotOpen(_))
		));
	}

	#[test]
	fn auto_commit_publishes_writes() {
		// given: a workspace with pollers enabled
		let dir = tempfile::tempdir().unwrap();
		let workspace = Workspace::open(dir.path(), AccessType::ReadWrite).unwrap();
		let fixture = workspace.open_fixture("auto", Some(PAGE)).unwrap();

		// when
		let lock = fixture
			.prefix()
			.map_range(0, PAGE, AccessMode::READ_WRITE.with_create())
			.unwrap();
		lock.with_mut(|buf| buf[0] = 9);
		drop(lock);

		// then: the poller commits within a few periods
		let mut committed = false;
		for _ in 0..50 {
			if fixture.state_num() == 1 {
				committed = true;
				break;
			}
			thread::sleep(Duration::from_millis(100));
		}
		assert!(committed);
	}
}
