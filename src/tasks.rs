use std::{
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Condvar, Mutex,
	},
	time::Duration,
};

use futures::executor::ThreadPool;
use log::warn;

/// Wakeable periodic timer. `wait` sleeps one period on a condvar and
/// reports whether the timer is still active; `stop` wakes all sleepers.
pub(crate) struct Timer {
	period: Duration,
	active: Arc<AtomicBool>,
	wakeup: Arc<(Mutex<()>, Condvar)>,
}

impl Timer {
	pub fn new(period: Duration) -> Self {
		Self {
			period,
			active: Arc::new(AtomicBool::new(true)),
			wakeup: Arc::new((Mutex::new(()), Condvar::new())),
		}
	}

	pub fn handle(&self) -> TimerHandle {
		TimerHandle {
			active: Arc::clone(&self.active),
			wakeup: Arc::clone(&self.wakeup),
		}
	}

	pub fn wait(&self) -> bool {
		if !self.active.load(Ordering::Relaxed) {
			return false;
		}
		let (lock, condvar) = &*self.wakeup;
		let guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		let _ = condvar.wait_timeout(guard, self.period);
		self.active.load(Ordering::Relaxed)
	}
}

/// Stops the associated timer; dropping the handle stops it as well.
pub(crate) struct TimerHandle {
	active: Arc<AtomicBool>,
	wakeup: Arc<(Mutex<()>, Condvar)>,
}

impl TimerHandle {
	pub fn stop(&self) {
		self.active.store(false, Ordering::Relaxed);
		self.wakeup.1.notify_all();
	}
}

impl Drop for TimerHandle {
	fn drop(&mut self) {
		self.stop();
	}
}

/// Background task runner over a thread pool. Scheduled tasks run until
/// their handle stops them.
pub(crate) struct TaskRunner {
	pool: ThreadPool,
}

impl TaskRunner {
	pub fn new() -> Result<Self, io::Error> {
		Ok(Self {
			pool: ThreadPool::new()?,
		})
	}

	/// Run `task` every `period` until the returned handle is stopped or
	/// dropped. Task panics would poison the worker, so failures must be
	/// handled inside `task`; it reports errors as strings for logging.
	pub fn schedule(
		&self,
		name: &'static str,
		task: impl Fn() -> Result<(), String> + Send + 'static,
		period: Duration,
	) -> TimerHandle {
		let timer = Timer::new(period);
		let handle = timer.handle();
		self.pool.spawn_ok(async move {
			while timer.wait() {
				if let Err(error) = task() {
					warn!("background task '{name}' failed: {error}");
				}
			}
		});
		handle
	}
}
