use std::time::Duration;

use crate::utils::{KIB, MIB};

pub(crate) const DEFAULT_PAGE_SIZE: usize = 4 * KIB;
pub(crate) const DEFAULT_DRAM_PAGE_SIZE: usize = 16 * KIB - 256;
pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 256 * MIB;
pub(crate) const DEFAULT_FLUSH_SIZE: usize = 16 * MIB;
pub(crate) const DEFAULT_MAX_DIFF_RUN: usize = 8;
pub(crate) const DEFAULT_AUTO_COMMIT_PERIOD: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_millis(200);
