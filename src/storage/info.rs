use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::debug;

const GIGABYTE: u64 = 1_000_000_000;

/// Source of filesystem capacity numbers; swapped out in tests.
pub trait DiskStats: Send + Sync {
	/// `(total, available)` bytes of the filesystem holding `path`.
	fn capacity(&self, path: &Path) -> Option<(u64, u64)>;
}

/// Reads capacity from the running system, picking the mounted disk with
/// the longest mount-point prefix of the queried path.
pub struct SystemDiskStats;

impl DiskStats for SystemDiskStats {
	fn capacity(&self, path: &Path) -> Option<(u64, u64)> {
		let disks = Disks::new_with_refreshed_list();
		disks
			.list()
			.iter()
			.filter(|disk| path.starts_with(disk.mount_point()))
			.max_by_key(|disk| disk.mount_point().as_os_str().len())
			.map(|disk| (disk.total_space(), disk.available_space()))
	}
}

/// Answers the admission questions asked by the ingress and export paths:
/// is there room to accept new data, and is there room to stage exports.
pub struct StorageInfoProvider {
	watermark_percent: u8,
	reserve_bytes: u64,
	path: PathBuf,
	stats: Box<dyn DiskStats>,
}

impl StorageInfoProvider {
	pub fn new(
		watermark_percent: u8,
		reserve_space_gb: u32,
		path: impl Into<PathBuf>,
		stats: Box<dyn DiskStats>,
	) -> Self {
		Self {
			watermark_percent,
			reserve_bytes: u64::from(reserve_space_gb) * GIGABYTE,
			path: path.into(),
			stats,
		}
	}

	pub fn available_free_space(&self) -> u64 {
		self.stats
			.capacity(&self.path)
			.map_or(0, |(_, available)| available)
	}

	/// Space check for ingress: the used fraction must stay below the
	/// watermark and the absolute reserve must remain untouched.
	pub fn has_space_to_store(&self) -> bool {
		let Some((total, available)) = self.stats.capacity(&self.path) else {
			// A filesystem we cannot measure is treated as full.
			return false;
		};
		if total == 0 {
			return false;
		}

		let used = total - available;
		let used_percent = used * 100 / total;
		let ok = used_percent < u64::from(self.watermark_percent) && available > self.reserve_bytes;
		debug!(
			used_percent,
			available,
			reserve = self.reserve_bytes,
			ok,
			"Storage admission check"
		);
		ok
	}

	/// Exports stage downloads into the same spool, so the same thresholds
	/// apply.
	pub fn has_space_for_export(&self) -> bool {
		self.has_space_to_store()
	}
}
