// One active job per device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

/// Maps device identity to the job that currently owns it.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    owners: Arc<Mutex<HashMap<PathBuf, Uuid>>>,
}

/// Resolve symlinks such as `/dev/disk/by-id/...` so that two names for the
/// same device collide.
fn identity(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Uuid>> {
        self.owners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically take ownership of `device` for `job`. Returns `None` if
    /// another job holds it.
    pub fn claim(&self, device: &Path, job: Uuid) -> Option<DeviceLease> {
        let key = identity(device);
        let mut owners = self.lock();
        if let Some(owner) = owners.get(&key) {
            warn!("{} is owned by job {}, rejecting job {}", key.display(), owner, job);
            return None;
        }
        owners.insert(key.clone(), job);
        debug!("Job {} owns {}", job, key.display());
        Some(DeviceLease {
            registry: self.clone(),
            key,
            job,
        })
    }

    pub fn owner(&self, device: &Path) -> Option<Uuid> {
        self.lock().get(&identity(device)).copied()
    }

    pub fn is_busy(&self, device: &Path) -> bool {
        self.owner(device).is_some()
    }
}

/// Ownership of a device for the lifetime of a job. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    registry: DeviceRegistry,
    key: PathBuf,
    job: Uuid,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut owners = self.registry.lock();
        if owners.get(&self.key) == Some(&self.job) {
            owners.remove(&self.key);
            debug!("Job {} released {}", self.job, self.key.display());
        }
    }
}
