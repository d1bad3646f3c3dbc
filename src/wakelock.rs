//! Wake lock held while inbound data is being drained, so the host power
//! manager does not suspend in the middle of a message.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Wake lock collaborator.
///
/// Acquire and release are counted by the implementation: every
/// [`WakeLock::acquire()`] is matched by exactly one [`WakeLock::release()`].
pub trait WakeLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Does nothing.  For hosts without a power manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) {}
    fn release(&self) {}
}

/// Kernel wake lock via `/sys/power/wake_lock` and `/sys/power/wake_unlock`.
#[derive(Debug, Clone)]
pub struct SysfsWakeLock {
    name: String,
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl SysfsWakeLock {
    /// Wake lock name used by the RPC runtime
    pub const DEFAULT_NAME: &'static str = "rpc-interface";

    pub fn new(name: impl Into<String>) -> Self {
        Self::with_paths(name, "/sys/power/wake_lock", "/sys/power/wake_unlock")
    }

    pub fn with_paths(
        name: impl Into<String>,
        lock_path: impl Into<PathBuf>,
        unlock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            lock_path: lock_path.into(),
            unlock_path: unlock_path.into(),
        }
    }

    fn write_name(&self, path: &Path) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.write_all(self.name.as_bytes())
    }
}

impl Default for SysfsWakeLock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

impl WakeLock for SysfsWakeLock {
    fn acquire(&self) {
        if let Err(e) = self.write_name(&self.lock_path) {
            warn!("failed to acquire wake lock {}: {e}", self.name);
        }
    }

    fn release(&self) {
        if let Err(e) = self.write_name(&self.unlock_path) {
            warn!("failed to release wake lock {}: {e}", self.name);
        }
    }
}

/// Held wake lock, released on drop.
pub struct WakeHold {
    lock: Arc<dyn WakeLock>,
}

impl WakeHold {
    pub fn new(lock: Arc<dyn WakeLock>) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for WakeHold {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl std::fmt::Debug for WakeHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WakeHold")
    }
}
