use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Message deliberately contains "already running" so callers and
    /// operators can tell it apart from transient failures.
    #[error("{name} is already running (pid {pid}, lockfile {})", .path.display())]
    AlreadyRunning {
        name: String,
        pid: i32,
        path: PathBuf,
    },
    #[error("lockfile {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Pid-file lock. Guards one runner per queue and one service instance per
/// database. Removed on drop, so every exit path that unwinds releases it;
/// a crash leaves a stale file that the next holder reclaims after a
/// liveness probe.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Acquire `<dir>/<name>.lock`. An existing lock whose pid is alive
    /// rejects the caller; a dead pid is reclaimed.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, LockError> {
        fs::create_dir_all(dir).map_err(|source| LockError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = dir.join(format!("{name}.lock"));

        if let Some(pid) = read_pid(&path) {
            if pid_alive(pid) {
                return Err(LockError::AlreadyRunning {
                    name: name.to_string(),
                    pid,
                    path,
                });
            }
            tracing::warn!(
                "reclaiming stale lockfile {} (pid {pid} is gone)",
                path.display()
            );
        }

        fs::write(&path, std::process::id().to_string()).map_err(|source| LockError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to remove lockfile {}: {e}", self.path.display());
        }
    }
}

/// Filesystem-safe lock name derived from a queue name.
pub fn lock_name(queue_name: &str) -> String {
    queue_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_alive(pid: i32) -> bool {
    // Signal 0 probes existence. EPERM still means the pid is live.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid_and_removes_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let lock = PidLock::acquire(dir.path(), "q1").unwrap();
        let path = lock.path().to_path_buf();

        let recorded: i32 = fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_blocks_second_holder() {
        let dir = tempfile::TempDir::new().unwrap();
        let _lock = PidLock::acquire(dir.path(), "q1").unwrap();

        let err = PidLock::acquire(dir.path(), "q1").unwrap_err();
        assert!(err.to_string().contains("already running"), "{err}");
    }

    #[test]
    fn dead_pid_is_reclaimed() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("q1.lock");
        // Far above any realistic pid on a test machine.
        fs::write(&path, "999999999").unwrap();

        let lock = PidLock::acquire(dir.path(), "q1").unwrap();
        let recorded: i32 = fs::read_to_string(lock.path()).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);
    }

    #[test]
    fn different_names_do_not_collide() {
        let dir = tempfile::TempDir::new().unwrap();
        let _a = PidLock::acquire(dir.path(), "q1").unwrap();
        let _b = PidLock::acquire(dir.path(), "q2").unwrap();
    }

    #[test]
    fn lock_name_is_filesystem_safe() {
        assert_eq!(lock_name("alpha"), "alpha");
        assert_eq!(lock_name("my queue/1"), "my-queue-1");
        assert_eq!(lock_name("a_b-c"), "a_b-c");
    }
}
