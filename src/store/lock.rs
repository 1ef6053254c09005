use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::{Result, ResvError};

/// How long a command waits for another `resv` process to finish.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);

const MAX_BACKOFF: Duration = Duration::from_millis(128);

/// Acquire the exclusive process lock on `path`, retrying with capped
/// exponential backoff until `wait` has elapsed. The lock is released when
/// the returned File is dropped.
pub fn acquire_lock(path: &Path, wait: Duration) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    let deadline = Instant::now() + wait;
    let mut delay = Duration::from_millis(1);

    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(delay);
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(_) => {
                return Err(ResvError::Locked(path.display().to_string()));
            }
        }
    }
}

/// Release lock explicitly (normally handled by Drop).
pub fn release_lock(file: File) -> Result<()> {
    file.unlock()?;
    Ok(())
}
