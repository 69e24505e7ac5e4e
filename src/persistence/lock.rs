//! Advisory lock on the data directory.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Take an exclusive, non-blocking lock on `path`, creating the file if
/// needed.
///
/// Returns `Ok(None)` if another holder already has it. The lock lives as long
/// as the returned file. On non-unix targets no lock is taken.
pub fn lock_exclusive(path: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;

    if try_flock_exclusive(&file)? {
        Ok(Some(file))
    } else {
        Ok(None)
    }
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the fd is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
