use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Advisory exclusive lock on an instance's mapping-log directory, so two
/// processes never append to the same logs.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates a new FileLock and locks the file.
    /// The lock file contains the process ID for debugging purposes.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; single-process use assumed.
        Ok(())
    }

    /// Manually unlock the file.
    /// Note: The lock is automatically released when the FileLock is dropped.
    pub fn unlock(self) -> io::Result<()> {
        // The lock file is left in place to avoid unlink races.
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes.
    }
}
