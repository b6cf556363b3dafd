use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use rustix::fs::{FileType, Mode, OFlags};

/// Shared handle to an open device node
///
/// Clones refer to the same open file description, the node is closed once
/// the last clone is dropped.
#[derive(Debug, Clone)]
pub struct DeviceFd(Arc<OwnedFd>);

impl DeviceFd {
    /// Open the device node at `path` for reading and writing
    pub fn open(path: impl AsRef<Path>) -> io::Result<DeviceFd> {
        let fd = rustix::fs::open(path.as_ref(), OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        Ok(DeviceFd::from(fd))
    }

    /// Whether the descriptor refers to a character device
    pub fn is_char_device(&self) -> io::Result<bool> {
        let stat = rustix::fs::fstat(&*self.0)?;
        Ok(FileType::from_raw_mode(stat.st_mode) == FileType::CharacterDevice)
    }
}

impl PartialEq for DeviceFd {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_raw_fd() == other.0.as_raw_fd()
    }
}

impl AsFd for DeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for DeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl From<OwnedFd> for DeviceFd {
    fn from(fd: OwnedFd) -> Self {
        DeviceFd(Arc::new(fd))
    }
}

/// Open devices that may know the path they were opened from
pub trait DevPath {
    /// Path of the open device, if it can be resolved
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.as_fd().as_raw_fd())).ok()
    }
}

/// Duplicates a file descriptor with `CLOEXEC` set
pub fn dup_fd(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    fd.try_clone_to_owned()
}
