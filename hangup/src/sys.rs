//! Thin wrappers over the Unix syscalls the engine needs.
//!
//! Every blocking or signal-sensitive call is routed through [`retry`],
//! so an `EINTR` never reaches the engine or its callers.

use libc::{F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, O_NONBLOCK, c_int, fcntl};
use parking_lot::Mutex;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Maximum number of consecutive `EINTR` results absorbed by [`retry`].
pub const INTERRUPT_RETRIES: usize = 256;

/// Runs `op` until it returns something other than [`io::ErrorKind::Interrupted`].
///
/// Interruptions are retried at most [`INTERRUPT_RETRIES`] times in a row;
/// past that the interruption is returned as an ordinary error.
pub fn retry<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut remaining = INTERRUPT_RETRIES;

    loop {
        match op() {
            Err(err) if err.kind() == io::ErrorKind::Interrupted && remaining > 0 => {
                remaining -= 1;
                tracing::trace!(remaining, "syscall interrupted, retrying");
            }
            result => return result,
        }
    }
}

/// Converts a C return value into an `io::Result`.
pub(crate) fn cvt(rc: c_int) -> io::Result<c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Duplicates a descriptor. The copy is close-on-exec.
pub(crate) fn sys_dup(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    retry(|| fd.try_clone_to_owned())
}

/// Identity of the open file behind a descriptor: `(device, inode)`.
///
/// Two descriptors with the same identity refer to the same socket or
/// file, even when their numbers differ.
pub(crate) fn sys_identity(fd: BorrowedFd<'_>) -> io::Result<(u64, u64)> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();

    retry(|| cvt(unsafe { libc::fstat(fd.as_raw_fd(), stat.as_mut_ptr()) }))?;

    let stat = unsafe { stat.assume_init() };
    Ok((stat.st_dev as u64, stat.st_ino as u64))
}

/// Sets a descriptor to non-blocking, close-on-exec mode.
fn sys_prepare(fd: RawFd) -> io::Result<()> {
    let flags = cvt(unsafe { fcntl(fd, F_GETFL) })?;
    cvt(unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) })?;
    cvt(unsafe { fcntl(fd, F_SETFD, FD_CLOEXEC) })?;
    Ok(())
}

/// Returns `true` if the error means the descriptor is not open.
pub(crate) fn is_bad_descriptor(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBADF)
}

/// The channel used to wake the worker out of a blocking receive.
///
/// The read end is subscribed into the polling context when it starts;
/// writing one byte to the write end makes it readable, which the
/// platform reports under the cancel token. Closing the write end makes
/// the read end readable too, which is the fallback when writing fails.
pub(crate) struct CancelPipe {
    read: OwnedFd,
    write: Mutex<Option<OwnedFd>>,
}

impl CancelPipe {
    /// Creates a non-blocking, close-on-exec pipe.
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds: [c_int; 2] = [-1, -1];

        retry(|| cvt(unsafe { libc::pipe(fds.as_mut_ptr()) }))?;

        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        sys_prepare(read.as_raw_fd())?;
        sys_prepare(write.as_raw_fd())?;

        Ok(Self {
            read,
            write: Mutex::new(Some(write)),
        })
    }

    /// The end the polling context watches.
    pub(crate) fn reader(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// Wakes the worker.
    ///
    /// A full pipe already wakes it, so `WouldBlock` counts as success.
    /// On any other failure the write end is closed, which still wakes
    /// the worker, and the write error is returned.
    pub(crate) fn signal(&self) -> io::Result<()> {
        let mut writer = self.write.lock();
        let Some(write) = writer.as_ref() else {
            return Ok(());
        };

        let byte = [0u8; 1];
        let written = retry(|| {
            let n = unsafe { libc::write(write.as_raw_fd(), byte.as_ptr() as *const _, 1) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n)
            }
        });

        match written {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                writer.take();
                Err(err)
            }
        }
    }
}
