//! `kqueue`-based adapter for macOS and the BSDs.
//!
//! Descriptors are watched with `EVFILT_READ` in `EV_CLEAR` mode. The
//! filter also reports data arrival, but only events carrying `EV_EOF` or
//! `EV_ERROR` are flagged as closes; the engine ignores the rest. Edge
//! triggering keeps unread data from producing a stream of events.
//!
//! `kevent.udata` carries the high half of the registry token (the
//! generation) and `kevent.ident` the descriptor, so the full token is
//! rebuilt on any pointer width.

use super::{CANCEL_TOKEN, Event, Platform};
use crate::sys::{cvt, retry};

use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, kevent};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::{mem, ptr};

/// `udata` value marking the cancellation descriptor.
const CANCEL_UDATA: usize = usize::MAX;

/// `kqueue` adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Kqueue;

fn change(fd: RawFd, flags: u16, udata: usize) -> kevent {
    let mut event: kevent = unsafe { mem::zeroed() };
    event.ident = fd as _;
    event.filter = EVFILT_READ as _;
    event.flags = flags as _;
    event.udata = udata as _;
    event
}

fn apply(poll: BorrowedFd<'_>, event: &kevent) -> io::Result<()> {
    retry(|| {
        cvt(unsafe {
            libc::kevent(
                poll.as_raw_fd(),
                event,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })
    })?;
    Ok(())
}

impl Platform for Kqueue {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn start(&self, cancel: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        let kq = retry(|| cvt(unsafe { libc::kqueue() }))?;
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };

        cvt(unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;

        let event = change(
            cancel.as_raw_fd(),
            (EV_ADD | EV_ENABLE) as u16,
            CANCEL_UDATA,
        );
        apply(kq.as_fd(), &event)?;

        Ok(kq)
    }

    fn subscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>, token: u64) -> io::Result<()> {
        let generation = (token >> 32) as usize;
        let event = change(
            fd.as_raw_fd(),
            (EV_ADD | EV_ENABLE | EV_CLEAR) as u16,
            generation,
        );
        apply(poll, &event)
    }

    fn unsubscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
        let event = change(fd.as_raw_fd(), EV_DELETE as u16, 0);
        match apply(poll, &event) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            result => result,
        }
    }

    fn receive(&self, poll: BorrowedFd<'_>) -> io::Result<Event> {
        let mut event: kevent = unsafe { mem::zeroed() };

        loop {
            let n = retry(|| {
                cvt(unsafe {
                    libc::kevent(
                        poll.as_raw_fd(),
                        ptr::null(),
                        0,
                        &mut event,
                        1,
                        ptr::null(),
                    )
                })
            })?;

            if n == 0 {
                continue;
            }

            let udata = event.udata as usize;
            if udata == CANCEL_UDATA {
                return Ok(Event {
                    token: CANCEL_TOKEN,
                    closed: false,
                });
            }

            let fd = event.ident as u32 as u64;
            let flags = event.flags as u16;

            return Ok(Event {
                token: ((udata as u64) << 32) | fd,
                closed: flags & (EV_EOF | EV_ERROR) as u16 != 0,
            });
        }
    }
}
