//! Linux `epoll`-based adapter.
//!
//! Descriptors are armed with `EPOLLRDHUP | EPOLLONESHOT`. `EPOLLIN` is
//! never requested, so pending data alone does not produce an event;
//! `EPOLLHUP` and `EPOLLERR` are always reported by the kernel.
//!
//! The cancellation descriptor is the only level-triggered, persistent
//! registration in the context.

use super::{CANCEL_TOKEN, Event, Platform};
use crate::sys::{cvt, retry};

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLONESHOT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

/// Events that mean the other end is gone.
const CLOSE_EVENTS: u32 = (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32;

/// Linux `epoll` adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct Epoll;

impl Epoll {
    fn ctl(
        poll: BorrowedFd<'_>,
        op: i32,
        fd: BorrowedFd<'_>,
        flags: u32,
        token: u64,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: flags,
            u64: token,
        };

        retry(|| cvt(unsafe { epoll_ctl(poll.as_raw_fd(), op, fd.as_raw_fd(), &mut event) }))?;
        Ok(())
    }
}

impl Platform for Epoll {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn start(&self, cancel: BorrowedFd<'_>) -> io::Result<OwnedFd> {
        let epoll = retry(|| cvt(unsafe { epoll_create1(EPOLL_CLOEXEC) }))?;
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        Self::ctl(
            epoll.as_fd(),
            EPOLL_CTL_ADD,
            cancel,
            EPOLLIN as u32,
            CANCEL_TOKEN,
        )?;

        Ok(epoll)
    }

    fn subscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>, token: u64) -> io::Result<()> {
        let flags = (EPOLLRDHUP | EPOLLONESHOT) as u32;

        match Self::ctl(poll, EPOLL_CTL_ADD, fd, flags, token) {
            // A disarmed one-shot registration for the same open file survives
            // until every descriptor referring to it is closed. Re-arm it.
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                Self::ctl(poll, EPOLL_CTL_MOD, fd, flags, token)
            }
            result => result,
        }
    }

    fn unsubscribe(&self, poll: BorrowedFd<'_>, fd: BorrowedFd<'_>) -> io::Result<()> {
        match Self::ctl(poll, EPOLL_CTL_DEL, fd, 0, 0) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            result => result,
        }
    }

    fn receive(&self, poll: BorrowedFd<'_>) -> io::Result<Event> {
        let mut events = [epoll_event { events: 0, u64: 0 }; 1];

        loop {
            let n = retry(|| {
                cvt(unsafe { epoll_wait(poll.as_raw_fd(), events.as_mut_ptr(), 1, -1) })
            })?;

            if n == 0 {
                continue;
            }

            // Copy out of the (possibly packed) struct before inspecting.
            let flags = events[0].events;
            let token = events[0].u64;

            return Ok(Event {
                token,
                closed: flags & CLOSE_EVENTS != 0,
            });
        }
    }
}
