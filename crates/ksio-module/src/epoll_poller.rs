//! `EpollPoller`: default `Poller` on Linux.
//!
//! Level-triggered epoll. The selector keeps the OS interest of each
//! descriptor equal to the union of its live registrations, so a descriptor
//! nobody waits on is never reported again.

use std::collections::HashSet;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use ksio_core::error::{KsioError, Result};
use ksio_core::interest::{InterestSet, Readiness};
use ksio_core::poller::{Notifier, Poller, ReadyEvent};
use nix::errno::Errno;

use crate::eventfd_notifier::EventFdNotifier;
use crate::sys::cvt;

/// epoll user data marking the doorbell.
const DOORBELL_TOKEN: u64 = u64::MAX;

pub struct EpollPoller {
    epfd: OwnedFd,
    doorbell: Arc<EventFdNotifier>,
    watched: HashSet<RawFd>,
    buf: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        // SAFETY: plain syscall; the descriptor is owned below.
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: fresh descriptor.
        let epfd = unsafe { OwnedFd::from_raw_fd(epfd) };
        let doorbell = Arc::new(EventFdNotifier::create()?);

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: DOORBELL_TOKEN,
        };
        // SAFETY: both descriptors are valid; `ev` outlives the call.
        cvt(unsafe {
            libc::epoll_ctl(epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, doorbell.fd(), &mut ev)
        })?;

        Ok(Self {
            epfd,
            doorbell,
            watched: HashSet::new(),
            buf: Vec::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interests: InterestSet) -> std::result::Result<(), Errno> {
        let mut events = libc::EPOLLRDHUP as u32;
        if interests.is_readable() {
            events |= libc::EPOLLIN as u32;
        }
        if interests.is_writable() {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: fd as u64 };
        // SAFETY: `ev` outlives the call; a stale `fd` is reported as an error.
        Errno::result(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) }).map(drop)
    }
}

fn readiness(events: u32) -> Readiness {
    let mut ready = Readiness::NONE;
    if events & (libc::EPOLLIN as u32) != 0 {
        ready |= Readiness::READABLE;
    }
    if events & (libc::EPOLLOUT as u32) != 0 {
        ready |= Readiness::WRITABLE;
    }
    if events & ((libc::EPOLLHUP | libc::EPOLLRDHUP) as u32) != 0 {
        ready |= Readiness::HANGUP;
    }
    if events & (libc::EPOLLERR as u32) != 0 {
        ready |= Readiness::ERROR;
    }
    ready
}

impl Poller for EpollPoller {
    fn watch(&mut self, fd: RawFd, interests: InterestSet) -> Result<()> {
        let first = if self.watched.contains(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let res = match self.ctl(first, fd, interests) {
            Err(Errno::EEXIST) if first == libc::EPOLL_CTL_ADD => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, interests)
            }
            Err(Errno::ENOENT) if first == libc::EPOLL_CTL_MOD => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, interests)
            }
            other => other,
        };
        match res {
            Ok(()) => {
                self.watched.insert(fd);
                Ok(())
            }
            Err(e) => {
                self.watched.remove(&fd);
                Err(KsioError::from(std::io::Error::from(e)))
            }
        }
    }

    fn unwatch(&mut self, fd: RawFd) -> Result<()> {
        if !self.watched.remove(&fd) {
            return Ok(());
        }
        match self.ctl(libc::EPOLL_CTL_DEL, fd, InterestSet::EMPTY) {
            // Closing a descriptor removes it from epoll on its own.
            Ok(()) | Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, max_events: usize) -> Result<()> {
        let max = max_events.max(1);
        if self.buf.len() < max {
            self.buf.resize(max, libc::epoll_event { events: 0, u64: 0 });
        }
        // SAFETY: `buf` holds at least `max` entries.
        let ret = unsafe {
            libc::epoll_wait(self.epfd.as_raw_fd(), self.buf.as_mut_ptr(), max as libc::c_int, -1)
        };
        let n = match Errno::result(ret) {
            Ok(n) => n as usize,
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(std::io::Error::from(e).into()),
        };
        for ev in &self.buf[..n] {
            // Copies out of the (packed on x86_64) struct.
            let token = ev.u64;
            let flags = ev.events;
            if token == DOORBELL_TOKEN {
                self.doorbell.drain();
                continue;
            }
            events.push(ReadyEvent {
                fd: token as RawFd,
                ready: readiness(flags),
            });
        }
        Ok(())
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        self.doorbell.clone()
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}
