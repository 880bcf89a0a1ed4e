//! `PollPoller`: portable `Poller` built on `poll(2)`.
//!
//! The pollfd array is rebuilt on every wait from the interest map, with the
//! self-pipe doorbell in slot 0. O(n) per wait, fine for small descriptor
//! counts and for platforms without epoll.
//!
//! When more than `max_events` descriptors are ready, reporting starts where
//! the previous wait stopped, so every ready descriptor gets its turn.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use ksio_core::error::Result;
use ksio_core::interest::{InterestSet, Readiness};
use ksio_core::poller::{Notifier, Poller, ReadyEvent};
use nix::errno::Errno;

use crate::self_pipe_notifier::SelfPipeNotifier;

pub struct PollPoller {
    interests: HashMap<RawFd, InterestSet>,
    pollfds: Vec<libc::pollfd>,
    /// Ready descriptors to skip at the start of the next overflowing report.
    rotate: usize,
    doorbell: Arc<SelfPipeNotifier>,
}

impl PollPoller {
    pub fn new() -> Result<Self> {
        Ok(Self {
            interests: HashMap::new(),
            pollfds: Vec::new(),
            rotate: 0,
            doorbell: Arc::new(SelfPipeNotifier::create()?),
        })
    }
}

fn poll_events(interests: InterestSet) -> libc::c_short {
    let mut events = 0;
    if interests.is_readable() {
        events |= libc::POLLIN;
    }
    if interests.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn readiness(revents: libc::c_short) -> Readiness {
    let mut ready = Readiness::NONE;
    if revents & libc::POLLIN != 0 {
        ready |= Readiness::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Readiness::WRITABLE;
    }
    if revents & libc::POLLHUP != 0 {
        ready |= Readiness::HANGUP;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Readiness::ERROR;
    }
    ready
}

impl Poller for PollPoller {
    fn watch(&mut self, fd: RawFd, interests: InterestSet) -> Result<()> {
        self.interests.insert(fd, interests);
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd) -> Result<()> {
        self.interests.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<ReadyEvent>, max_events: usize) -> Result<()> {
        self.pollfds.clear();
        self.pollfds.push(libc::pollfd {
            fd: self.doorbell.fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        self.pollfds.extend(self.interests.iter().map(|(&fd, &set)| libc::pollfd {
            fd,
            events: poll_events(set),
            revents: 0,
        }));

        // SAFETY: the pointer and length describe `pollfds`.
        let ret = unsafe {
            libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, -1)
        };
        match Errno::result(ret) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        if self.pollfds[0].revents != 0 {
            self.doorbell.drain();
        }
        let mut ready: Vec<ReadyEvent> = self.pollfds[1..]
            .iter()
            .filter(|pfd| pfd.revents != 0)
            .map(|pfd| ReadyEvent {
                fd: pfd.fd,
                ready: readiness(pfd.revents),
            })
            .collect();
        let max = max_events.max(1);
        ready.sort_unstable_by_key(|ev| ev.fd);
        if ready.len() <= max {
            events.extend(ready);
            return Ok(());
        }
        // Level-triggered: whatever is left out now is reported next time.
        let skip = self.rotate % ready.len();
        events.extend(ready.iter().cycle().skip(skip).take(max).copied());
        self.rotate = skip + max;
        Ok(())
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        self.doorbell.clone()
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}
