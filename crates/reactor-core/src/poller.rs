use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::time::Instant;

use crate::channel::{Channel, ChannelState, SharedChannel};

const INITIAL_EVENT_CAPACITY: usize = 16;

/// A level-triggered `epoll` wrapper. Holds a weak, non-owning map from `fd`
/// to the `Channel` registered for it; the `EventLoop`'s active-channel
/// list is the only strong owner while an event is being dispatched.
pub struct Poller {
    epoll_fd: RawFd,
    channels: HashMap<RawFd, Weak<std::cell::RefCell<Channel>>>,
    event_buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            reactor_util::fatal(&format!("epoll_create1 failed: {}", io::Error::last_os_error()));
        }
        Poller {
            epoll_fd,
            channels: HashMap::new(),
            event_buf: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
        }
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Blocks for up to `timeout_ms` (negative means forever) and appends
    /// every channel that became ready to `active`. Returns the timestamp at
    /// which the wait returned.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<SharedChannel>) -> Instant {
        self.event_buf.clear();
        let capacity = self.event_buf.capacity();
        let n = unsafe { libc::epoll_wait(self.epoll_fd, self.event_buf.as_mut_ptr(), capacity as i32, timeout_ms) };
        let now = Instant::now();

        if n > 0 {
            // SAFETY: `epoll_wait` just initialized the first `n` slots of
            // the buffer's spare capacity.
            unsafe { self.event_buf.set_len(n as usize) };
            for event in &self.event_buf {
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) {
                    channel.borrow_mut().set_revents(event.events as i32);
                    active.push(channel);
                }
            }
            if n as usize == capacity {
                self.event_buf.reserve(capacity);
            }
        } else if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                tracing::error!(%err, "epoll_wait failed");
            }
        }
        now
    }

    pub fn update_channel(&mut self, channel: &SharedChannel) {
        let (fd, state, events) = {
            let ch = channel.borrow();
            (ch.fd(), ch.state, ch.events())
        };

        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    self.channels.insert(fd, std::rc::Rc::downgrade(channel));
                }
                channel.borrow_mut().state = ChannelState::Added;
                self.epoll_ctl(libc::EPOLL_CTL_ADD, fd, events);
            }
            ChannelState::Added => {
                if events == 0 {
                    self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, events);
                    channel.borrow_mut().state = ChannelState::Deleted;
                } else {
                    self.epoll_ctl(libc::EPOLL_CTL_MOD, fd, events);
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &SharedChannel) {
        let (fd, state) = {
            let ch = channel.borrow();
            (ch.fd(), ch.state)
        };
        self.channels.remove(&fd);
        if state == ChannelState::Added {
            self.epoll_ctl(libc::EPOLL_CTL_DEL, fd, 0);
        }
        channel.borrow_mut().state = ChannelState::New;
    }

    fn epoll_ctl(&self, op: i32, fd: RawFd, events: i32) {
        let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
        ev.events = events as u32;
        ev.u64 = fd as u64;
        let res = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                tracing::error!(%err, fd, "epoll_ctl(DEL) failed");
            } else {
                reactor_util::fatal(&format!("epoll_ctl({op}) failed for fd {fd}: {err}"));
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
