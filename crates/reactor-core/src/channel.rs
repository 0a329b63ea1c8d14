use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Weak as SyncWeak;
use std::time::Instant;

use crate::event_loop::EventLoop;

const NONE_EVENT: i32 = 0;
const READ_EVENT: i32 = libc::EPOLLIN | libc::EPOLLPRI;
const WRITE_EVENT: i32 = libc::EPOLLOUT;

/// Registration state a [`Channel`] can be in with respect to its `Poller`,
/// mirroring `EpollPoller`'s `kNew`/`kAdded`/`kDeleted` index values.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ChannelState {
    New,
    Added,
    Deleted,
}

/// One registered, polled file descriptor: its interest/active event masks
/// and the callbacks to run when it becomes ready.
///
/// A `Channel` never outlives the `EventLoop` that owns it and is only ever
/// touched from that loop's thread; it is not `Send`/`Sync` and is shared
/// within a thread via `Rc<RefCell<_>>`.
pub struct Channel {
    loop_: SyncWeak<EventLoop>,
    fd: RawFd,
    events: i32,
    revents: i32,
    pub(crate) state: ChannelState,
    /// A weak handle into the higher-level object (e.g. a `TcpConnection`)
    /// this channel belongs to. Upgraded for the duration of each
    /// `handle_event` call; if the upgrade fails the owner has already been
    /// torn down and no callbacks run.
    tie: Option<SyncWeak<dyn Any + Send + Sync>>,
    read_callback: Option<Box<dyn FnMut(Instant)>>,
    write_callback: Option<Box<dyn FnMut()>>,
    close_callback: Option<Box<dyn FnMut()>>,
    error_callback: Option<Box<dyn FnMut()>>,
}

/// The shared handle type every other module uses to refer to a `Channel`.
pub type SharedChannel = Rc<RefCell<Channel>>;

impl Channel {
    pub(crate) fn new(loop_: SyncWeak<EventLoop>, fd: RawFd) -> SharedChannel {
        Rc::new(RefCell::new(Channel {
            loop_,
            fd,
            events: NONE_EVENT,
            revents: NONE_EVENT,
            state: ChannelState::New,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> i32 {
        self.events
    }

    pub(crate) fn set_revents(&mut self, revents: i32) {
        self.revents = revents;
    }

    pub fn is_none_event(&self) -> bool {
        self.events == NONE_EVENT
    }

    pub fn is_writing(&self) -> bool {
        self.events & WRITE_EVENT != 0
    }

    pub fn is_reading(&self) -> bool {
        self.events & READ_EVENT != 0
    }

    pub fn set_read_callback<F: FnMut(Instant) + 'static>(&mut self, cb: F) {
        self.read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback<F: FnMut() + 'static>(&mut self, cb: F) {
        self.write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback<F: FnMut() + 'static>(&mut self, cb: F) {
        self.close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback<F: FnMut() + 'static>(&mut self, cb: F) {
        self.error_callback = Some(Box::new(cb));
    }

    pub fn tie(&mut self, owner: &SyncWeak<dyn Any + Send + Sync>) {
        self.tie = Some(owner.clone());
    }
}

fn loop_arc(channel: &SharedChannel) -> std::sync::Arc<EventLoop> {
    channel
        .borrow()
        .loop_
        .upgrade()
        .expect("channel outlived its event loop")
}

pub fn enable_reading(channel: &SharedChannel) {
    channel.borrow_mut().events |= READ_EVENT;
    update(channel);
}

pub fn disable_reading(channel: &SharedChannel) {
    channel.borrow_mut().events &= !READ_EVENT;
    update(channel);
}

pub fn enable_writing(channel: &SharedChannel) {
    channel.borrow_mut().events |= WRITE_EVENT;
    update(channel);
}

pub fn disable_writing(channel: &SharedChannel) {
    channel.borrow_mut().events &= !WRITE_EVENT;
    update(channel);
}

pub fn disable_all(channel: &SharedChannel) {
    channel.borrow_mut().events = NONE_EVENT;
    update(channel);
}

pub fn update(channel: &SharedChannel) {
    loop_arc(channel).update_channel(channel);
}

pub fn remove(channel: &SharedChannel) {
    loop_arc(channel).remove_channel(channel);
}

/// Dispatches one ready event to its callbacks, in the order the original
/// reactor uses: a hangup with no pending input closes first, then errors,
/// then readability, then writability. Each branch is independent so e.g. a
/// half-closed socket can report both HUP and still-readable data.
pub fn handle_event(channel: &SharedChannel, receive_time: Instant) {
    let guard: Option<std::sync::Arc<dyn Any + Send + Sync>> = {
        let ch = channel.borrow();
        match &ch.tie {
            Some(weak) => match weak.upgrade() {
                Some(strong) => Some(strong),
                None => return,
            },
            None => None,
        }
    };
    handle_event_inner(channel, receive_time);
    drop(guard);
}

fn handle_event_inner(channel: &SharedChannel, receive_time: Instant) {
    let revents = channel.borrow().revents;

    if revents & libc::EPOLLHUP != 0 && revents & libc::EPOLLIN == 0 {
        invoke_close(channel);
    }
    if revents & libc::EPOLLERR != 0 {
        invoke_error(channel);
    }
    if revents & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        invoke_read(channel, receive_time);
    }
    if revents & libc::EPOLLOUT != 0 {
        invoke_write(channel);
    }
}

fn invoke_read(channel: &SharedChannel, receive_time: Instant) {
    let cb = channel.borrow_mut().read_callback.take();
    if let Some(mut cb) = cb {
        cb(receive_time);
        channel.borrow_mut().read_callback = Some(cb);
    }
}

fn invoke_write(channel: &SharedChannel) {
    let cb = channel.borrow_mut().write_callback.take();
    if let Some(mut cb) = cb {
        cb();
        channel.borrow_mut().write_callback = Some(cb);
    }
}

fn invoke_close(channel: &SharedChannel) {
    let cb = channel.borrow_mut().close_callback.take();
    if let Some(mut cb) = cb {
        cb();
        channel.borrow_mut().close_callback = Some(cb);
    }
}

fn invoke_error(channel: &SharedChannel) {
    let cb = channel.borrow_mut().error_callback.take();
    if let Some(mut cb) = cb {
        cb();
        channel.borrow_mut().error_callback = Some(cb);
    }
}
