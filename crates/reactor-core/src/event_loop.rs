use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Instant;

use crate::channel::{self, Channel, SharedChannel};
use crate::poller::Poller;

/// How long a single `epoll_wait` call may block when nothing else is
/// pending, so a loop with no channels registered still wakes periodically.
const POLL_TIMEOUT_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A single-threaded event loop: one `epoll` instance, the channels
/// registered on it, and a queue of tasks submitted from other threads.
///
/// Exactly one `EventLoop` may exist per OS thread. `EventLoop::new`
/// terminates the process if one already exists, matching the original
/// reactor's `__thread` singleton discipline.
///
/// # Safety
/// `EventLoop` holds `Rc`/`RefCell` state (`poller`, `active_channels`,
/// `wakeup_channel`) that is only ever read or written from the thread that
/// created it. The only fields touched from other threads are the atomics,
/// `pending_tasks` (a `Mutex`) and the raw `wakeup_fd`, writing to which is
/// safe from any thread. `Arc<EventLoop>` handles are routinely handed to
/// other threads (the `LoopThreadPool`, an `Acceptor` dispatching accepted
/// connections) so they can call `run_in_loop`/`queue_in_loop`/`quit`; those
/// are the only cross-thread entry points, and they uphold the invariant
/// above by constructions in this module alone.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    poller: RefCell<Poller>,
    active_channels: RefCell<Vec<SharedChannel>>,
    pending_tasks: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    wakeup_channel: RefCell<Option<SharedChannel>>,
    last_poll_time: Cell<Instant>,
}

unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

impl EventLoop {
    pub fn new() -> Arc<EventLoop> {
        if LOOP_IN_THIS_THREAD.with(Cell::get) {
            reactor_util::fatal("another EventLoop already exists in this thread");
        }

        let wakeup_fd = match crate::net::create_eventfd() {
            Ok(fd) => fd,
            Err(err) => reactor_util::fatal(&format!("failed to create event loop wakeup fd: {err}")),
        };

        let event_loop = Arc::new_cyclic(|weak_self| {
            LOOP_IN_THIS_THREAD.with(|f| f.set(true));
            let wakeup_channel = Channel::new(weak_self.clone(), wakeup_fd);
            EventLoop {
                thread_id: std::thread::current().id(),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
                poller: RefCell::new(Poller::new()),
                active_channels: RefCell::new(Vec::new()),
                pending_tasks: Mutex::new(Vec::new()),
                wakeup_fd,
                wakeup_channel: RefCell::new(Some(wakeup_channel)),
                last_poll_time: Cell::new(Instant::now()),
            }
        });

        // Registering the wakeup channel for reading needs to call back into
        // the (now fully constructed) loop via its own channel update path,
        // which requires `weak_self` to upgrade successfully. It can't do
        // that while still inside the `new_cyclic` closure.
        let wakeup_channel = event_loop.wakeup_channel.borrow().clone().unwrap();
        wakeup_channel.borrow_mut().set_read_callback({
            let wakeup_fd = event_loop.wakeup_fd;
            move |_receive_time| drain_wakeup(wakeup_fd)
        });
        channel::enable_reading(&wakeup_channel);

        event_loop
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub(crate) fn assert_in_loop_thread(&self) {
        reactor_util::safe_assert!(self.is_in_loop_thread(), "operation must run on its owning EventLoop's thread");
    }

    pub fn last_poll_time(&self) -> Instant {
        self.last_poll_time.get()
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Runs the loop until `quit()` is called. Must be called on the thread
    /// that constructed this `EventLoop`.
    pub fn run(self: &Arc<Self>) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);
        tracing::debug!("event loop started");

        while !self.quit.load(Ordering::SeqCst) {
            self.active_channels.borrow_mut().clear();
            let now = {
                let mut active = self.active_channels.borrow_mut();
                self.poller.borrow_mut().poll(POLL_TIMEOUT_MS, &mut active)
            };
            self.last_poll_time.set(now);

            let channels = self.active_channels.borrow().clone();
            for ch in &channels {
                channel::handle_event(ch, now);
            }
            self.do_pending_tasks();
        }

        self.looping.store(false, Ordering::SeqCst);
        tracing::debug!("event loop stopped");
    }

    /// Requests the loop to stop after finishing its current iteration.
    /// Safe to call from any thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately if called from the loop thread, otherwise
    /// queues it to run on the next iteration.
    pub fn run_in_loop(self: &Arc<Self>, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` to run on the loop thread, waking it if necessary.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut tasks = self.pending_tasks.lock().unwrap();
            tasks.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::SeqCst);
        let tasks = {
            let mut guard = self.pending_tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::SeqCst);
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.wakeup_fd, (&one as *const u64).cast(), 8) };
        if n != 8 {
            tracing::error!(n, "event loop wakeup wrote an unexpected number of bytes");
        }
    }

    pub(crate) fn update_channel(&self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &SharedChannel) {
        self.assert_in_loop_thread();
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.poller.borrow().has_channel(fd)
    }
}

fn drain_wakeup(fd: RawFd) {
    let mut one: u64 = 0;
    let n = unsafe { libc::read(fd, (&mut one as *mut u64).cast(), 8) };
    if n != 8 {
        tracing::error!(n, "event loop wakeup drained an unexpected number of bytes");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(ch) = self.wakeup_channel.get_mut().take() {
            // Can't go through `channel::disable_all`/`remove` here: those
            // upgrade the channel's `Weak<EventLoop>`, which is already
            // dead by the time this destructor runs. Drive the poller
            // directly instead.
            self.poller.get_mut().remove_channel(&ch);
        }
        unsafe { libc::close(self.wakeup_fd) };
        LOOP_IN_THIS_THREAD.with(|f| f.set(false));
        tracing::debug!("event loop dropped");
    }
}
