use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::buffer::Buffer;
use crate::channel::{self, Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::net;

pub type ConnectionCallback = Box<dyn FnMut(&Arc<TcpConnection>)>;
pub type MessageCallback = Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Instant)>;
pub type WriteCompleteCallback = Box<dyn FnMut(&Arc<TcpConnection>)>;
pub type HighWaterMarkCallback = Box<dyn FnMut(&Arc<TcpConnection>, usize)>;
pub type CloseCallback = Box<dyn FnMut(&Arc<TcpConnection>)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// One accepted TCP connection: its state machine, read and write buffers,
/// and the user-supplied callbacks.
///
/// Every method that touches the socket or the buffers is only ever invoked
/// on `loop_`'s thread. `send`/`shutdown` are the exception: they may be
/// called from any thread and hop onto the owning loop via
/// `run_in_loop`. `connected()` reads the atomic `state` directly so it can
/// be polled from any thread without a loop round-trip.
pub struct TcpConnection {
    loop_: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket_fd: RawFd,
    channel: SharedChannel,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    input_buffer: RefCell<Buffer>,
    output_buffer: RefCell<Buffer>,
    high_water_mark: Cell<usize>,

    connection_callback: RefCell<Option<ConnectionCallback>>,
    message_callback: RefCell<Option<MessageCallback>>,
    write_complete_callback: RefCell<Option<WriteCompleteCallback>>,
    high_water_mark_callback: RefCell<Option<HighWaterMarkCallback>>,
    /// Set by the owning `TcpServer` so this connection can remove itself
    /// from the server's connection table once fully torn down.
    close_callback: RefCell<Option<CloseCallback>>,
}

unsafe impl Send for TcpConnection {}
unsafe impl Sync for TcpConnection {}

/// Default high-water mark: once the output buffer holds this many
/// unsent bytes, `high_water_mark_callback` fires (at most once per
/// crossing).
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

impl TcpConnection {
    pub(crate) fn new(
        loop_: Arc<EventLoop>,
        name: String,
        socket_fd: RawFd,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        Arc::new_cyclic(|weak_self: &Weak<TcpConnection>| {
            let channel = Channel::new(Arc::downgrade(&loop_), socket_fd);
            let tie: std::sync::Weak<dyn std::any::Any + Send + Sync> = weak_self.clone();
            channel.borrow_mut().tie(&tie);

            {
                let weak = weak_self.clone();
                channel.borrow_mut().set_read_callback(move |receive_time| {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_read(receive_time);
                    }
                });
            }
            {
                let weak = weak_self.clone();
                channel.borrow_mut().set_write_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_write();
                    }
                });
            }
            {
                let weak = weak_self.clone();
                channel.borrow_mut().set_close_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_close();
                    }
                });
            }
            {
                let weak = weak_self.clone();
                channel.borrow_mut().set_error_callback(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.handle_error();
                    }
                });
            }

            TcpConnection {
                loop_,
                name,
                state: AtomicU8::new(ConnState::Connecting as u8),
                socket_fd,
                channel,
                local_addr,
                peer_addr,
                input_buffer: RefCell::new(Buffer::new()),
                output_buffer: RefCell::new(Buffer::new()),
                high_water_mark: Cell::new(DEFAULT_HIGH_WATER_MARK),
                connection_callback: RefCell::new(None),
                message_callback: RefCell::new(None),
                write_complete_callback: RefCell::new(None),
                high_water_mark_callback: RefCell::new(None),
                close_callback: RefCell::new(None),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The `EventLoop` this connection is pinned to for its whole lifetime.
    pub fn owning_loop(&self) -> Arc<EventLoop> {
        self.loop_.clone()
    }

    /// Sets `TCP_NODELAY`. Off by default, matching a plain accepted socket.
    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(err) = net::set_nodelay(self.socket_fd, on) {
            tracing::warn!(conn = %self.name, %err, "failed to set TCP_NODELAY");
        }
    }

    /// Sets `SO_KEEPALIVE`. Off by default, matching a plain accepted socket.
    pub fn set_keep_alive(&self, on: bool) {
        if let Err(err) = net::set_keepalive(self.socket_fd, on) {
            tracing::warn!(conn = %self.name, %err, "failed to set SO_KEEPALIVE");
        }
    }

    pub fn connected(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Disconnected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_connection_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl FnMut(&Arc<TcpConnection>, &mut Buffer, Instant) + 'static) {
        *self.message_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.write_complete_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_high_water_mark_callback(&self, cb: impl FnMut(&Arc<TcpConnection>, usize) + 'static, mark: usize) {
        *self.high_water_mark_callback.borrow_mut() = Some(Box::new(cb));
        self.high_water_mark.set(mark);
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut(&Arc<TcpConnection>) + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Called by the `TcpServer` right after construction, on the
    /// connection's own loop, to register for readability and fire the
    /// user's `connection_callback`.
    pub(crate) fn connect_established(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        channel::enable_reading(&self.channel);
        if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
            cb(self);
        }
    }

    /// Called once, when the connection is being removed from its server's
    /// table, to tear down the channel regardless of whether the socket was
    /// already observed as closed.
    pub(crate) fn connect_destroyed(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            channel::disable_all(&self.channel);
            if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
                cb(self);
            }
        }
        channel::remove(&self.channel);
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        let result = self.input_buffer.borrow_mut().read_fd(self.socket_fd);
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                if let Some(cb) = self.message_callback.borrow_mut().as_mut() {
                    let mut input = self.input_buffer.borrow_mut();
                    cb(self, &mut input, receive_time);
                }
                // `cb` above borrows `input` as `&mut Buffer` via `RefMut`'s
                // `DerefMut`, not by value: the input buffer stays owned by
                // this connection across calls.
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                tracing::error!(conn = %self.name, %err, "TcpConnection read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.channel.borrow().is_writing() {
            tracing::debug!(conn = %self.name, "spurious writable event, connection has nothing queued");
            return;
        }
        let written = {
            let output = self.output_buffer.borrow();
            output.write_fd(self.socket_fd)
        };
        match written {
            Ok(n) => {
                self.output_buffer.borrow_mut().retrieve(n);
                if self.output_buffer.borrow().readable_bytes() == 0 {
                    channel::disable_writing(&self.channel);
                    let this = self.clone();
                    self.loop_.queue_in_loop(move || this.fire_write_complete());
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => {
                tracing::error!(conn = %self.name, %err, "TcpConnection write failed");
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        debug_assert!(matches!(self.state(), ConnState::Connected | ConnState::Disconnecting));
        self.set_state(ConnState::Disconnected);
        channel::disable_all(&self.channel);

        if let Some(cb) = self.connection_callback.borrow_mut().as_mut() {
            cb(self);
        }
        if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        let err = net::take_socket_error(self.socket_fd).ok().flatten();
        tracing::error!(conn = %self.name, ?err, "TcpConnection socket error");
    }

    /// Queues `data` for sending. Callable from any thread; hops onto the
    /// owning loop if called from elsewhere.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = self.clone();
            self.loop_.queue_in_loop(move || this.send_in_loop(&owned));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Disconnected {
            tracing::debug!(conn = %self.name, "send on a disconnected connection, dropping");
            return;
        }

        let mut wrote_directly = 0usize;
        let mut fault = false;

        if !self.channel.borrow().is_writing() && self.output_buffer.borrow().readable_bytes() == 0 {
            match unsafe { write_raw(self.socket_fd, data) } {
                Ok(n) => {
                    wrote_directly = n;
                    if n == data.len() {
                        let this = self.clone();
                        self.loop_.queue_in_loop(move || this.fire_write_complete());
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    tracing::error!(conn = %self.name, %err, "TcpConnection direct write failed");
                    fault = true;
                }
            }
        }

        if !fault && wrote_directly < data.len() {
            let remaining = &data[wrote_directly..];
            let (old_len, new_len) = {
                let mut output = self.output_buffer.borrow_mut();
                let old_len = output.readable_bytes();
                output.append(remaining);
                (old_len, output.readable_bytes())
            };
            let mark = self.high_water_mark.get();
            if old_len < mark && new_len >= mark {
                let this = self.clone();
                self.loop_.queue_in_loop(move || this.fire_high_water_mark(new_len));
            }
            if !self.channel.borrow().is_writing() {
                channel::enable_writing(&self.channel);
            }
        }
    }

    fn fire_write_complete(self: &Arc<Self>) {
        if let Some(cb) = self.write_complete_callback.borrow_mut().as_mut() {
            cb(self);
        }
    }

    fn fire_high_water_mark(self: &Arc<Self>, len: usize) {
        if let Some(cb) = self.high_water_mark_callback.borrow_mut().as_mut() {
            cb(self, len);
        }
    }

    /// Half-closes the connection for writing once any queued output has
    /// drained. Callable from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let this = self.clone();
            self.loop_.run_in_loop(move || this.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(self: &Arc<Self>) {
        if !self.channel.borrow().is_writing() {
            let _ = net::shutdown_write(self.socket_fd);
        }
    }
}

/// A single non-blocking `write(2)`, used for the fast path that tries to
/// send new data immediately instead of always queueing it.
///
/// # Safety
/// `fd` must refer to an open socket; this is only called with
/// `self.socket_fd`, which is owned by the `TcpConnection` for its whole
/// lifetime.
unsafe fn write_raw(fd: RawFd, data: &[u8]) -> std::io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(n as usize)
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        net::close(self.socket_fd);
    }
}
