use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::event_loop::EventLoop;
use crate::loop_thread::{LoopInitCallback, LoopThreadPool};
use crate::net;
use crate::tcp_connection::TcpConnection;

/// A non-blocking TCP server: one `Acceptor` on a base loop, a pool of
/// worker loops new connections are handed out to round-robin, and the
/// table of connections currently alive.
///
/// All mutation of the connection table and all server-level callbacks run
/// on the base loop's thread; `TcpServer` is not meant to be shared across
/// threads beyond calling `start()` once.
pub struct TcpServer {
    base_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    thread_pool: RefCell<LoopThreadPool>,
    connections: RefCell<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicUsize,
    started: std::cell::Cell<bool>,

    connection_callback: RefCell<Option<Box<dyn FnMut(&Arc<TcpConnection>)>>>,
    message_callback: RefCell<Option<Box<dyn FnMut(&Arc<TcpConnection>, &mut Buffer, Instant)>>>,
    write_complete_callback: RefCell<Option<Box<dyn FnMut(&Arc<TcpConnection>)>>>,
}

/// # Safety
/// `TcpServer` holds `RefCell`-wrapped state (`thread_pool`, `connections`,
/// the three server-level callbacks) that is only ever read or written on
/// the base loop's thread: `new_connection`/`adopt_connection`/
/// `wire_callbacks`/`remove_connection_in_loop` all run there, reached via
/// `run_in_loop`/`queue_in_loop`. An `Arc<TcpServer>` is routinely captured
/// by those posted closures, which is why this needs to be `Send`; nothing
/// outside the base loop thread ever touches the interior-mutable fields.
unsafe impl Send for TcpServer {}
unsafe impl Sync for TcpServer {}

impl TcpServer {
    pub fn new(base_loop: Arc<EventLoop>, listen_addr: SocketAddr, name: impl Into<String>, reuse_port: bool) -> Arc<TcpServer> {
        let name = name.into();
        let acceptor = Acceptor::new(&base_loop, listen_addr, reuse_port);
        let ip_port = listen_addr.to_string();
        let thread_pool = LoopThreadPool::new(base_loop.clone());

        let server = Arc::new(TcpServer {
            base_loop,
            name,
            ip_port,
            acceptor,
            thread_pool: RefCell::new(thread_pool),
            connections: RefCell::new(HashMap::new()),
            next_conn_id: AtomicUsize::new(1),
            started: std::cell::Cell::new(false),
            connection_callback: RefCell::new(None),
            message_callback: RefCell::new(None),
            write_complete_callback: RefCell::new(None),
        });

        let weak_server = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |fd, peer_addr| {
            if let Some(server) = weak_server.upgrade() {
                server.new_connection(fd, peer_addr);
            } else {
                net::close(fd);
            }
        });

        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The listening socket's actual bound address. Useful when constructed
    /// with port 0 and letting the OS pick one.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Spawns `num_threads` worker loops. Must be called before `start`,
    /// and at most once. `num_threads == 0` runs every connection on the
    /// base loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.borrow_mut().start(num_threads, None);
    }

    pub fn set_thread_num_with_init(&self, num_threads: usize, init_cb: LoopInitCallback) {
        self.thread_pool.borrow_mut().start(num_threads, Some(init_cb));
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

    /// Starts accepting connections. Idempotent; safe to call from any
    /// thread, the actual `listen()` always runs on the base loop.
    pub fn start(self: &Arc<Self>) {
        if self.started.replace(true) {
            return;
        }
        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || acceptor.listen());
    }

    fn new_connection(self: &Arc<Self>, fd: RawFd, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop_thread();

        let io_loop = self.thread_pool.borrow().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, peer_addr, conn_id);

        let local_addr = net::local_addr(fd).unwrap_or(peer_addr);

        tracing::info!(conn = %conn_name, %peer_addr, "new connection");

        let server = self.clone();
        let loop_for_conn = io_loop.clone();
        io_loop.run_in_loop(move || {
            let conn = TcpConnection::new(loop_for_conn, conn_name.clone(), fd, local_addr, peer_addr);
            server.adopt_connection(conn);
        });
    }

    /// Finishes wiring a freshly created connection onto its own loop: runs
    /// only on that connection's worker loop.
    fn adopt_connection(self: &Arc<Self>, conn: Arc<TcpConnection>) {
        self.wire_callbacks(&conn);

        self.connections.borrow_mut().insert(conn.name().to_string(), conn.clone());

        let server = self.clone();
        conn.set_close_callback(move |c| server.remove_connection(c));

        conn.connect_established();
    }

    fn wire_callbacks(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        // Forward into the per-server callbacks at dispatch time rather
        // than cloning `Box<dyn FnMut>` (which isn't `Clone`): each
        // connection's callback just calls back into the server.
        let server = self.clone();
        conn.set_connection_callback(move |c| {
            if let Some(cb) = server.connection_callback.borrow_mut().as_mut() {
                cb(c);
            }
        });

        let server = self.clone();
        conn.set_message_callback(move |c, buf, ts| {
            if let Some(cb) = server.message_callback.borrow_mut().as_mut() {
                cb(c, buf, ts);
            }
        });

        let server = self.clone();
        conn.set_write_complete_callback(move |c| {
            if let Some(cb) = server.write_complete_callback.borrow_mut().as_mut() {
                cb(c);
            }
        });
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let server = self.clone();
        let conn = conn.clone();
        self.base_loop.run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        self.base_loop.assert_in_loop_thread();
        self.connections.borrow_mut().remove(conn.name());
        tracing::info!(conn = %conn.name(), "connection removed");
        let conn = conn.clone();
        // `connect_destroyed` must run on the connection's own loop, which
        // may differ from the base loop when a thread pool is in use.
        let conn_loop = conn.owning_loop();
        conn_loop.queue_in_loop(move || conn.connect_destroyed());
    }

    pub fn num_connections(&self) -> usize {
        self.connections.borrow().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        tracing::info!(server = %self.name, "TcpServer dropping, tearing down remaining connections");
        let conns = std::mem::take(&mut *self.connections.borrow_mut());
        for (_, conn) in conns {
            let owning_loop = conn.owning_loop();
            owning_loop.queue_in_loop(move || conn.connect_destroyed());
        }
    }
}
