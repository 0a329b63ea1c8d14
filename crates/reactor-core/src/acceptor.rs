use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use crate::channel::{self, Channel, SharedChannel};
use crate::event_loop::EventLoop;
use crate::net;

type NewConnectionCallback = Box<dyn FnMut(RawFd, SocketAddr)>;

/// Owns the listening socket, bound to the server's `EventLoop` (the "base
/// loop" in muduo terms: acceptance always happens there, never on a
/// worker loop).
pub struct Acceptor {
    listen_fd: RawFd,
    channel: SharedChannel,
    listening: Cell<bool>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
}

unsafe impl Send for Acceptor {}
unsafe impl Sync for Acceptor {}

impl Acceptor {
    pub fn new(loop_: &Arc<EventLoop>, addr: SocketAddr, reuse_port: bool) -> Arc<Acceptor> {
        let listen_fd = match net::new_stream_socket() {
            Ok(fd) => fd,
            Err(err) => reactor_util::fatal(&format!("failed to create listening socket: {err}")),
        };
        if let Err(err) = net::set_reuseaddr(listen_fd, true) {
            reactor_util::fatal(&format!("setsockopt(SO_REUSEADDR) failed: {err}"));
        }
        if reuse_port {
            if let Err(err) = net::set_reuseport(listen_fd, true) {
                reactor_util::fatal(&format!("setsockopt(SO_REUSEPORT) failed: {err}"));
            }
        }
        if let Err(err) = net::bind(listen_fd, addr) {
            reactor_util::fatal(&format!("failed to bind {addr}: {err}"));
        }

        Arc::new_cyclic(|weak_self: &Weak<Acceptor>| {
            let channel = Channel::new(Arc::downgrade(loop_), listen_fd);
            let weak_self = weak_self.clone();
            channel.borrow_mut().set_read_callback(move |_receive_time| {
                if let Some(acceptor) = weak_self.upgrade() {
                    acceptor.handle_read();
                }
            });
            Acceptor {
                listen_fd,
                channel,
                listening: Cell::new(false),
                new_connection_callback: RefCell::new(None),
            }
        })
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(RawFd, SocketAddr) + 'static,
    {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn is_listening(&self) -> bool {
        self.listening.get()
    }

    /// The socket's actual bound address, useful when constructed with
    /// port 0 and the OS picks one.
    pub fn local_addr(&self) -> SocketAddr {
        net::local_addr(self.listen_fd).expect("a bound listening socket always has a local address")
    }

    /// Starts listening and registers interest in readability. Must run on
    /// the acceptor's loop thread.
    pub fn listen(&self) {
        self.listening.set(true);
        if let Err(err) = net::listen(self.listen_fd, 1024) {
            reactor_util::fatal(&format!("listen() failed: {err}"));
        }
        channel::enable_reading(&self.channel);
    }

    fn handle_read(&self) {
        match net::accept4_nonblocking(self.listen_fd) {
            net::AcceptOutcome::Accepted(fd, addr) => {
                let mut cb = self.new_connection_callback.borrow_mut();
                if let Some(cb) = cb.as_mut() {
                    cb(fd, addr);
                } else {
                    net::close(fd);
                }
            }
            net::AcceptOutcome::WouldBlock => {}
            net::AcceptOutcome::ResourceExhausted => {
                tracing::error!("accept4 failed: process is out of file descriptors (EMFILE/ENFILE)");
            }
            net::AcceptOutcome::Error(err) => {
                tracing::error!(%err, "accept4 failed");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        channel::disable_all(&self.channel);
        channel::remove(&self.channel);
        net::close(self.listen_fd);
    }
}
