use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::event_loop::EventLoop;

/// Runs once, on the new loop's own thread, right after the loop is
/// constructed but before it starts running, e.g. to pin the thread to a
/// core or set its scheduling priority.
pub type LoopInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Spawns a single OS thread, builds an `EventLoop` on it, and hands the
/// loop back to the caller once it's ready to accept registrations.
struct LoopThread {
    handle: Option<JoinHandle<()>>,
}

impl LoopThread {
    fn spawn(index: usize, init_cb: Option<LoopInitCallback>) -> (Self, Arc<EventLoop>) {
        let ready = Arc::new((Mutex::new(None::<Arc<EventLoop>>), Condvar::new()));
        let ready2 = ready.clone();

        let handle = std::thread::Builder::new()
            .name(format!("reactor-worker-{index}"))
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(cb) = init_cb {
                    cb(&event_loop);
                }
                {
                    let (lock, cvar) = &*ready2;
                    let mut slot = lock.lock().unwrap();
                    *slot = Some(event_loop.clone());
                    cvar.notify_one();
                }
                event_loop.run();
            })
            .expect("failed to spawn reactor worker thread");

        let (lock, cvar) = &*ready;
        let mut slot = lock.lock().unwrap();
        while slot.is_none() {
            slot = cvar.wait(slot).unwrap();
        }
        let event_loop = slot.clone().unwrap();
        (LoopThread { handle: Some(handle) }, event_loop)
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// A fixed pool of worker loops, assigned to new connections round-robin.
///
/// With zero worker threads, `get_next_loop` always hands back the base
/// loop. A `TcpServer` configured this way runs entirely on one thread.
pub struct LoopThreadPool {
    base_loop: Arc<EventLoop>,
    threads: Vec<LoopThread>,
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl LoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> Self {
        LoopThreadPool { base_loop, threads: Vec::new(), loops: Vec::new(), next: AtomicUsize::new(0) }
    }

    /// Spawns `num_threads` worker loops. Must be called before `start`ing
    /// the server that owns this pool, and only once.
    pub fn start(&mut self, num_threads: usize, init_cb: Option<LoopInitCallback>) {
        for i in 0..num_threads {
            let (thread, event_loop) = LoopThread::spawn(i, init_cb.clone());
            self.threads.push(thread);
            self.loops.push(event_loop);
        }
    }

    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % self.loops.len();
        self.loops[i].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() { vec![self.base_loop.clone()] } else { self.loops.clone() }
    }
}

impl Drop for LoopThreadPool {
    /// Each worker's `EventLoop::run()` only returns after `quit()`, and
    /// `LoopThread::drop` joins the spawned thread. Without asking every
    /// loop to quit first, dropping the pool would hang forever waiting for
    /// threads that are still blocked in `epoll_wait`.
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.quit();
        }
    }
}
