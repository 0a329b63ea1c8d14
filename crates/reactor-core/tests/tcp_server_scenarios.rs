use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_core::{EventLoop, TcpConnection, TcpServer};

/// Spawns a base loop on its own thread, builds a `TcpServer` on it via
/// `configure`, starts accepting, and hands back the bound address plus a
/// handle the test can use to shut everything down.
///
/// The `EventLoop` must be constructed on the same thread that runs it, so
/// everything server-side happens inside the spawned closure; the bound
/// port (we always ask for `:0`) comes back over a channel.
fn spawn_server(
    configure: impl FnOnce(&Arc<TcpServer>) + Send + 'static,
) -> (SocketAddr, Arc<EventLoop>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(event_loop.clone(), addr, "test-server", false);
        configure(&server);
        server.start();
        tx.send((server.local_addr(), event_loop.clone())).unwrap();
        event_loop.run();
    });
    let (addr, event_loop) = rx.recv().expect("server thread died before reporting its address");
    (addr, event_loop, handle)
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("could not connect to {addr}");
}

#[test]
fn echo_roundtrip() {
    let (addr, event_loop, handle) = spawn_server(|server| {
        server.set_message_callback(|conn, buf, _receive_time| {
            let data = buf.retrieve_all_as_bytes();
            conn.send(&data);
        });
    });

    let mut client = connect_with_retry(addr);
    client.write_all(b"hello, reactor").unwrap();

    let mut response = [0u8; 14];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"hello, reactor");

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn fragmented_send_reassembles_into_one_message() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_for_server = received.clone();

    let (addr, event_loop, handle) = spawn_server(move |server| {
        server.set_message_callback(move |_conn, buf, _receive_time| {
            // Only call back once the full, known-size payload has arrived.
            if buf.readable_bytes() >= 9 {
                let data = buf.retrieve_all_as_bytes();
                received_for_server.lock().unwrap().extend(data);
            }
        });
    });

    let mut client = connect_with_retry(addr);
    for chunk in [&b"fra"[..], &b"gmen"[..], &b"ted!"[..]] {
        client.write_all(chunk).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if received.lock().unwrap().len() >= 9 || std::time::Instant::now() > deadline {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(&received.lock().unwrap()[..], b"fragmented!");

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn high_water_mark_fires_once_output_backs_up() {
    let hwm_hits = Arc::new(Mutex::new(0u32));
    let hwm_hits_for_server = hwm_hits.clone();
    const MARK: usize = 64 * 1024;

    let (addr, event_loop, handle) = spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let hits = hwm_hits_for_server.clone();
                conn.set_high_water_mark_callback(move |_conn, _len| *hits.lock().unwrap() += 1, MARK);
            }
        });
        server.set_message_callback(|conn, buf, _ts| {
            // Any byte from the client triggers a payload far bigger than
            // the kernel's send buffer; since the client below never reads
            // it, the excess queues up in the connection's own output
            // buffer past `MARK`.
            buf.retrieve_all();
            conn.send(&vec![b'x'; 8 * 1024 * 1024]);
        });
    });

    let mut client = connect_with_retry(addr);
    client.write_all(b"go").unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while *hwm_hits.lock().unwrap() == 0 && std::time::Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(*hwm_hits.lock().unwrap() > 0, "expected the high-water mark callback to fire");

    drop(client);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn send_from_another_thread_reaches_the_client() {
    let conn_slot: Arc<Mutex<Option<Arc<TcpConnection>>>> = Arc::new(Mutex::new(None));
    let conn_slot_for_server = conn_slot.clone();

    let (addr, event_loop, handle) = spawn_server(move |server| {
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *conn_slot_for_server.lock().unwrap() = Some(conn.clone());
            }
        });
    });

    let mut client = connect_with_retry(addr);

    let conn = loop {
        if let Some(conn) = conn_slot.lock().unwrap().clone() {
            break conn;
        }
        thread::sleep(Duration::from_millis(5));
    };

    // Send from a thread that is neither the server's loop thread nor the
    // test's main thread, exercising `TcpConnection::send`'s cross-thread
    // `queue_in_loop` path.
    let sender = thread::spawn(move || {
        conn.send(b"from another thread");
    });
    sender.join().unwrap();

    let mut response = vec![0u8; "from another thread".len()];
    client.read_exact(&mut response).unwrap();
    assert_eq!(&response, b"from another thread");

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn connections_fan_out_across_worker_threads() {
    let thread_ids = Arc::new(Mutex::new(std::collections::HashSet::new()));
    let thread_ids_for_server = thread_ids.clone();

    let (addr, event_loop, handle) = spawn_server(move |server| {
        server.set_thread_num(3);
        server.set_message_callback(move |conn, buf, _ts| {
            thread_ids_for_server.lock().unwrap().insert(thread::current().id());
            let data = buf.retrieve_all_as_bytes();
            conn.send(&data);
        });
    });

    let mut clients = Vec::new();
    for i in 0..6 {
        let mut client = connect_with_retry(addr);
        client.write_all(format!("ping{i}").as_bytes()).unwrap();
        clients.push(client);
    }

    for mut client in clients {
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
    }

    assert!(
        thread_ids.lock().unwrap().len() > 1,
        "expected connections to fan out across more than one worker thread"
    );

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn shutdown_drains_queued_output_before_closing() {
    let (addr, event_loop, handle) = spawn_server(|server| {
        server.set_message_callback(|conn, buf, _ts| {
            let data = buf.retrieve_all_as_bytes();
            conn.send(&data);
            conn.shutdown();
        });
    });

    let mut client = connect_with_retry(addr);
    client.write_all(b"drain-me").unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    assert_eq!(response, b"drain-me");

    event_loop.quit();
    handle.join().unwrap();
}
