use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod util;

use util::{connect, start_acceptor, wait_for, LoopRunner};

#[test]
fn echo_round_trip() {
    let closed = Arc::new(AtomicUsize::new(0));
    let closed2 = Arc::clone(&closed);

    let (runner, port) = LoopRunner::spawn(move |event_loop| {
        start_acceptor(event_loop, move |conn, table| {
            conn.set_message_callback(|conn, input| {
                let len = input.readable_size();
                let data = input.read_string(len);
                conn.send(data.as_bytes());
            });

            let closed = Arc::clone(&closed2);
            let table = table.clone();
            conn.set_close_callback(move |conn| {
                closed.fetch_add(1, Ordering::SeqCst);
                table.borrow_mut().remove(&conn.id());
            });
        })
    });

    let mut client = connect(port);
    client.write_all(b"hello\n").unwrap();

    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    // FIN from the client runs the server's close path exactly once.
    client.shutdown(Shutdown::Both).unwrap();
    drop(client);
    assert!(wait_for(Duration::from_secs(2), || {
        closed.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    runner.join();
}

#[test]
fn lines_reassemble_across_segments() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let lines2 = Arc::clone(&lines);

    let (runner, port) = LoopRunner::spawn(move |event_loop| {
        start_acceptor(event_loop, move |conn, table| {
            let lines = Arc::clone(&lines2);
            conn.set_message_callback(move |_conn, input| {
                while let Some(line) = input.read_line() {
                    lines.lock().unwrap().push(line);
                }
            });

            let table = table.clone();
            conn.set_close_callback(move |conn| {
                table.borrow_mut().remove(&conn.id());
            });
        })
    });

    let mut client = connect(port);
    for chunk in [&b"ab"[..], &b"c\n"[..], &b"de\n"[..]] {
        client.write_all(chunk).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
    }

    assert!(wait_for(Duration::from_secs(2), || {
        lines.lock().unwrap().len() == 2
    }));
    assert_eq!(*lines.lock().unwrap(), vec!["abc\n", "de\n"]);

    drop(client);
    runner.join();
}

#[test]
fn queued_output_drains_under_back_pressure() {
    const TOTAL: usize = 4 * 1024 * 1024;

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (runner, port) = LoopRunner::spawn(move |event_loop| {
        start_acceptor(event_loop, move |conn, table| {
            // Queue far more than the kernel send buffer holds; the rest
            // drains across successive writable events.
            let payload = payload.clone();
            conn.set_connected_callback(move |conn| {
                conn.send(&payload);
            });

            let table = table.clone();
            conn.set_close_callback(move |conn| {
                table.borrow_mut().remove(&conn.id());
            });
        })
    });

    let mut client = connect(port);

    // Leave the stream unread for a while so the server's output buffer
    // actually has to absorb the payload.
    thread::sleep(Duration::from_millis(300));

    let mut received = Vec::with_capacity(TOTAL);
    let mut chunk = [0u8; 65536];
    while received.len() < TOTAL {
        let n = client.read(&mut chunk).unwrap();
        assert!(n > 0, "stream ended after {} bytes", received.len());
        received.extend_from_slice(&chunk[..n]);
    }

    assert_eq!(received.len(), TOTAL);
    assert_eq!(received, expected);

    drop(client);
    runner.join();
}
