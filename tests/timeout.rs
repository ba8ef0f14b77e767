//! SPEC_FULL §8 scenario 3: inactivity timeout fires exactly once, then the user closes.

use evloop::{Loop, Server, ServerCallbacks, Socket, SocketCallbacks, SocketConfig};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn idle_socket_times_out_exactly_once() {
    let mut lp = Loop::new().unwrap();

    // Server accepts and reads, but never writes; it exists only so the client has a live
    // peer to idle against.
    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection =
        Some(Box::new(|_srv, lp, sock: &Socket<()>, _addr| sock.read_start(lp)));
    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let timeouts = Rc::new(Cell::new(0usize));
    let closed = Rc::new(Cell::new(false));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    client_cb.on_connect = Some(Box::new(|sock: &Socket<()>, lp| sock.read_start(lp)));
    {
        let timeouts = Rc::clone(&timeouts);
        client_cb.on_timeout = Some(Box::new(move |sock, lp| {
            timeouts.set(timeouts.get() + 1);
            sock.close(lp);
        }));
    }
    {
        let closed = Rc::clone(&closed);
        client_cb.on_close = Some(Box::new(move |_sock, _lp| closed.set(true)));
    }

    let client: Socket<()> = Socket::with_config(
        (),
        client_cb,
        SocketConfig { timeout: Duration::from_millis(500), chunksize: 4096 },
    );
    client.connect(&mut lp, addr).unwrap();

    lp.run_until(|| closed.get(), 200).unwrap();

    assert_eq!(timeouts.get(), 1, "on_timeout should fire exactly once");
    assert!(closed.get(), "close() after on_timeout should still schedule on_close");
}

#[test]
fn progress_resets_the_timer() {
    let mut lp = Loop::new().unwrap();

    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection = Some(Box::new(|_srv, lp, sock: &Socket<()>, _addr| {
        sock.set_on_read(|sock, lp, chunk| {
            if !chunk.is_empty() {
                sock.write(lp, evloop::Buffer::new(chunk.to_vec())).unwrap();
            }
        });
        sock.read_start(lp);
    }));
    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let timeouts = Rc::new(Cell::new(0usize));
    let pings_sent = Rc::new(Cell::new(0usize));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    {
        let pings_sent = Rc::clone(&pings_sent);
        client_cb.on_connect = Some(Box::new(move |sock: &Socket<()>, lp| {
            sock.read_start(lp);
            sock.write(lp, evloop::Buffer::new(b"x".to_vec())).unwrap();
            pings_sent.set(pings_sent.get() + 1);
        }));
    }
    {
        let pings_sent = Rc::clone(&pings_sent);
        client_cb.on_read = Some(Box::new(move |sock, lp, _chunk: &[u8]| {
            if pings_sent.get() < 3 {
                sock.write(lp, evloop::Buffer::new(b"x".to_vec())).unwrap();
                pings_sent.set(pings_sent.get() + 1);
            }
        }));
    }
    {
        let timeouts = Rc::clone(&timeouts);
        client_cb.on_timeout = Some(Box::new(move |sock, lp| {
            timeouts.set(timeouts.get() + 1);
            sock.close(lp);
        }));
    }

    let client: Socket<()> = Socket::with_config(
        (),
        client_cb,
        SocketConfig { timeout: Duration::from_millis(300), chunksize: 4096 },
    );
    client.connect(&mut lp, addr).unwrap();

    // Each echoed reply resets the timer, so three quick round-trips (well under the 300ms
    // timeout) should never fire `on_timeout`.
    lp.run_until(|| pings_sent.get() >= 3, 500).unwrap();
    assert_eq!(timeouts.get(), 0, "progress should have kept resetting the inactivity timer");
}
