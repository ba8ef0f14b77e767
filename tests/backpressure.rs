//! SPEC_FULL §8 scenario 4: a peer that stops reading (and then resets the connection) still
//! releases every enqueued write buffer exactly once, whether it was actually sent or discarded
//! by `close()`'s `write_queue.clear()`.

use evloop::{Buffer, Loop, LoopConfig, Server, ServerCallbacks, Socket, SocketCallbacks};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[test]
fn backed_up_writes_all_release_exactly_once() {
    const BUFFERS: usize = 200;
    const BUFFER_SIZE: usize = 16 * 1024;

    // A short poll timeout keeps each tick bounded even once the peer's receive buffer fills
    // and readiness events stop arriving, so `run_until`'s fixed-tick pump below can't stall.
    let mut lp = Loop::with_config(LoopConfig {
        max_poll_timeout: Duration::from_millis(20),
        ..LoopConfig::default()
    })
    .unwrap();

    // Captures the accepted peer without ever calling `read_start` on it: the kernel receive
    // buffer fills, TCP flow control stalls the client's writes, and the backlog the client's
    // write queue accumulates is exactly the scenario under test.
    let accepted: Rc<RefCell<Option<Socket<()>>>> = Rc::new(RefCell::new(None));
    let accepted2 = Rc::clone(&accepted);

    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection = Some(Box::new(move |_srv, _lp, sock: &Socket<()>, _addr| {
        *accepted2.borrow_mut() = Some(sock.clone());
    }));
    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let releases = Rc::new(Cell::new(0usize));
    let client_closed = Rc::new(Cell::new(false));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    {
        let closed = Rc::clone(&client_closed);
        client_cb.on_close = Some(Box::new(move |_sock, _lp| closed.set(true)));
    }
    client_cb.on_error = Some(Box::new(|_sock, _lp, _err| {
        // Expected: the server-side reset surfaces here before the close path runs.
    }));

    let client: Socket<()> = Socket::new((), client_cb);
    client.connect(&mut lp, addr).unwrap();

    for _ in 0..BUFFERS {
        let releases = Rc::clone(&releases);
        let buf = Buffer::with_release(vec![0u8; BUFFER_SIZE], move |_| {
            releases.set(releases.get() + 1);
        });
        client.write(&mut lp, buf).unwrap();
    }

    // Pump the loop long enough for the kernel buffers to fill and flow control to stall.
    lp.run_until(|| false, 100).unwrap();

    let peer = accepted.borrow_mut().take().expect("server never accepted a connection");
    peer.close(&mut lp);

    lp.run_until(|| client_closed.get(), 2000).unwrap();

    assert!(client_closed.get(), "client never received on_close after the peer reset");
    assert_eq!(
        releases.get(),
        BUFFERS,
        "every enqueued buffer must release exactly once, sent or not"
    );
}

#[test]
fn large_buffer_releases_once_even_if_peer_resets_mid_transfer() {
    const SIZE: usize = 10 * 1024 * 1024;

    let mut lp = Loop::with_config(LoopConfig {
        max_poll_timeout: Duration::from_millis(20),
        ..LoopConfig::default()
    })
    .unwrap();

    let accepted: Rc<RefCell<Option<Socket<()>>>> = Rc::new(RefCell::new(None));
    let accepted2 = Rc::clone(&accepted);

    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection = Some(Box::new(move |_srv, _lp, sock: &Socket<()>, _addr| {
        *accepted2.borrow_mut() = Some(sock.clone());
    }));
    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let released = Rc::new(Cell::new(0usize));
    let client_closed = Rc::new(Cell::new(false));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    {
        let closed = Rc::clone(&client_closed);
        client_cb.on_close = Some(Box::new(move |_sock, _lp| closed.set(true)));
    }
    client_cb.on_error = Some(Box::new(|_sock, _lp, _err| {}));

    let client: Socket<()> = Socket::new((), client_cb);
    client.connect(&mut lp, addr).unwrap();

    let released2 = Rc::clone(&released);
    let buf = Buffer::with_release(vec![0u8; SIZE], move |_| released2.set(released2.get() + 1));
    client.write(&mut lp, buf).unwrap();

    // Give the transfer a moment to get partway through before the peer resets it.
    lp.run_until(|| false, 10).unwrap();

    let peer = accepted.borrow_mut().take().expect("server never accepted a connection");
    peer.close(&mut lp);

    lp.run_until(|| client_closed.get(), 2000).unwrap();

    assert!(client_closed.get(), "client never received on_close after the reset");
    assert_eq!(released.get(), 1, "a 10MiB write buffer must release exactly once, reset or not");
}
