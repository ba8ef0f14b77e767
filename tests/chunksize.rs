//! `Socket::set_chunksize` takes effect on the next read rather than retroactively, per its doc
//! comment; this drives reads at the default chunksize, shrinks it mid-stream, then confirms
//! later reads are split into correspondingly smaller deliveries.

use evloop::{Buffer, Loop, Server, ServerCallbacks, Socket, SocketCallbacks, SocketConfig};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn chunksize_change_applies_to_subsequent_reads_only() {
    let mut lp = Loop::new().unwrap();

    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection = Some(Box::new(|_srv, lp, sock: &Socket<()>, _addr| {
        sock.set_on_read(|sock, lp, chunk| {
            if !chunk.is_empty() {
                sock.write(lp, Buffer::new(chunk.to_vec())).unwrap();
            }
        });
        sock.read_start(lp);
    }));
    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let read_sizes = Rc::new(RefCell::new(Vec::new()));
    let total_received = Rc::new(Cell::new(0usize));
    let shrunk = Rc::new(Cell::new(false));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    {
        let read_sizes = Rc::clone(&read_sizes);
        let total_received = Rc::clone(&total_received);
        let shrunk = Rc::clone(&shrunk);
        client_cb.on_read = Some(Box::new(move |sock: &Socket<()>, _lp, chunk: &[u8]| {
            read_sizes.borrow_mut().push(chunk.len());
            total_received.set(total_received.get() + chunk.len());
            if !shrunk.get() {
                sock.set_chunksize(64);
                shrunk.set(true);
            }
        }));
    }

    let client: Socket<()> = Socket::new((), client_cb);
    assert_eq!(client.chunksize(), SocketConfig::default().chunksize);

    client.connect(&mut lp, addr).unwrap();
    client.read_start(&mut lp);
    lp.run_until(|| client.state() == evloop::SocketState::Open, 200).unwrap();

    // Large enough that the echo comes back across several deliveries, guaranteeing at least
    // one read happens before the shrink and at least one after.
    const TOTAL: usize = 500_000;
    client.write(&mut lp, Buffer::new(vec![1u8; TOTAL])).unwrap();
    lp.run_until(|| total_received.get() >= TOTAL, 5000).unwrap();

    assert_eq!(client.chunksize(), 64, "set_chunksize should have taken effect after the first read");
    let sizes = read_sizes.borrow();
    assert!(sizes.len() >= 2, "expected at least a pre- and post-shrink read, got {sizes:?}");
    assert!(
        sizes.iter().skip(1).all(|&n| n <= 64),
        "every read after the first should be capped at the shrunk chunksize of 64, got {sizes:?}"
    );
}
