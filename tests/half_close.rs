//! SPEC_FULL §8 scenario 2: half-close. Client writes then `write_eof`; server sees the data
//! followed by an empty `on_read`, replies, and closes; client sees the reply then `on_close`.

use evloop::{Buffer, Loop, Server, ServerCallbacks, Socket, SocketCallbacks};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[test]
fn half_close_then_reply_then_close() {
    let mut lp = Loop::new().unwrap();

    let mut server_cb: ServerCallbacks<(), ()> = ServerCallbacks::default();
    server_cb.on_connection = Some(Box::new(move |_srv, lp, sock: &Socket<()>, _addr| {
        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = Rc::clone(&received);
        sock.set_on_read(move |sock, lp, chunk| {
            if chunk.is_empty() {
                assert_eq!(&*received2.borrow(), b"hello");
                sock.write(lp, Buffer::new(b"world".to_vec())).unwrap();
                sock.close(lp);
            } else {
                received2.borrow_mut().extend_from_slice(chunk);
            }
        });
        sock.read_start(lp);
    }));

    let server: Server<(), ()> = Server::new((), || (), server_cb);
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));

    let mut client_cb: SocketCallbacks<()> = SocketCallbacks::default();
    {
        let received = Rc::clone(&received);
        client_cb.on_read = Some(Box::new(move |_sock, _lp, chunk: &[u8]| {
            received.borrow_mut().extend_from_slice(chunk);
        }));
    }
    client_cb.on_connect = Some(Box::new(|sock: &Socket<()>, lp| {
        sock.read_start(lp);
        sock.write(lp, Buffer::new(b"hello".to_vec())).unwrap();
        sock.write_eof(lp).unwrap();
    }));
    {
        let closed = Rc::clone(&closed);
        client_cb.on_close = Some(Box::new(move |_sock, _lp| closed.set(true)));
    }

    let client: Socket<()> = Socket::new((), client_cb);
    client.connect(&mut lp, addr).unwrap();

    lp.run_until(|| closed.get(), 2000).unwrap();
    assert!(closed.get(), "client never received on_close");
    assert_eq!(&*received.borrow(), b"world");
}

#[test]
fn write_after_write_eof_is_rejected() {
    let mut lp = Loop::new().unwrap();
    let server: Server<(), ()> = Server::new((), || (), ServerCallbacks::default());
    server.listen(&mut lp, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = server.local_addr().unwrap();

    let sock: Socket<()> = Socket::new((), SocketCallbacks::default());
    sock.connect(&mut lp, addr).unwrap();
    lp.run_until(|| sock.state() == evloop::SocketState::Open, 200).unwrap();

    sock.write_eof(&mut lp).unwrap();
    let err = sock.write(&mut lp, Buffer::new(b"too late".to_vec()));
    assert!(err.is_err(), "write after write_eof should be rejected");
}
