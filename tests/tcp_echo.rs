use std::cell::RefCell;
use std::rc::Rc;

use nbio::net::tcp::{TcpListener, TcpStream};
use nbio::{Error, Reactor};

#[test]
fn echoes_a_single_message() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "tcp4", "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();

    // Keep the accepted stream alive across the read/write round-trip.
    let server_stream: Rc<RefCell<Option<Rc<TcpStream>>>> = Rc::new(RefCell::new(None));
    let server_stream_for_accept = server_stream.clone();

    listener.async_accept(move |res| {
        let echoed = Rc::new(res.unwrap());
        let echoed_for_read = echoed.clone();
        echoed.async_read(vec![0u8; 64], move |res, n, buf| {
            res.unwrap();
            echoed_for_read.async_write_all(buf[..n].to_vec(), |res, _n, _buf| {
                res.unwrap();
            });
        });
        server_stream_for_accept.borrow_mut().replace(echoed);
    });

    let client = TcpStream::connect(&reactor, "tcp4", &addr.to_string(), |res| res.unwrap()).unwrap();
    reactor.run_pending().unwrap();

    client.async_write_all(b"ping".to_vec(), |res, _n, _buf| res.unwrap());
    reactor.run_pending().unwrap();

    let received = Rc::new(RefCell::new(Vec::new()));
    let received_clone = received.clone();
    client.async_read(vec![0u8; 64], move |res, n, buf| {
        res.unwrap();
        received_clone.borrow_mut().extend_from_slice(&buf[..n]);
    });
    reactor.run_pending().unwrap();

    assert_eq!(&*received.borrow(), b"ping");
}

#[test]
fn read_after_peer_close_reports_eof() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "tcp4", "127.0.0.1:0").unwrap();
    let addr = listener.local_addr();

    listener.async_accept(|res| drop(res.unwrap()));

    let client = TcpStream::connect(&reactor, "tcp4", &addr.to_string(), |res| res.unwrap()).unwrap();
    reactor.run_pending().unwrap();

    let saw_eof = Rc::new(RefCell::new(false));
    let saw_eof_clone = saw_eof.clone();
    client.async_read(vec![0u8; 16], move |res, _n, _buf| {
        assert!(matches!(res, Err(Error::Eof)));
        *saw_eof_clone.borrow_mut() = true;
    });
    reactor.run_pending().unwrap();

    assert!(*saw_eof.borrow());
}
