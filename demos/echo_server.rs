//! A minimal TCP echo server: accepts connections, reads up to 1024 bytes,
//! writes them back, and closes.

use std::rc::Rc;

use nbio::net::tcp::{TcpListener, TcpStream};
use nbio::Reactor;

fn handle(stream: Rc<TcpStream>) {
    let stream_for_read = stream.clone();
    stream.async_read(vec![0u8; 1024], move |res, n, buf| {
        let stream = stream_for_read;
        match res {
            Ok(()) => {
                stream.async_write_all(buf[..n].to_vec(), |res, _n, _buf| {
                    if let Err(e) = res {
                        eprintln!("write failed: {e}");
                    }
                });
            }
            Err(e) => eprintln!("read failed: {e}"),
        }
    });
}

fn main() {
    env_logger::init();

    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "tcp4", "127.0.0.1:0").unwrap();
    println!("listening on {}", listener.local_addr());

    fn accept_loop(listener: Rc<TcpListener>) {
        let listener_for_next = listener.clone();
        listener.async_accept(move |res| {
            if let Ok(stream) = res {
                handle(Rc::new(stream));
            }
            accept_loop(listener_for_next);
        });
    }

    accept_loop(Rc::new(listener));

    reactor.run().unwrap();
}
