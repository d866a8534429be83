use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use nbio::net::udp::UdpPeer;
use nbio::Reactor;

fn drain_into(reader: Rc<UdpPeer>, sink: Rc<RefCell<Vec<(u8, SocketAddr)>>>, want: usize) {
    if sink.borrow().len() >= want {
        return;
    }
    let sink_clone = sink.clone();
    let reader_clone = reader.clone();
    reader.async_read_from(vec![0u8; 1], move |res, n, from, buf| {
        if res.is_ok() && n == 1 {
            sink_clone.borrow_mut().push((buf[0], from));
        }
        drain_into(reader_clone, sink_clone, want);
    });
}

#[test]
fn single_group_single_sender_sees_all_sequences() {
    let reactor = Reactor::new().unwrap();
    let reader = Rc::new(UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap());
    let port = reader.local_addr().port();
    reader.join("224.0.1.0".parse().unwrap(), None).unwrap();

    let sender = UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap();
    let group: SocketAddr = format!("224.0.1.0:{port}").parse().unwrap();
    for seq in 1u8..=10 {
        sender.write_to(&[seq], &group).unwrap();
    }

    let received = Rc::new(RefCell::new(Vec::new()));
    drain_into(reader.clone(), received.clone(), 10);
    reactor.run_pending().unwrap();

    let mut seqs: Vec<u8> = received.borrow().iter().map(|(seq, _)| *seq).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=10).collect::<Vec<u8>>());

    let sender_addr = sender.local_addr();
    assert!(received.borrow().iter().all(|(_, from)| *from == sender_addr));
}

#[test]
fn bind_address_filters_the_join_set() {
    let reactor = Reactor::new().unwrap();
    let reader = Rc::new(UdpPeer::bind(&reactor, "udp4", "224.0.3.0:0").unwrap());
    let port = reader.local_addr().port();
    reader.join("224.0.3.0".parse().unwrap(), None).unwrap();
    reader.join("224.0.4.0".parse().unwrap(), None).unwrap();

    let sender_a = UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap();
    let sender_b = UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap();

    let group_a: SocketAddr = format!("224.0.3.0:{port}").parse().unwrap();
    let group_b: SocketAddr = format!("224.0.4.0:{port}").parse().unwrap();
    for seq in 1u8..=10 {
        sender_a.write_to(&[seq], &group_a).unwrap();
    }
    for seq in 1u8..=10 {
        sender_b.write_to(&[seq], &group_b).unwrap();
    }

    let received = Rc::new(RefCell::new(Vec::new()));
    drain_into(reader.clone(), received.clone(), 10);
    reactor.run_pending().unwrap();

    let sender_a_addr = sender_a.local_addr();
    assert_eq!(received.borrow().len(), 10);
    assert!(received.borrow().iter().all(|(_, from)| *from == sender_a_addr));
}

#[test]
fn ttl_round_trips_for_every_value() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap();

    for ttl in 0u8..=255 {
        peer.set_ttl(ttl).unwrap();
        assert_eq!(peer.ttl(), ttl);
    }
}

#[test]
fn loopback_defaults_to_disabled() {
    let reactor = Reactor::new().unwrap();
    let peer = UdpPeer::bind(&reactor, "udp4", "0.0.0.0:0").unwrap();
    assert!(!peer.loop_enabled());
    assert_eq!(peer.ttl(), 1);
}
