//! Arms three one-shot timers out of order and lets the reactor fire them
//! back in deadline order.

use std::time::Duration;

use nbio::Reactor;

fn main() {
    env_logger::init();

    let reactor = Reactor::new().unwrap();

    reactor.timer(Duration::from_millis(300), || println!("fired after 300ms")).unwrap();
    reactor.timer(Duration::from_millis(100), || println!("fired after 100ms")).unwrap();
    reactor.timer(Duration::from_millis(200), || println!("fired after 200ms")).unwrap();

    reactor.run_pending().unwrap();
}
