use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use nbio::Reactor;

#[test]
fn timers_fire_in_deadline_order() {
    let reactor = Reactor::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let o = order.clone();
    reactor.timer(Duration::from_millis(30), move || o.borrow_mut().push(30)).unwrap();
    let o = order.clone();
    reactor.timer(Duration::from_millis(10), move || o.borrow_mut().push(10)).unwrap();
    let o = order.clone();
    reactor.timer(Duration::from_millis(20), move || o.borrow_mut().push(20)).unwrap();

    reactor.run_pending().unwrap();

    assert_eq!(*order.borrow(), vec![10, 20, 30]);
}

#[test]
fn cancelling_a_timer_prevents_it_from_firing() {
    let reactor = Reactor::new().unwrap();
    let fired = Rc::new(RefCell::new(false));

    let f = fired.clone();
    let handle = reactor.timer(Duration::from_millis(10), move || *f.borrow_mut() = true).unwrap();
    handle.cancel();

    // A live timer keeps the reactor "pending"; run_for bounds the wait so
    // the test doesn't hang if cancellation silently failed.
    reactor.run_for(Duration::from_millis(50)).unwrap();

    assert!(!*fired.borrow());
}
