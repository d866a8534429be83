//! A single-threaded, callback-driven `epoll` reactor for non-blocking TCP
//! and multicast UDP.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! nbio = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nbio::Reactor;
//! use nbio::net::tcp::TcpListener;
//!
//! let reactor = Reactor::new().unwrap();
//! let listener = TcpListener::bind(&reactor, "tcp4", "127.0.0.1:0").unwrap();
//!
//! listener.async_accept(|res| {
//!     if let Ok(stream) = res {
//!         stream.async_read(vec![0u8; 1024], |res, n, buf| {
//!             if res.is_ok() {
//!                 println!("read {} bytes: {:?}", n, &buf[..n]);
//!             }
//!         });
//!     }
//! });
//!
//! reactor.run_pending().unwrap();
//! ```

extern crate libc;
#[macro_use]
extern crate log;

mod addr;
mod error;
mod interest;
pub mod net;
mod poller;
mod reactor;
mod slot;
mod sys;
mod timer;
mod token;
mod waker;

pub use addr::Family;
pub use error::{Error, Result};
pub use reactor::{Handle, Reactor, ReactorConfig};
pub use timer::TimerHandle;
pub use token::Token;
