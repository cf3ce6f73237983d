//! Core types shared by the ssdroid data plane
//!
//! * [`net::Subnet`], IP ranges used by access control lists and the DNS forwarder
//! * [`relay::socks5`], SOCKS5 wire format for talking to the local proxy

#![crate_type = "lib"]

pub use self::{net::Subnet, relay::Address};

pub mod net;
pub mod relay;
