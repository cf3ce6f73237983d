//! Relay protocols spoken with the local proxy

pub use self::socks5::Address;

pub mod socks5;
