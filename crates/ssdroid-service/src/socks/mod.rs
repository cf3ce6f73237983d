//! SOCKS5 clients used to reach the remote DNS through the local proxy

pub use self::{tcp_client::Socks5TcpClient, udp_client::Socks5UdpClient};

mod tcp_client;
mod udp_client;
