//! Relaying raw DNS messages to the remote DNS server

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use byteorder::{BigEndian, ByteOrder};
use hickory_resolver::proto::error::ProtoError;
use log::trace;
use ssdroid::relay::socks5;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};

use crate::socks::{Socks5TcpClient, Socks5UdpClient};

use super::server::{RemoteDns, TcpFraming};

/// Receive buffer of a UDP relay, large enough for any datagram and its SOCKS5 header
pub const UDP_RELAY_BUFFER_SIZE: usize = 65535;

const TCP_READ_BUFFER_SIZE: usize = 65535;

/// Connection to the remote DNS server, one per relayed query
pub enum DnsClient {
    TcpDirect { stream: TcpStream },
    TcpProxied { stream: Socks5TcpClient },
    UdpDirect { socket: UdpSocket },
    UdpProxied { socket: Socks5UdpClient, ns: SocketAddr },
}

impl DnsClient {
    /// Open a connection to `remote`, through its SOCKS5 proxy if it has one
    pub async fn connect(remote: &RemoteDns, tcp: bool) -> Result<DnsClient, ResolveError> {
        let client = match (tcp, remote.proxy) {
            (true, Some(proxy)) => DnsClient::TcpProxied {
                stream: Socks5TcpClient::connect(remote.dns, proxy).await?,
            },
            (true, None) => DnsClient::TcpDirect {
                stream: TcpStream::connect(remote.dns).await?,
            },
            (false, Some(proxy)) => {
                let mut socket = Socks5UdpClient::bind(unspecified_of(&proxy)).await?;
                socket.associate(proxy).await?;
                DnsClient::UdpProxied { socket, ns: remote.dns }
            }
            (false, None) => {
                let socket = UdpSocket::bind(unspecified_of(&remote.dns)).await?;
                socket.connect(remote.dns).await?;
                DnsClient::UdpDirect { socket }
            }
        };
        Ok(client)
    }

    /// Send `query` and return the reply bytes untouched
    pub async fn relay(&mut self, query: &[u8], framing: TcpFraming) -> Result<Vec<u8>, ResolveError> {
        trace!("DNS relay {} bytes", query.len());

        match *self {
            DnsClient::TcpDirect { ref mut stream } => stream_query(stream, query, framing).await,
            DnsClient::TcpProxied { ref mut stream } => stream_query(stream, query, framing).await,
            DnsClient::UdpDirect { ref socket } => {
                socket.send(query).await?;

                let mut recv_buf = vec![0u8; UDP_RELAY_BUFFER_SIZE];
                let n = socket.recv(&mut recv_buf).await?;
                recv_buf.truncate(n);
                Ok(recv_buf)
            }
            DnsClient::UdpProxied { ref socket, ns } => {
                socket.send_to(0, query, ns).await?;

                let mut recv_buf = vec![0u8; UDP_RELAY_BUFFER_SIZE];
                let (n, ..) = socket.recv_from(&mut recv_buf).await?;
                recv_buf.truncate(n);
                Ok(recv_buf)
            }
        }
    }
}

fn unspecified_of(addr: &SocketAddr) -> SocketAddr {
    match *addr {
        SocketAddr::V4(..) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(..) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

/// Exchange one message over a stream
///
/// With [`TcpFraming::Raw`] the query is written as is and the reply is whatever a single read returns.
/// With [`TcpFraming::LengthPrefixed`] both directions carry a 2 bytes big endian length (RFC 1035 4.2.2).
pub async fn stream_query<S>(stream: &mut S, query: &[u8], framing: TcpFraming) -> Result<Vec<u8>, ResolveError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framing {
        TcpFraming::Raw => {
            stream.write_all(query).await?;
            stream.flush().await?;

            let mut rsp_bytes = vec![0u8; TCP_READ_BUFFER_SIZE];
            let n = stream.read(&mut rsp_bytes).await?;
            if n == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "remote DNS closed without a reply").into());
            }
            rsp_bytes.truncate(n);
            Ok(rsp_bytes)
        }
        TcpFraming::LengthPrefixed => {
            let length = query.len();
            if length > u16::MAX as usize {
                return Err(io::Error::new(ErrorKind::InvalidInput, "DNS message too long").into());
            }

            let mut req_bytes = vec![0u8; length + 2];
            BigEndian::write_u16(&mut req_bytes[0..2], length as u16);
            req_bytes[2..].copy_from_slice(query);
            stream.write_all(&req_bytes).await?;
            stream.flush().await?;

            // [LENGTH][Message]
            let mut length_buf = [0u8; 2];
            stream.read_exact(&mut length_buf).await?;
            let length = BigEndian::read_u16(&length_buf) as usize;

            let mut rsp_bytes = vec![0u8; length];
            stream.read_exact(&mut rsp_bytes).await?;
            Ok(rsp_bytes)
        }
    }
}

/// DNS relay error
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("{0}")]
    ProtoError(#[from] ProtoError),
    #[error("socks5 error: {0}")]
    Socks5Error(#[from] socks5::Error),
}

impl From<ResolveError> for io::Error {
    fn from(e: ResolveError) -> io::Error {
        match e {
            ResolveError::IoError(e) => e,
            ResolveError::ProtoError(e) => From::from(e),
            ResolveError::Socks5Error(e) => From::from(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn raw_framing_writes_bare_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"query");
            server.write_all(b"reply").await.unwrap();
        });

        let reply = stream_query(&mut client, b"query", TcpFraming::Raw).await.unwrap();
        assert_eq!(reply, b"reply");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn length_prefixed_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 7];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"\x00\x05query");
            server.write_all(b"\x00\x05reply").await.unwrap();
        });

        let reply = stream_query(&mut client, b"query", TcpFraming::LengthPrefixed)
            .await
            .unwrap();
        assert_eq!(reply, b"reply");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn raw_framing_eof_is_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        assert!(stream_query(&mut client, b"query", TcpFraming::Raw).await.is_err());
    }
}
