//! SOCKS5 TCP client

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
};

use log::trace;
use pin_project::pin_project;
use ssdroid::relay::socks5::{
    self, Address, Command, Error, HandshakeRequest, HandshakeResponse, Reply, TcpRequestHeader, TcpResponseHeader,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, ToSocketAddrs},
};

/// A TCP stream tunnelled through a SOCKS5 proxy
#[pin_project]
pub struct Socks5TcpClient {
    #[pin]
    stream: TcpStream,
}

impl Socks5TcpClient {
    /// CONNECT to `addr` via `proxy`
    pub async fn connect<A, P>(addr: A, proxy: P) -> Result<Socks5TcpClient, Error>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        let (stream, _) = Socks5TcpClient::request(Command::TcpConnect, addr.into(), proxy).await?;
        Ok(Socks5TcpClient { stream })
    }

    /// UDP ASSOCIATE, `addr` is the address the client's UDP socket is bound to
    ///
    /// Returns the control connection, which must be kept open while the association is in use,
    /// and the relay address that datagrams should be sent to.
    pub async fn udp_associate<A, P>(addr: A, proxy: P) -> Result<(Socks5TcpClient, Address), Error>
    where
        A: Into<Address>,
        P: ToSocketAddrs,
    {
        let (stream, relay) = Socks5TcpClient::request(Command::UdpAssociate, addr.into(), proxy).await?;
        Ok((Socks5TcpClient { stream }, relay))
    }

    async fn request<P>(command: Command, addr: Address, proxy: P) -> Result<(TcpStream, Address), Error>
    where
        P: ToSocketAddrs,
    {
        let mut s = TcpStream::connect(proxy).await?;

        let hs = HandshakeRequest::new(vec![socks5::SOCKS5_AUTH_METHOD_NONE]);
        trace!("socks5 handshake {:?}", hs);
        hs.write_to(&mut s).await?;

        let hsp = HandshakeResponse::read_from(&mut s).await?;
        trace!("socks5 handshake response {:?}", hsp);
        if hsp.chosen_method != socks5::SOCKS5_AUTH_METHOD_NONE {
            return Err(Error::NoAcceptableMethod);
        }

        let h = TcpRequestHeader::new(command, addr);
        trace!("socks5 request {:?}", h);
        h.write_to(&mut s).await?;

        let hp = TcpResponseHeader::read_from(&mut s).await?;
        trace!("socks5 response {:?}", hp);
        match hp.reply {
            Reply::Succeeded => Ok((s, hp.address)),
            r => Err(Error::Reply(r)),
        }
    }
}

impl AsyncRead for Socks5TcpClient {
    fn poll_read(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for Socks5TcpClient {
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
