//! SOCKS5 UDP client

use std::io::{self, Cursor, ErrorKind};

use bytes::{BufMut, BytesMut};
use ssdroid::relay::socks5::{Address, Error, UdpAssociateHeader};
use tokio::net::{ToSocketAddrs, UdpSocket};

use super::tcp_client::Socks5TcpClient;

/// A UDP socket relaying datagrams through a SOCKS5 UDP ASSOCIATE
pub struct Socks5UdpClient {
    socket: UdpSocket,
    // The association lives as long as this control connection
    assoc_client: Option<Socks5TcpClient>,
}

impl Socks5UdpClient {
    /// Bind the local UDP socket
    pub async fn bind<A>(addrs: A) -> io::Result<Socks5UdpClient>
    where
        A: ToSocketAddrs,
    {
        Ok(Socks5UdpClient {
            socket: UdpSocket::bind(addrs).await?,
            assoc_client: None,
        })
    }

    /// Associate with `proxy`, datagrams are exchanged with the relay address it returns
    pub async fn associate<P>(&mut self, proxy: P) -> Result<(), Error>
    where
        P: ToSocketAddrs,
    {
        if self.assoc_client.is_some() {
            return Err(io::Error::new(ErrorKind::Other, "udp is associated").into());
        }

        let local_addr = self.socket.local_addr()?;
        let (assoc_client, relay_addr) = Socks5TcpClient::udp_associate(local_addr, proxy).await?;
        match relay_addr {
            Address::SocketAddress(sa) => self.socket.connect(sa).await?,
            Address::DomainNameAddress(ref dname, port) => self.socket.connect((dname.as_str(), port)).await?,
        }

        self.assoc_client = Some(assoc_client);
        Ok(())
    }

    /// Send `buf` to `target` through the relay, returns the payload bytes sent
    pub async fn send_to<A>(&self, frag: u8, buf: &[u8], target: A) -> Result<usize, Error>
    where
        A: Into<Address>,
    {
        self.check_associated()?;

        let header = UdpAssociateHeader::new(frag, target.into());
        let header_len = header.serialized_len();
        let mut send_buf = BytesMut::with_capacity(header_len + buf.len());
        header.write_to_buf(&mut send_buf);
        send_buf.put_slice(buf);

        let n = self.socket.send(&send_buf).await?;
        Ok(n.saturating_sub(header_len))
    }

    /// Receive one datagram, the payload is moved to the front of `recv_buf`
    ///
    /// Returns the payload length, fragment number and origin address.
    pub async fn recv_from(&self, recv_buf: &mut [u8]) -> Result<(usize, u8, Address), Error> {
        self.check_associated()?;

        let n = self.socket.recv(recv_buf).await?;
        let mut cur = Cursor::new(&recv_buf[..n]);
        let header = UdpAssociateHeader::read_cursor(&mut cur)?;
        let pos = cur.position() as usize;

        recv_buf.copy_within(pos..n, 0);
        Ok((n - pos, header.frag, header.address))
    }

    fn check_associated(&self) -> io::Result<()> {
        if self.assoc_client.is_none() {
            return Err(io::Error::new(ErrorKind::Other, "udp not associated"));
        }
        Ok(())
    }
}
