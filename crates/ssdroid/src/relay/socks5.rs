//! SOCKS5 wire format (RFC1928), the subset used for relaying DNS through the local proxy
//!
//! Only the `NO AUTHENTICATION` method and the `CONNECT` / `UDP ASSOCIATE` commands are modelled.

use std::{
    fmt::{self, Debug, Formatter},
    io::{self, ErrorKind},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use self::consts::{SOCKS5_AUTH_METHOD_NONE, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE};

#[rustfmt::skip]
mod consts {
    pub const SOCKS5_VERSION:                    u8 = 0x05;

    pub const SOCKS5_AUTH_METHOD_NONE:           u8 = 0x00;
    pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

    pub const SOCKS5_CMD_TCP_CONNECT:            u8 = 0x01;
    pub const SOCKS5_CMD_UDP_ASSOCIATE:          u8 = 0x03;

    pub const SOCKS5_ADDR_TYPE_IPV4:             u8 = 0x01;
    pub const SOCKS5_ADDR_TYPE_DOMAIN_NAME:      u8 = 0x03;
    pub const SOCKS5_ADDR_TYPE_IPV6:             u8 = 0x04;

    pub const SOCKS5_REPLY_SUCCEEDED:            u8 = 0x00;
    pub const SOCKS5_REPLY_GENERAL_FAILURE:      u8 = 0x01;
    pub const SOCKS5_REPLY_CONNECTION_REFUSED:   u8 = 0x05;
    pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
}

/// SOCKS5 command
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Command {
    /// CONNECT, TCP tunnel
    TcpConnect,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl Command {
    #[inline]
    #[rustfmt::skip]
    fn as_u8(self) -> u8 {
        match self {
            Command::TcpConnect   => consts::SOCKS5_CMD_TCP_CONNECT,
            Command::UdpAssociate => consts::SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }

    #[inline]
    #[rustfmt::skip]
    fn from_u8(code: u8) -> Option<Command> {
        match code {
            consts::SOCKS5_CMD_TCP_CONNECT   => Some(Command::TcpConnect),
            consts::SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _                                => None,
        }
    }
}

/// SOCKS5 reply code
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    ConnectionRefused,
    CommandNotSupported,
    Other(u8),
}

impl Reply {
    #[rustfmt::skip]
    pub fn as_u8(self) -> u8 {
        match self {
            Reply::Succeeded           => consts::SOCKS5_REPLY_SUCCEEDED,
            Reply::GeneralFailure      => consts::SOCKS5_REPLY_GENERAL_FAILURE,
            Reply::ConnectionRefused   => consts::SOCKS5_REPLY_CONNECTION_REFUSED,
            Reply::CommandNotSupported => consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
            Reply::Other(c)            => c,
        }
    }

    #[rustfmt::skip]
    pub fn from_u8(code: u8) -> Reply {
        match code {
            consts::SOCKS5_REPLY_SUCCEEDED             => Reply::Succeeded,
            consts::SOCKS5_REPLY_GENERAL_FAILURE       => Reply::GeneralFailure,
            consts::SOCKS5_REPLY_CONNECTION_REFUSED    => Reply::ConnectionRefused,
            consts::SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => Reply::CommandNotSupported,
            _                                          => Reply::Other(code),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Reply::Succeeded => f.write_str("succeeded"),
            Reply::GeneralFailure => f.write_str("general failure"),
            Reply::ConnectionRefused => f.write_str("connection refused"),
            Reply::CommandNotSupported => f.write_str("command not supported"),
            Reply::Other(c) => write!(f, "reply {c:#x}"),
        }
    }
}

/// SOCKS5 protocol error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] io::Error),
    #[error("address type {0:#x} not supported")]
    AddressTypeNotSupported(u8),
    #[error("address domain name must be UTF-8 encoding")]
    AddressDomainInvalidEncoding,
    #[error("unsupported socks version {0:#x}")]
    UnsupportedSocksVersion(u8),
    #[error("unsupported command {0:#x}")]
    UnsupportedCommand(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("{0}")]
    Reply(Reply),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::IoError(err) => err,
            e => io::Error::new(ErrorKind::Other, e),
        }
    }
}

/// SOCKS5 address
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl Address {
    /// Parse from the front of a datagram
    pub fn read_cursor<T: AsRef<[u8]>>(cur: &mut io::Cursor<T>) -> Result<Address, Error> {
        let short = || Error::IoError(io::Error::new(ErrorKind::UnexpectedEof, "address truncated"));

        if cur.remaining() < 1 {
            return Err(short());
        }
        let atyp = cur.get_u8();
        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                if cur.remaining() < 4 + 2 {
                    return Err(short());
                }
                let addr = Ipv4Addr::from(cur.get_u32());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                if cur.remaining() < 16 + 2 {
                    return Err(short());
                }
                let addr = Ipv6Addr::from(cur.get_u128());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                if cur.remaining() < 1 {
                    return Err(short());
                }
                let len = cur.get_u8() as usize;
                if cur.remaining() < len + 2 {
                    return Err(short());
                }
                let mut raw = vec![0u8; len];
                cur.copy_to_slice(&mut raw);
                let port = cur.get_u16();
                let domain = String::from_utf8(raw).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                Ok(Address::DomainNameAddress(domain, port))
            }
            _ => Err(Error::AddressTypeNotSupported(atyp)),
        }
    }

    /// Parse from a stream
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, Error>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;
        match atyp {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 4 + 2];
                stream.read_exact(&mut buf).await?;
                let mut cur = &buf[..];
                let addr = Ipv4Addr::from(cur.get_u32());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(addr, port))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 16 + 2];
                stream.read_exact(&mut buf).await?;
                let mut cur = &buf[..];
                let addr = Ipv6Addr::from(cur.get_u128());
                let port = cur.get_u16();
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let len = stream.read_u8().await? as usize;
                let mut raw = vec![0u8; len + 2];
                stream.read_exact(&mut raw).await?;
                let port = u16::from_be_bytes([raw[len], raw[len + 1]]);
                raw.truncate(len);
                let domain = String::from_utf8(raw).map_err(|_| Error::AddressDomainInvalidEncoding)?;
                Ok(Address::DomainNameAddress(domain, port))
            }
            _ => Err(Error::AddressTypeNotSupported(atyp)),
        }
    }

    /// Serialize into `buf`
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref domain, port) => {
                assert!(domain.len() <= u8::MAX as usize, "domain name longer than 255 bytes");
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Length in bytes when serialized
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref domain, ..) => 1 + 1 + domain.len() + 2,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Address {
        Address::SocketAddress(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Address {
        Address::DomainNameAddress(domain, port)
    }
}

/// Method selection request
///
/// ```plain
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct HandshakeRequest {
    pub methods: Vec<u8>,
}

impl HandshakeRequest {
    pub fn new(methods: Vec<u8>) -> HandshakeRequest {
        HandshakeRequest { methods }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeRequest, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let mut methods = vec![0u8; buf[1] as usize];
        r.read_exact(&mut methods).await?;
        Ok(HandshakeRequest { methods })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.methods.len() as u8]);
        buf.put_slice(&self.methods);
        w.write_all(&buf).await
    }
}

/// Method selection response
///
/// ```plain
/// +----+--------+
/// |VER | METHOD |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
#[derive(Clone, Debug, Copy)]
pub struct HandshakeResponse {
    pub chosen_method: u8,
}

impl HandshakeResponse {
    pub fn new(chosen_method: u8) -> HandshakeResponse {
        HandshakeResponse { chosen_method }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<HandshakeResponse, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        Ok(HandshakeResponse { chosen_method: buf[1] })
    }

    pub async fn write_to<W>(self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&[consts::SOCKS5_VERSION, self.chosen_method]).await
    }
}

/// Request header after method selection
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpRequestHeader {
    pub command: Command,
    pub address: Address,
}

impl TcpRequestHeader {
    pub fn new(command: Command, address: Address) -> TcpRequestHeader {
        TcpRequestHeader { command, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpRequestHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let command = Command::from_u8(buf[1]).ok_or(Error::UnsupportedCommand(buf[1]))?;
        let address = Address::read_from(r).await?;
        Ok(TcpRequestHeader { command, address })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.command.as_u8(), 0x00]);
        self.address.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }
}

/// Reply header
///
/// ```plain
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct TcpResponseHeader {
    pub reply: Reply,
    pub address: Address,
}

impl TcpResponseHeader {
    pub fn new(reply: Reply, address: Address) -> TcpResponseHeader {
        TcpResponseHeader { reply, address }
    }

    pub async fn read_from<R>(r: &mut R) -> Result<TcpResponseHeader, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).await?;
        if buf[0] != consts::SOCKS5_VERSION {
            return Err(Error::UnsupportedSocksVersion(buf[0]));
        }
        let address = Address::read_from(r).await?;
        Ok(TcpResponseHeader {
            reply: Reply::from_u8(buf[1]),
            address,
        })
    }

    pub async fn write_to<W>(&self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(3 + self.address.serialized_len());
        buf.put_slice(&[consts::SOCKS5_VERSION, self.reply.as_u8(), 0x00]);
        self.address.write_to_buf(&mut buf);
        w.write_all(&buf).await
    }
}

/// Header prepended to every relayed datagram
///
/// ```plain
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
#[derive(Clone, Debug)]
pub struct UdpAssociateHeader {
    /// Fragment number, only `0` (standalone datagram) is produced
    pub frag: u8,
    pub address: Address,
}

impl UdpAssociateHeader {
    pub fn new(frag: u8, address: Address) -> UdpAssociateHeader {
        UdpAssociateHeader { frag, address }
    }

    /// Parse the header from the front of a datagram, the cursor is left at the payload
    pub fn read_cursor<T: AsRef<[u8]>>(cur: &mut io::Cursor<T>) -> Result<UdpAssociateHeader, Error> {
        if cur.remaining() < 3 {
            return Err(Error::IoError(io::Error::new(
                ErrorKind::UnexpectedEof,
                "udp associate header truncated",
            )));
        }
        cur.advance(2);
        let frag = cur.get_u8();
        let address = Address::read_cursor(cur)?;
        Ok(UdpAssociateHeader { frag, address })
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&[0x00, 0x00, self.frag]);
        self.address.write_to_buf(buf);
    }

    pub fn serialized_len(&self) -> usize {
        3 + self.address.serialized_len()
    }
}
