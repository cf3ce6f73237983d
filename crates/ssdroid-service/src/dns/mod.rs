//! Local DNS forwarder and its resolvers

use std::time::Duration;

pub use self::{
    policy::DnsPolicy,
    resolver::{LocalResolve, LocalResolver},
    server::{DnsServerOptions, LocalDnsServer, RemoteDns, TcpFraming},
    upstream::{DnsClient, ResolveError},
};

pub mod policy;
pub mod resolver;
pub mod server;
pub mod upstream;

/// Bound of a local resolution and of a relay to the remote DNS
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL of the records in locally answered responses
pub const DNS_TTL: u32 = 120;
