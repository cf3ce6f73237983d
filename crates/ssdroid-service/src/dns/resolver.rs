//! Resolvers answering queries on the local (non proxied) network

use std::{
    fmt::{self, Debug},
    io::{self, ErrorKind},
    net::IpAddr,
};

use async_trait::async_trait;
use hickory_resolver::{error::ResolveErrorKind, TokioAsyncResolver};
use log::trace;
use tokio::net::lookup_host;

/// Platform provided resolver, for example one bound to the currently active network
#[async_trait]
pub trait LocalResolve: Send + Sync {
    /// Resolve `host` to its addresses
    ///
    /// An unknown host is reported as [`ErrorKind::NotFound`].
    async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Local resolvers, selected once at startup
pub enum LocalResolver {
    /// tokio's builtin resolver, `getaddrinfo` in the blocking pool
    System,
    /// hickory-dns resolver configured from the system configuration
    Hickory(TokioAsyncResolver),
    /// Platform callback
    Custom(Box<dyn LocalResolve>),
}

impl Default for LocalResolver {
    fn default() -> LocalResolver {
        LocalResolver::System
    }
}

impl Debug for LocalResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            LocalResolver::System => f.write_str("System"),
            LocalResolver::Hickory(..) => f.write_str("Hickory(..)"),
            LocalResolver::Custom(..) => f.write_str("Custom(..)"),
        }
    }
}

impl LocalResolver {
    /// hickory-dns resolver reading `/etc/resolv.conf` (or the platform equivalent)
    pub fn hickory_from_system_conf() -> io::Result<LocalResolver> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|err| io::Error::new(ErrorKind::Other, format!("hickory resolver init error: {err}")))?;
        Ok(LocalResolver::Hickory(resolver))
    }

    pub fn custom_resolver<R>(custom: R) -> LocalResolver
    where
        R: LocalResolve + 'static,
    {
        LocalResolver::Custom(Box::new(custom))
    }

    /// Resolve `host`, an unknown host is [`ErrorKind::NotFound`]
    pub async fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match *self {
            LocalResolver::System => {
                trace!("DNS resolving {} with tokio", host);
                match lookup_host((host, 0)).await {
                    Ok(addrs) => Ok(addrs.map(|a| a.ip()).collect()),
                    Err(err) => Err(io::Error::new(
                        ErrorKind::NotFound,
                        format!("dns resolve {host} error: {err}"),
                    )),
                }
            }
            LocalResolver::Hickory(ref resolver) => {
                trace!("DNS resolving {} with hickory-dns", host);
                match resolver.lookup_ip(host).await {
                    Ok(lookup) => Ok(lookup.iter().collect()),
                    Err(err) => {
                        let kind = match err.kind() {
                            ResolveErrorKind::NoRecordsFound { .. } => ErrorKind::NotFound,
                            _ => ErrorKind::Other,
                        };
                        Err(io::Error::new(kind, format!("dns resolve {host} error: {err}")))
                    }
                }
            }
            LocalResolver::Custom(ref resolver) => {
                trace!("DNS resolving {} with customized resolver", host);
                resolver.resolve(host).await
            }
        }
    }
}
