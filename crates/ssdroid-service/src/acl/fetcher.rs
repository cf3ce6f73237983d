//! Fetching imported ACL rulesets

use std::{
    io::{self, ErrorKind},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::{body::Bytes, header, Request};
use hyper_util::rt::TokioIo;
use log::{debug, trace, warn};
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time,
};
use tokio_rustls::TlsConnector;
use url::Url;

/// Source of imported rulesets, the content behind an `#IMPORT_URL`
#[async_trait]
pub trait RuleFetcher: Send + Sync {
    /// Fetch the ruleset text at `url`
    async fn fetch(&self, url: &Url) -> io::Result<String>;
}

/// Fetches `http://`, `https://` and `file://` URLs
pub struct HttpRuleFetcher {
    timeout: Duration,
    max_body_size: usize,
    tls: TlsConnector,
}

impl HttpRuleFetcher {
    /// Default timeout of a whole fetch
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> HttpRuleFetcher {
        HttpRuleFetcher::with_timeout(HttpRuleFetcher::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> HttpRuleFetcher {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        HttpRuleFetcher {
            timeout,
            max_body_size: 16 * 1024 * 1024,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Bound the size of a fetched ruleset, bodies are never buffered past it
    pub fn with_max_body_size(mut self, max_body_size: usize) -> HttpRuleFetcher {
        self.max_body_size = max_body_size;
        self
    }

    async fn fetch_http(&self, url: &Url) -> io::Result<String> {
        let host = url
            .host_str()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("{url} has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("{url} has no port")))?;

        // IPv6 literals come with brackets in `host_str`
        let connect_host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((connect_host, port)).await?;

        if url.scheme() == "https" {
            let server_name = ServerName::try_from(connect_host.to_owned())
                .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
            let stream = self.tls.connect(server_name, stream).await?;
            self.send_request(url, host, stream).await
        } else {
            self.send_request(url, host, stream).await
        }
    }

    async fn send_request<S>(&self, url: &Url, host: &str, stream: S) -> io::Result<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(io::Error::other)?;

        tokio::spawn(async move {
            if let Err(err) = conn.await {
                warn!("ACL import connection error: {}", err);
            }
        });

        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        let request = Request::get(path)
            .header(header::HOST, host)
            .header(header::USER_AGENT, concat!("ssdroid/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(io::Error::other)?;

        let response = sender.send_request(request).await.map_err(io::Error::other)?;
        let status = response.status();
        if !status.is_success() {
            return Err(io::Error::other(format!("{url} responded {status}")));
        }

        let body = match Limited::new(response.into_body(), self.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) if err.is::<LengthLimitError>() => {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("{url} body exceeds {} bytes", self.max_body_size),
                ));
            }
            Err(err) => return Err(io::Error::other(err)),
        };

        trace!("fetched {} bytes from {}", body.len(), url);
        String::from_utf8(body.to_vec()).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
    }
}

impl Default for HttpRuleFetcher {
    fn default() -> HttpRuleFetcher {
        HttpRuleFetcher::new()
    }
}

#[async_trait]
impl RuleFetcher for HttpRuleFetcher {
    async fn fetch(&self, url: &Url) -> io::Result<String> {
        debug!("fetching ACL {}", url);

        match url.scheme() {
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("{url} is not a local path")))?;
                tokio::fs::read_to_string(path).await
            }
            "http" | "https" => match time::timeout(self.timeout, self.fetch_http(url)).await {
                Ok(r) => r,
                Err(..) => Err(io::Error::new(ErrorKind::TimedOut, format!("fetching {url} timed out"))),
            },
            scheme => Err(io::Error::new(
                ErrorKind::Unsupported,
                format!("unsupported ACL import scheme {scheme}"),
            )),
        }
    }
}
