//! Local DNS forwarder
//!
//! Answers `A` queries with the local resolver when the policy allows it, everything else is relayed to the
//! remote DNS server, usually through the local SOCKS5 proxy. No cache is kept, the local resolver may change
//! with the active network.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::Future;
use hickory_resolver::proto::{
    op::{Header, Message, MessageType, OpCode, ResponseCode},
    rr::{
        rdata::{A, AAAA},
        RData, Record, RecordType,
    },
};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle, time};

use super::{
    policy::DnsPolicy,
    resolver::LocalResolver,
    upstream::{DnsClient, ResolveError},
    DNS_TIMEOUT, DNS_TTL,
};

/// Receive buffer of the listening socket
const LISTENER_BUFFER_SIZE: usize = 65535;

/// How a query is written to a TCP connection to the remote DNS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpFraming {
    /// The bare UDP message, the reply is read with a single read
    #[default]
    Raw,
    /// Standard DNS over TCP, 2 bytes length before each message
    LengthPrefixed,
}

/// The remote DNS server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteDns {
    /// Address of the remote DNS server
    pub dns: SocketAddr,
    /// SOCKS5 proxy to reach it through, `None` connects directly
    pub proxy: Option<SocketAddr>,
}

/// Forwarder behavior
#[derive(Debug, Clone)]
pub struct DnsServerOptions {
    pub policy: DnsPolicy,
    /// Relay over TCP instead of UDP
    pub tcp: bool,
    pub tcp_framing: TcpFraming,
    /// Bound of a local resolution and of a relay
    pub timeout: Duration,
}

impl Default for DnsServerOptions {
    fn default() -> DnsServerOptions {
        DnsServerOptions {
            policy: DnsPolicy::default(),
            tcp: true,
            tcp_framing: TcpFraming::Raw,
            timeout: DNS_TIMEOUT,
        }
    }
}

struct QueryHandler {
    resolver: Arc<LocalResolver>,
    remote: RemoteDns,
    options: DnsServerOptions,
}

impl QueryHandler {
    /// Produce the reply to `query`, `None` drops the query
    async fn handle(&self, peer_addr: SocketAddr, query: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(query) {
            Ok(m) => m,
            Err(err) => {
                debug!("dns udp {} query message parse error: {}, forwarding", peer_addr, err);
                return self.forward(peer_addr, query, None).await;
            }
        };

        if let Some(response) = self.local_answer(&request).await {
            match response.to_vec() {
                Ok(buf) => return Some(buf),
                Err(err) => error!("dns udp {} local response encode error: {}", peer_addr, err),
            }
        }

        self.forward(peer_addr, query, Some(&request)).await
    }

    async fn local_answer(&self, request: &Message) -> Option<Message> {
        let policy = &self.options.policy;
        if policy.forward_only {
            return None;
        }

        if request.op_code() != OpCode::Query
            || request.message_type() != MessageType::Query
            || request.response_code() != ResponseCode::NoError
        {
            return None;
        }

        let question = match request.queries() {
            [q] if q.query_type() == RecordType::A => q,
            _ => return None,
        };

        let mut host = question.name().to_ascii();
        if host.ends_with('.') {
            host.pop();
        }

        if policy.is_forced_remote(&host) {
            trace!("dns {} is forced to remote", host);
            return None;
        }

        let addrs = match time::timeout(self.options.timeout, self.resolver.resolve(&host)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(err)) => {
                debug!("dns local resolve {} failed, error: {}, forwarding", host, err);
                return None;
            }
            Err(..) => {
                debug!("dns local resolve {} timed out, forwarding", host);
                return None;
            }
        };

        if addrs.is_empty() || !policy.accepts_local(&addrs) {
            trace!("dns local answer {} {:?} not accepted", host, addrs);
            return None;
        }

        let mut header = Header::response_from_request(request.header());
        header.set_recursion_available(true);

        let mut response = Message::new();
        response.set_header(header);
        response.add_query(question.clone());
        for addr in addrs {
            let rdata = match addr {
                IpAddr::V4(v4) => RData::A(A(v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
            };
            response.add_answer(Record::from_rdata(question.name().clone(), DNS_TTL, rdata));
        }

        trace!("dns {} answered locally", host);
        Some(response)
    }

    async fn forward(&self, peer_addr: SocketAddr, query: &[u8], request: Option<&Message>) -> Option<Vec<u8>> {
        let err = match time::timeout(self.options.timeout, self.relay(query)).await {
            Ok(Ok(reply)) => return Some(reply),
            Ok(Err(err)) => io::Error::from(err),
            Err(..) => io::ErrorKind::TimedOut.into(),
        };

        error!(
            "dns udp {} relay to {} failed, error: {}",
            peer_addr, self.remote.dns, err
        );

        let response = server_failure(request?)?;
        match response.to_vec() {
            Ok(buf) => Some(buf),
            Err(err) => {
                error!("dns udp {} SERVFAIL encode error: {}", peer_addr, err);
                None
            }
        }
    }

    async fn relay(&self, query: &[u8]) -> Result<Vec<u8>, ResolveError> {
        let mut client = DnsClient::connect(&self.remote, self.options.tcp).await?;
        client.relay(query, self.options.tcp_framing).await
    }
}

/// SERVFAIL reply to `request`, `None` if it has no question to echo
fn server_failure(request: &Message) -> Option<Message> {
    let question = request.queries().first()?;

    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);

    let mut response = Message::new();
    response.set_header(header);
    response.add_query(question.clone());
    Some(response)
}

/// Tasks handling queries, abortable as a whole
#[derive(Clone, Default)]
struct InFlight {
    next_id: Arc<AtomicU64>,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl InFlight {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();

        // The task removes itself, it cannot do so before being inserted while the lock is held
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            fut.await;
            tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        });
        guard.insert(id, handle);
    }

    fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn abort(&self) {
        let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handle) in guard.drain() {
            handle.abort();
        }
    }

    async fn abort_all(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain().map(|(_, h)| h).collect()
        };
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// A DNS conditional forwarder listening on a UDP socket
pub struct LocalDnsServer {
    socket: Option<Arc<UdpSocket>>,
    local_addr: SocketAddr,
    handler: Arc<QueryHandler>,
    inflight: InFlight,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl LocalDnsServer {
    /// Bind the listening socket, queries are not read until [`LocalDnsServer::run`]
    pub async fn bind(
        bind_addr: SocketAddr,
        resolver: Arc<LocalResolver>,
        remote: RemoteDns,
        options: DnsServerOptions,
    ) -> io::Result<LocalDnsServer> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(LocalDnsServer {
            socket: Some(Arc::new(socket)),
            local_addr,
            handler: Arc::new(QueryHandler {
                resolver,
                remote,
                options,
            }),
            inflight: InFlight::default(),
            shutdown_tx,
            accept_task: None,
        })
    }

    /// Address of the listening socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of queries being handled
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Start reading queries in a background task
    pub fn run(&mut self) -> io::Result<()> {
        let socket = match self.socket.take() {
            Some(s) => s,
            None => return Err(io::Error::new(io::ErrorKind::Other, "dns server is already running")),
        };

        info!(
            "ssdroid dns UDP listening on {}, remote: {}, proxy: {:?}, tcp: {}",
            self.local_addr, self.handler.remote.dns, self.handler.remote.proxy, self.handler.options.tcp
        );

        let accept = accept_loop(
            socket,
            self.handler.clone(),
            self.inflight.clone(),
            self.shutdown_tx.subscribe(),
        );
        self.accept_task = Some(tokio::spawn(accept));
        Ok(())
    }

    /// Stop accepting, abort every query being handled and close the socket
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.accept_task.take() {
            if let Err(err) = task.await {
                error!("dns accept task failed, error: {}", err);
            }
        }
        self.inflight.abort_all().await;
        debug!("dns server {} closed", self.local_addr);
    }
}

impl Drop for LocalDnsServer {
    fn drop(&mut self) {
        // dropped without shutdown(), the accept loop must not outlive its owner
        if let Some(task) = self.accept_task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
        }
        self.inflight.abort();
    }
}

async fn accept_loop(
    listener: Arc<UdpSocket>,
    handler: Arc<QueryHandler>,
    inflight: InFlight,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; LISTENER_BUFFER_SIZE];
    loop {
        let (n, peer_addr) = tokio::select! {
            _ = shutdown_rx.changed() => break,
            r = listener.recv_from(&mut buffer) => match r {
                Ok(s) => s,
                Err(err) => {
                    error!("dns udp recv_from failed with error: {}", err);
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            },
        };

        let query = Bytes::copy_from_slice(&buffer[..n]);
        let listener = listener.clone();
        let handler = handler.clone();
        inflight.spawn(async move {
            if let Some(reply) = handler.handle(peer_addr, &query).await {
                if let Err(err) = listener.send_to(&reply, peer_addr).await {
                    warn!("dns udp {} send reply failed, error: {}", peer_addr, err);
                }
            }
        });
    }
    trace!("dns accept loop stopped");
}
