//! Service lifecycle
//!
//! [`ServiceCore`] ties the guarded processes and the local DNS forwarder to the service state. Starting goes
//! through these steps, any failure tears down what was started and ends in [`State::Stopped`]:
//!
//! 1. kill helpers left behind by a previous run
//! 2. flatten and save the custom rules, when they are the active route
//! 3. variant preparation
//! 4. proxy process, then the auxiliary processes
//! 5. local DNS forwarder

use std::{
    collections::HashSet,
    fmt,
    io,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use log::{debug, error, info, warn};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    acl::{Acl, AclStore, HttpRuleFetcher, Route, RuleFetcher},
    config::{ResolverKind, ServiceConfig},
    dns::{DnsPolicy, DnsServerOptions, LocalDnsServer, LocalResolver, RemoteDns},
    process::{self, FatalCallback, GuardedProcessPool, NoopProcessScanner, ProcessScanner},
};

pub use self::variant::{
    from_config as variant_from_config,
    AuxiliaryCommand,
    FdSender,
    ProxyVariant,
    ServiceVariant,
    TransproxyVariant,
    VpnVariant,
};

mod variant;

/// Proxy connection idle timeout, in seconds
const PROXY_TIMEOUT: &str = "600";

/// Service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Only reported when no service is bound
    Idle,
    Connecting,
    Connected,
    Stopping,
    Stopped,
}

impl State {
    /// Check if a stop request makes sense in this state
    pub fn can_stop(self) -> bool {
        matches!(self, State::Connecting | State::Connected)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            State::Idle => f.write_str("idle"),
            State::Connecting => f.write_str("connecting"),
            State::Connected => f.write_str("connected"),
            State::Stopping => f.write_str("stopping"),
            State::Stopped => f.write_str("stopped"),
        }
    }
}

/// Receives state changes of the service
pub trait ServiceCallback: Send + Sync {
    /// `msg` explains a stop caused by an error
    fn state_changed(&self, state: State, profile_name: &str, msg: Option<&str>);
}

#[derive(Default)]
struct Running {
    pool: Option<Arc<GuardedProcessPool>>,
    dns: Option<LocalDnsServer>,
}

/// Shared state and behavior of every service variant
pub struct ServiceCore {
    config: ServiceConfig,
    variant: Box<dyn ServiceVariant>,
    callback: Arc<dyn ServiceCallback>,
    scanner: Arc<dyn ProcessScanner>,
    fetcher: Arc<dyn RuleFetcher>,
    resolver: Option<Arc<LocalResolver>>,
    store: AclStore,
    state: watch::Sender<State>,
    connecting: Mutex<Option<JoinHandle<()>>>,
    running: tokio::sync::Mutex<Running>,
}

impl ServiceCore {
    pub fn new(
        config: ServiceConfig,
        variant: Box<dyn ServiceVariant>,
        callback: Arc<dyn ServiceCallback>,
    ) -> ServiceCore {
        let store = AclStore::new(config.acl.dir.clone());
        let (state, _) = watch::channel(State::Stopped);

        ServiceCore {
            config,
            variant,
            callback,
            scanner: Arc::new(NoopProcessScanner),
            fetcher: Arc::new(HttpRuleFetcher::new()),
            resolver: None,
            store,
            state,
            connecting: Mutex::new(None),
            running: tokio::sync::Mutex::new(Running::default()),
        }
    }

    /// Set the scanner cleaning up stale helpers
    pub fn set_scanner(&mut self, scanner: Arc<dyn ProcessScanner>) {
        self.scanner = scanner;
    }

    /// Set the fetcher of imported rulesets
    pub fn set_fetcher(&mut self, fetcher: Arc<dyn RuleFetcher>) {
        self.fetcher = fetcher;
    }

    /// Set the local resolver, replacing the one selected by the configuration
    pub fn set_resolver(&mut self, resolver: Arc<LocalResolver>) {
        self.resolver = Some(resolver);
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn acl_store(&self) -> &AclStore {
        &self.store
    }

    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Start the service in a background task
    ///
    /// Returns `false` if the service is not stopped.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if matches!(*state, State::Stopped | State::Idle) {
                *state = State::Connecting;
                started = true;
            }
            started
        });
        if !started {
            warn!("illegal state when starting {} service: {}", self.variant.name(), self.state());
            return false;
        }
        self.notify(State::Connecting, None);

        let mut connecting = self.connecting.lock().unwrap_or_else(PoisonError::into_inner);
        let core = self.clone();
        *connecting = Some(tokio::spawn(async move { core.connecting_task().await }));
        true
    }

    /// Stop the service, `msg` is reported along with [`State::Stopped`]
    ///
    /// Ignored while already stopping.
    pub async fn stop(&self, msg: Option<String>) {
        let mut stopping = false;
        self.state.send_if_modified(|state| {
            if *state != State::Stopping {
                *state = State::Stopping;
                stopping = true;
            }
            stopping
        });
        if !stopping {
            return;
        }
        self.notify(State::Stopping, None);

        let connecting = self.connecting.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = connecting {
            task.abort();
            let _ = task.await;
        }

        let (dns, pool) = {
            let mut running = self.running.lock().await;
            (running.dns.take(), running.pool.take())
        };
        if let Some(dns) = dns {
            dns.shutdown().await;
        }
        if let Some(pool) = pool {
            pool.kill_all().await;
        }

        // reported before being published, watchers may read what the callback recorded
        self.notify(State::Stopped, msg.as_deref());
        self.state.send_replace(State::Stopped);
        info!("{} service stopped", self.variant.name());
    }

    fn notify(&self, state: State, msg: Option<&str>) {
        self.callback.state_changed(state, &self.config.profile_name, msg);
    }

    async fn connecting_task(self: Arc<Self>) {
        match self.connect().await {
            Ok(()) => {
                let connected = self.state.send_if_modified(|state| {
                    if *state == State::Connecting {
                        *state = State::Connected;
                        true
                    } else {
                        false
                    }
                });
                if connected {
                    info!("{} service connected, profile: {}", self.variant.name(), self.config.profile_name);
                    self.notify(State::Connected, None);
                }
            }
            Err(err) => {
                error!("{} service failed to start, error: {}", self.variant.name(), err);
                // this task is ending, stop must not wait for it
                let _ = self.connecting.lock().unwrap_or_else(PoisonError::into_inner).take();
                self.stop(Some(format!("service failed: {err}"))).await;
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> io::Result<()> {
        let config = &self.config;
        let route = config.acl.route;

        let names = self.executable_names();
        match self.scanner.kill_by_executable_name(&names).await {
            Ok(0) => {}
            Ok(n) => debug!("killed {} stale processes", n),
            Err(err) => warn!("failed to clean up stale processes, error: {}", err),
        }

        if route == Route::CustomRules {
            let mut acl = Acl::custom_rules(config.acl.custom_rules.as_deref());
            acl.flatten(config.acl.flatten_depth, &*self.fetcher).await;
            self.store.save(Route::CustomRules.as_str(), &acl)?;
        }

        self.variant.pre_start(config).await?;

        let pool = Arc::new(GuardedProcessPool::new(config.sandbox_dir.clone(), self.fatal_callback()));
        self.running.lock().await.pool = Some(pool.clone());

        pool.start(proxy_command(config, &*self.variant, &self.store), None)?;
        for argv in &config.auxiliary {
            pool.start(argv.clone(), None)?;
        }
        for command in self.variant.auxiliary_commands(config) {
            pool.start(command.argv, command.on_restart)?;
        }

        let policy = if config.dns.forward_only {
            DnsPolicy::forward_only()
        } else if route.uses_acl() {
            DnsPolicy::from_acl(route, &self.store.load(route.as_str())?)
        } else {
            DnsPolicy::from_acl(route, &Acl::new())
        };
        let resolver = match self.resolver {
            Some(ref r) => r.clone(),
            None => Arc::new(match config.dns.resolver {
                ResolverKind::System => LocalResolver::System,
                ResolverKind::Hickory => LocalResolver::hickory_from_system_conf()?,
            }),
        };
        let remote = RemoteDns {
            dns: config.dns.remote_addr,
            proxy: config.dns_proxy(),
        };
        let options = DnsServerOptions {
            policy,
            tcp: config.dns.tcp,
            tcp_framing: config.dns.tcp_framing,
            timeout: config.dns.timeout,
        };

        let server = LocalDnsServer::bind(config.dns.bind_addr, resolver, remote, options)
            .await
            .map_err(|err| io::Error::new(err.kind(), format!("dns bind {}, {}", config.dns.bind_addr, err)))?;
        // owned by `running` before it starts reading, so stop() always shuts it down
        let mut running = self.running.lock().await;
        running.dns.insert(server).run()?;

        Ok(())
    }

    /// A process exiting too fast or failing to respawn stops the service
    fn fatal_callback(self: &Arc<Self>) -> FatalCallback {
        let core = Arc::downgrade(self);
        Arc::new(move |err: process::Error| {
            error!("guarded process {} failed, error: {}", err.name(), err);
            if let Some(core) = core.upgrade() {
                let msg = err.to_string();
                tokio::spawn(async move { core.stop(Some(msg)).await });
            }
        })
    }

    fn executable_names(&self) -> HashSet<String> {
        let mut names = HashSet::new();
        let mut add = |path: &Path| {
            if let Some(name) = path.file_name() {
                names.insert(name.to_string_lossy().into_owned());
            }
        };

        add(&self.config.proxy.executable);
        for program in self.config.auxiliary.iter().filter_map(|argv| argv.first()) {
            add(Path::new(program));
        }
        for path in self.variant.executables() {
            add(&path);
        }
        names
    }
}

/// Command line of the proxy process
pub fn proxy_command(config: &ServiceConfig, variant: &dyn ServiceVariant, store: &AclStore) -> Vec<String> {
    let proxy = &config.proxy;
    let mut argv = vec![
        proxy.executable.to_string_lossy().into_owned(),
        "-b".to_owned(),
        proxy.local_addr.ip().to_string(),
        "-l".to_owned(),
        proxy.local_addr.port().to_string(),
        "-t".to_owned(),
        PROXY_TIMEOUT.to_owned(),
        "-S".to_owned(),
        proxy.stat_file.to_string_lossy().into_owned(),
        "-c".to_owned(),
        proxy.config_file.to_string_lossy().into_owned(),
    ];
    variant.additional_arguments(&mut argv);
    argv.extend(proxy.extra_args.iter().cloned());

    let route = config.acl.route;
    if route.uses_acl() {
        argv.push("--acl".to_owned());
        argv.push(store.file(route.as_str()).to_string_lossy().into_owned());
    }
    // UDP relay is not needed when nothing bypasses the proxy
    if matches!(route, Route::All | Route::BypassLan) {
        argv.push("-D".to_owned());
    }
    if proxy.fast_open {
        argv.push("--fast-open".to_owned());
    }
    argv
}
