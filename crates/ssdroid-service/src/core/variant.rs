//! Service variants: plain proxy, VPN and transparent proxy

use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::trace;

use crate::{
    config::{ServiceConfig, VariantConfig},
    process::RestartCallback,
};

const PRIVATE_VLAN4_ROUTER: &str = "172.19.0.2";
const PRIVATE_VLAN6_ROUTER: &str = "fdfe:dcba:9876::2";

/// Platform hook run every time tun2socks is respawned, it hands the TUN file descriptor over again
pub type FdSender = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A command guarded after the proxy process
pub struct AuxiliaryCommand {
    pub argv: Vec<String>,
    pub on_restart: Option<RestartCallback>,
}

impl AuxiliaryCommand {
    pub fn new(argv: Vec<String>) -> AuxiliaryCommand {
        AuxiliaryCommand { argv, on_restart: None }
    }
}

/// What differs between the ways the service can run
#[async_trait]
pub trait ServiceVariant: Send + Sync {
    /// Short name, used in logs
    fn name(&self) -> &'static str;

    /// Helper executables this variant spawns
    fn executables(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Append variant specific flags to the proxy command line
    fn additional_arguments(&self, _argv: &mut Vec<String>) {}

    /// Prepare the environment, runs before any process is spawned
    async fn pre_start(&self, _config: &ServiceConfig) -> io::Result<()> {
        Ok(())
    }

    /// Commands started after the proxy
    fn auxiliary_commands(&self, _config: &ServiceConfig) -> Vec<AuxiliaryCommand> {
        Vec::new()
    }
}

/// Local SOCKS5 proxy only
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyVariant;

impl ServiceVariant for ProxyVariant {
    fn name(&self) -> &'static str {
        "proxy"
    }
}

/// System wide VPN, traffic of the TUN device is fed to the proxy by tun2socks
pub struct VpnVariant {
    tun2socks: PathBuf,
    mtu: u16,
    ipv6: bool,
    fd_sender: Option<FdSender>,
}

impl VpnVariant {
    pub fn new(tun2socks: PathBuf, mtu: u16, ipv6: bool) -> VpnVariant {
        VpnVariant {
            tun2socks,
            mtu,
            ipv6,
            fd_sender: None,
        }
    }

    /// Set the hook handing the TUN file descriptor to a respawned tun2socks
    pub fn set_fd_sender(&mut self, sender: FdSender) {
        self.fd_sender = Some(sender);
    }

    fn tun2socks_command(&self, config: &ServiceConfig) -> Vec<String> {
        let mut argv = vec![
            self.tun2socks.to_string_lossy().into_owned(),
            "--netif-ipaddr".to_owned(),
            PRIVATE_VLAN4_ROUTER.to_owned(),
            "--socks-server-addr".to_owned(),
            config.proxy.local_addr.to_string(),
            "--tunmtu".to_owned(),
            self.mtu.to_string(),
            "--sock-path".to_owned(),
            "sock_path".to_owned(),
            "--dnsgw".to_owned(),
            format!("127.0.0.1:{}", config.dns.bind_addr.port()),
            "--loglevel".to_owned(),
            "warning".to_owned(),
        ];
        if self.ipv6 {
            argv.push("--netif-ip6addr".to_owned());
            argv.push(PRIVATE_VLAN6_ROUTER.to_owned());
        }
        argv.push("--enable-udprelay".to_owned());
        argv
    }
}

impl ServiceVariant for VpnVariant {
    fn name(&self) -> &'static str {
        "vpn"
    }

    fn executables(&self) -> Vec<PathBuf> {
        vec![self.tun2socks.clone()]
    }

    fn additional_arguments(&self, argv: &mut Vec<String>) {
        argv.push("-V".to_owned());
    }

    fn auxiliary_commands(&self, config: &ServiceConfig) -> Vec<AuxiliaryCommand> {
        let on_restart = self.fd_sender.clone().map(|sender| -> RestartCallback { Box::new(move || sender()) });
        vec![AuxiliaryCommand {
            argv: self.tun2socks_command(config),
            on_restart,
        }]
    }
}

/// Transparent proxy, iptables redirected connections are handed to the proxy by redsocks
#[derive(Debug, Clone)]
pub struct TransproxyVariant {
    redsocks: PathBuf,
    local_port: u16,
}

impl TransproxyVariant {
    pub const CONFIG_FILE: &'static str = "redsocks.conf";

    pub fn new(redsocks: PathBuf, local_port: u16) -> TransproxyVariant {
        TransproxyVariant { redsocks, local_port }
    }

    fn redsocks_config(&self, config: &ServiceConfig) -> String {
        format!(
            "base {{
 log_debug = off;
 log_info = off;
 log = stderr;
 daemon = off;
 redirector = iptables;
}}
redsocks {{
 local_ip = 127.0.0.1;
 local_port = {};
 ip = {};
 port = {};
 type = socks5;
}}
",
            self.local_port,
            config.proxy.local_addr.ip(),
            config.proxy.local_addr.port()
        )
    }
}

#[async_trait]
impl ServiceVariant for TransproxyVariant {
    fn name(&self) -> &'static str {
        "transproxy"
    }

    fn executables(&self) -> Vec<PathBuf> {
        vec![self.redsocks.clone()]
    }

    async fn pre_start(&self, config: &ServiceConfig) -> io::Result<()> {
        tokio::fs::create_dir_all(&config.sandbox_dir).await?;
        let path = config.sandbox_dir.join(Self::CONFIG_FILE);
        trace!("writing redsocks configuration to {:?}", path);
        tokio::fs::write(path, self.redsocks_config(config)).await
    }

    fn auxiliary_commands(&self, _config: &ServiceConfig) -> Vec<AuxiliaryCommand> {
        vec![AuxiliaryCommand::new(vec![
            self.redsocks.to_string_lossy().into_owned(),
            "-c".to_owned(),
            Self::CONFIG_FILE.to_owned(),
        ])]
    }
}

/// Build the variant selected by the configuration
pub fn from_config(variant: &VariantConfig) -> Box<dyn ServiceVariant> {
    match *variant {
        VariantConfig::Proxy => Box::new(ProxyVariant),
        VariantConfig::Vpn {
            ref tun2socks,
            mtu,
            ipv6,
        } => Box::new(VpnVariant::new(tun2socks.clone(), mtu, ipv6)),
        VariantConfig::Transproxy { ref redsocks, local_port } => {
            Box::new(TransproxyVariant::new(redsocks.clone(), local_port))
        }
    }
}
