//! This is a mod for storing and parsing the service configuration
//!
//! The configuration file is JSON5:
//!
//! ```ignore
//! {
//!     "profile_name": "my-server",
//!     "sandbox_dir": "/data/ssdroid",
//!     "proxy": {
//!         "executable": "/opt/ssdroid/libsslocal.so",
//!         "local_address": "127.0.0.1",
//!         "local_port": 1080,
//!         "config": "/data/ssdroid/shadowsocks.conf",
//!         "stat": "/data/ssdroid/stat_main"
//!     },
//!     "dns": {
//!         "local_address": "127.0.0.1",
//!         "local_port": 5450,
//!         "remote_dns": "8.8.8.8",
//!         "tcp": true
//!     },
//!     "acl": {
//!         "dir": "/data/ssdroid/acl",
//!         "route": "bypass-lan-china"
//!     },
//!     "mode": "vpn",
//!     "vpn": {
//!         "tun2socks": "/opt/ssdroid/libtun2socks.so"
//!     }
//! }
//! ```

use std::{
    fmt::{self, Debug, Display, Formatter},
    fs::OpenOptions,
    io::Read,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    acl::{Route, CUSTOM_RULES_FLATTEN_DEPTH},
    dns::{TcpFraming, DNS_TIMEOUT},
};

const DEFAULT_LOCAL_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEFAULT_PROXY_PORT: u16 = 1080;
const DEFAULT_DNS_PORT: u16 = 5450;
const DEFAULT_REMOTE_DNS: &str = "8.8.8.8";
const DEFAULT_VPN_MTU: u16 = 1500;
const DEFAULT_TRANSPROXY_PORT: u16 = 8200;

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    profile_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sandbox_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<SSProxyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auxiliary: Option<Vec<Vec<String>>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    dns: Option<SSDnsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    acl: Option<SSAclConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vpn: Option<SSVpnConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transproxy: Option<SSTransproxyConfig>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSProxyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fast_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSDnsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    local_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    forward_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tcp_framing: Option<TcpFraming>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSAclConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    route: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flatten_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_rules: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSVpnConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    tun2socks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ipv6: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSTransproxyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    redsocks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_port: Option<u16>,
}

/// The proxy process
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub executable: PathBuf,
    /// Address of its local SOCKS5 server
    pub local_addr: SocketAddr,
    /// Its configuration file, written by the profile layer
    pub config_file: PathBuf,
    /// Traffic statistics path
    pub stat_file: PathBuf,
    pub fast_open: bool,
    /// Appended to the command line as is
    pub extra_args: Vec<String>,
}

/// Local resolver selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolverKind {
    #[default]
    System,
    Hickory,
}

impl FromStr for ResolverKind {
    type Err = ();

    fn from_str(s: &str) -> Result<ResolverKind, ()> {
        match s {
            "system" => Ok(ResolverKind::System),
            "hickory" | "hickory-dns" | "trust-dns" => Ok(ResolverKind::Hickory),
            _ => Err(()),
        }
    }
}

/// The local DNS forwarder
#[derive(Debug, Clone)]
pub struct DnsConfig {
    pub bind_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    /// Relay through the proxy's SOCKS5 server
    pub proxied: bool,
    pub tcp: bool,
    pub forward_only: bool,
    pub tcp_framing: TcpFraming,
    pub resolver: ResolverKind,
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> DnsConfig {
        DnsConfig {
            bind_addr: SocketAddr::new(DEFAULT_LOCAL_ADDRESS, DEFAULT_DNS_PORT),
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53),
            proxied: true,
            tcp: true,
            forward_only: false,
            tcp_framing: TcpFraming::Raw,
            resolver: ResolverKind::System,
            timeout: DNS_TIMEOUT,
        }
    }
}

/// Routing rules
#[derive(Debug, Clone)]
pub struct AclConfig {
    /// Directory of the `<route>.acl` files
    pub dir: PathBuf,
    pub route: Route,
    pub flatten_depth: usize,
    /// Text of the user's custom rules
    pub custom_rules: Option<String>,
}

/// Service variant specific settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantConfig {
    Proxy,
    Vpn {
        tun2socks: PathBuf,
        mtu: u16,
        ipv6: bool,
    },
    Transproxy {
        redsocks: PathBuf,
        local_port: u16,
    },
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub profile_name: String,
    /// Working directory of every spawned process
    pub sandbox_dir: PathBuf,
    pub proxy: ProxyConfig,
    /// Extra commands guarded along with the proxy
    pub auxiliary: Vec<Vec<String>>,
    pub dns: DnsConfig,
    pub acl: AclConfig,
    pub variant: VariantConfig,
    /// Path of the file it was loaded from
    pub config_path: Option<PathBuf>,
}

/// Configuration parsing error kind
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Missing required fields in JSON configuration
    MissingField,
    /// Missing some keys that must be provided together
    Malformed,
    /// Invalid value of some configuration keys
    Invalid,
    /// Invalid JSON
    JsonParsingError,
    /// `std::io::Error`
    IoError,
}

/// Configuration parsing error
pub struct Error {
    pub kind: ErrorKind,
    pub desc: &'static str,
    pub detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: &'static str, detail: Option<String>) -> Error {
        Error { kind, desc, detail }
    }
}

macro_rules! impl_from {
    ($error:ty, $kind:expr, $desc:expr) => {
        impl From<$error> for Error {
            fn from(err: $error) -> Self {
                Error::new($kind, $desc, Some(format!("{:?}", err)))
            }
        }
    };
}

impl_from!(::std::io::Error, ErrorKind::IoError, "error while reading file");
impl_from!(json5::Error, ErrorKind::JsonParsingError, "json parse error");

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => write!(f, "{}", self.desc),
            Some(ref det) => write!(f, "{} {}", self.desc, det),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => f.write_str(self.desc),
            Some(ref d) => write!(f, "{}, {}", self.desc, d),
        }
    }
}

impl std::error::Error for Error {}

fn parse_ip(s: &str, desc: &'static str) -> Result<IpAddr, Error> {
    s.parse::<IpAddr>()
        .map_err(|_| Error::new(ErrorKind::Malformed, desc, Some(s.to_owned())))
}

/// Parse the first of a comma separated list of DNS servers, `ip` or `ip:port`, port defaults to 53
fn parse_remote_dns(s: &str) -> Result<SocketAddr, Error> {
    let first = s.split(',').next().unwrap_or("").trim();
    if let Ok(addr) = first.parse::<SocketAddr>() {
        return Ok(addr);
    }
    match first.parse::<IpAddr>() {
        Ok(ip) => Ok(SocketAddr::new(ip, 53)),
        Err(..) => Err(Error::new(
            ErrorKind::Malformed,
            "`remote_dns` should be an IP address, with an optional port",
            Some(s.to_owned()),
        )),
    }
}

impl ServiceConfig {
    fn load_from_ssconfig(config: SSConfig) -> Result<ServiceConfig, Error> {
        let sandbox_dir = match config.sandbox_dir {
            Some(dir) => PathBuf::from(dir),
            None => {
                return Err(Error::new(
                    ErrorKind::MissingField,
                    "`sandbox_dir` is required",
                    None,
                ))
            }
        };

        let sproxy = match config.proxy {
            Some(p) => p,
            None => return Err(Error::new(ErrorKind::MissingField, "`proxy` is required", None)),
        };
        let executable = match sproxy.executable {
            Some(e) => PathBuf::from(e),
            None => {
                return Err(Error::new(
                    ErrorKind::MissingField,
                    "`proxy.executable` is required",
                    None,
                ))
            }
        };
        let proxy_ip = match sproxy.local_address {
            Some(ref a) => parse_ip(a, "`proxy.local_address` should be an IP address")?,
            None => DEFAULT_LOCAL_ADDRESS,
        };
        let proxy = ProxyConfig {
            executable,
            local_addr: SocketAddr::new(proxy_ip, sproxy.local_port.unwrap_or(DEFAULT_PROXY_PORT)),
            config_file: sproxy
                .config
                .map(PathBuf::from)
                .unwrap_or_else(|| sandbox_dir.join("shadowsocks.conf")),
            stat_file: sproxy
                .stat
                .map(PathBuf::from)
                .unwrap_or_else(|| sandbox_dir.join("stat_main")),
            fast_open: sproxy.fast_open.unwrap_or(false),
            extra_args: sproxy.args.unwrap_or_default(),
        };

        let mut dns = DnsConfig::default();
        if let Some(sdns) = config.dns {
            let ip = match sdns.local_address {
                Some(ref a) => parse_ip(a, "`dns.local_address` should be an IP address")?,
                None => DEFAULT_LOCAL_ADDRESS,
            };
            dns.bind_addr = SocketAddr::new(ip, sdns.local_port.unwrap_or(DEFAULT_DNS_PORT));
            dns.remote_addr = parse_remote_dns(sdns.remote_dns.as_deref().unwrap_or(DEFAULT_REMOTE_DNS))?;
            dns.proxied = sdns.proxied.unwrap_or(true);
            dns.tcp = sdns.tcp.unwrap_or(true);
            dns.forward_only = sdns.forward_only.unwrap_or(false);
            dns.tcp_framing = sdns.tcp_framing.unwrap_or_default();
            if let Some(ref r) = sdns.resolver {
                dns.resolver = match r.parse::<ResolverKind>() {
                    Ok(r) => r,
                    Err(..) => {
                        return Err(Error::new(
                            ErrorKind::Invalid,
                            "`dns.resolver` should be \"system\" or \"hickory\"",
                            Some(r.clone()),
                        ))
                    }
                };
            }
            if let Some(t) = sdns.timeout {
                if t == 0 {
                    return Err(Error::new(ErrorKind::Invalid, "`dns.timeout` must not be 0", None));
                }
                dns.timeout = Duration::from_secs(t);
            }
        }

        let sacl = config.acl.unwrap_or_default();
        let route = match sacl.route {
            Some(ref r) => match r.parse::<Route>() {
                Ok(r) => r,
                Err(..) => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        "`acl.route` is not a known route",
                        Some(r.clone()),
                    ))
                }
            },
            None => Route::All,
        };
        let acl = AclConfig {
            dir: sacl
                .dir
                .map(PathBuf::from)
                .unwrap_or_else(|| sandbox_dir.join("acl")),
            route,
            flatten_depth: sacl.flatten_depth.unwrap_or(CUSTOM_RULES_FLATTEN_DEPTH),
            custom_rules: sacl.custom_rules,
        };

        let variant = match config.mode.as_deref() {
            None | Some("proxy") => VariantConfig::Proxy,
            Some("vpn") => {
                let svpn = config.vpn.unwrap_or_default();
                let tun2socks = match svpn.tun2socks {
                    Some(t) => PathBuf::from(t),
                    None => {
                        return Err(Error::new(
                            ErrorKind::MissingField,
                            "`vpn.tun2socks` is required in \"vpn\" mode",
                            None,
                        ))
                    }
                };
                VariantConfig::Vpn {
                    tun2socks,
                    mtu: svpn.mtu.unwrap_or(DEFAULT_VPN_MTU),
                    ipv6: svpn.ipv6.unwrap_or(false),
                }
            }
            Some("transproxy") => {
                let strans = config.transproxy.unwrap_or_default();
                let redsocks = match strans.redsocks {
                    Some(r) => PathBuf::from(r),
                    None => {
                        return Err(Error::new(
                            ErrorKind::MissingField,
                            "`transproxy.redsocks` is required in \"transproxy\" mode",
                            None,
                        ))
                    }
                };
                VariantConfig::Transproxy {
                    redsocks,
                    local_port: strans.local_port.unwrap_or(DEFAULT_TRANSPROXY_PORT),
                }
            }
            Some(m) => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    "`mode` should be \"proxy\", \"vpn\" or \"transproxy\"",
                    Some(m.to_owned()),
                ))
            }
        };

        let auxiliary = config.auxiliary.unwrap_or_default();
        if auxiliary.iter().any(|argv| argv.is_empty()) {
            return Err(Error::new(
                ErrorKind::Invalid,
                "`auxiliary` commands must not be empty",
                None,
            ));
        }

        Ok(ServiceConfig {
            profile_name: config.profile_name.unwrap_or_default(),
            sandbox_dir,
            proxy,
            auxiliary,
            dns,
            acl,
            variant,
            config_path: None,
        })
    }

    /// Load ServiceConfig from a JSON5 string
    pub fn load_from_str(s: &str) -> Result<ServiceConfig, Error> {
        let c = json5::from_str::<SSConfig>(s)?;
        ServiceConfig::load_from_ssconfig(c)
    }

    /// Load ServiceConfig from a File
    pub fn load_from_file<P: AsRef<Path>>(filename: P) -> Result<ServiceConfig, Error> {
        let filename = filename.as_ref();

        let mut reader = OpenOptions::new().read(true).open(filename)?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        let mut config = ServiceConfig::load_from_str(&content[..])?;
        config.config_path = Some(filename.to_owned());

        Ok(config)
    }

    /// Address of the remote DNS server's SOCKS5 proxy, if relays go through the proxy
    pub fn dns_proxy(&self) -> Option<SocketAddr> {
        if self.dns.proxied {
            Some(self.proxy.local_addr)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_defaults() {
        let config = ServiceConfig::load_from_str(
            r#"{
                sandbox_dir: "/tmp/ssdroid",
                proxy: { executable: "/opt/sslocal" },
            }"#,
        )
        .unwrap();

        assert_eq!(config.proxy.local_addr, "127.0.0.1:1080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.proxy.config_file, Path::new("/tmp/ssdroid/shadowsocks.conf"));
        assert_eq!(config.dns.bind_addr, "127.0.0.1:5450".parse::<SocketAddr>().unwrap());
        assert_eq!(config.dns.remote_addr, "8.8.8.8:53".parse::<SocketAddr>().unwrap());
        assert!(config.dns.tcp);
        assert_eq!(config.dns.timeout, Duration::from_secs(10));
        assert_eq!(config.acl.route, Route::All);
        assert_eq!(config.acl.dir, Path::new("/tmp/ssdroid/acl"));
        assert_eq!(config.acl.flatten_depth, 10);
        assert_eq!(config.variant, VariantConfig::Proxy);
        assert_eq!(config.dns_proxy(), Some(config.proxy.local_addr));
    }

    #[test]
    fn full_config() {
        let config = ServiceConfig::load_from_str(
            r#"{
                profile_name: "home",
                sandbox_dir: "/tmp/ssdroid",
                proxy: { executable: "/opt/sslocal", local_port: 1081, fast_open: true },
                auxiliary: [["/opt/helper", "-v"]],
                dns: {
                    local_port: 5353,
                    remote_dns: "1.1.1.1, 8.8.8.8",
                    proxied: false,
                    tcp: false,
                    tcp_framing: "length_prefixed",
                    resolver: "hickory",
                    timeout: 5,
                },
                acl: { route: "custom-rules", custom_rules: "[bypass_all]" },
                mode: "vpn",
                vpn: { tun2socks: "/opt/tun2socks", ipv6: true },
            }"#,
        )
        .unwrap();

        assert_eq!(config.profile_name, "home");
        assert_eq!(config.proxy.local_addr.port(), 1081);
        assert!(config.proxy.fast_open);
        assert_eq!(config.auxiliary, vec![vec!["/opt/helper".to_owned(), "-v".to_owned()]]);
        assert_eq!(config.dns.remote_addr, "1.1.1.1:53".parse::<SocketAddr>().unwrap());
        assert!(!config.dns.tcp);
        assert_eq!(config.dns.tcp_framing, TcpFraming::LengthPrefixed);
        assert_eq!(config.dns.resolver, ResolverKind::Hickory);
        assert_eq!(config.dns.timeout, Duration::from_secs(5));
        assert_eq!(config.dns_proxy(), None);
        assert_eq!(config.acl.route, Route::CustomRules);
        assert_eq!(config.acl.custom_rules.as_deref(), Some("[bypass_all]"));
        assert_eq!(
            config.variant,
            VariantConfig::Vpn {
                tun2socks: PathBuf::from("/opt/tun2socks"),
                mtu: 1500,
                ipv6: true,
            }
        );
    }

    #[test]
    fn remote_dns_with_port() {
        assert_eq!(
            parse_remote_dns("[2001:4860:4860::8888]:5353").unwrap(),
            "[2001:4860:4860::8888]:5353".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(parse_remote_dns("not-an-ip").unwrap_err().kind, ErrorKind::Malformed);
    }

    #[test]
    fn invalid_configs() {
        let err = ServiceConfig::load_from_str(r#"{ proxy: { executable: "/opt/sslocal" } }"#).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingField);

        let err = ServiceConfig::load_from_str(
            r#"{ sandbox_dir: "/tmp", proxy: { executable: "/opt/sslocal" }, acl: { route: "nowhere" } }"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invalid);

        let err = ServiceConfig::load_from_str(
            r#"{ sandbox_dir: "/tmp", proxy: { executable: "/opt/sslocal" }, mode: "vpn" }"#,
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingField);

        let err = ServiceConfig::load_from_str("{ sandbox_dir: ").unwrap_err();
        assert_eq!(err.kind, ErrorKind::JsonParsingError);
    }
}
