//! ssdroid Service
//!
//! The data plane bootstrap of the ssdroid proxy client, shared by its proxy, VPN and transparent proxy modes:
//!
//! - [`process`]: native helper processes, kept alive by guards
//! - [`dns`]: a local DNS forwarder deciding per query between the local resolver and the remote DNS
//! - [`acl`]: routing rulesets, consumed by the proxy process and the DNS forwarder
//! - [`core`]: the service lifecycle tying them together
//!
//! Write the service configuration in a JSON5 file, see [`config`], and run it with
//!
//! ```bash
//! cargo run --bin ssdroid -- -c ssdroid.json5
//! ```

pub use ssdroid;

pub use self::core::{ServiceCallback, ServiceCore, State};

pub mod acl;
pub mod config;
pub mod core;
pub mod dns;
pub mod process;
pub mod socks;
