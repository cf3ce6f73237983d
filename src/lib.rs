//! ssdroid is the data plane bootstrap of a shadowsocks mobile client.
//!
//! It keeps the native proxy helpers alive, runs a local DNS forwarder that decides per query between the local
//! resolver and the remote DNS, and maintains the ACL rulesets both of them depend on.
//!
//! ## Usage
//!
//! Write the service configuration in a JSON5 file, format is defined in `ssdroid_service::config`.
//!
//! For example:
//!
//! ```json
//! {
//!    "sandbox_dir": "/data/ssdroid",
//!    "proxy": { "executable": "/opt/ssdroid/libsslocal.so", "local_port": 1080 },
//!    "dns": { "local_port": 5450, "remote_dns": "8.8.8.8" },
//!    "acl": { "route": "bypass-lan-china" }
//! }
//! ```
//!
//! Save it in file `ssdroid.json5` and run the service with
//!
//! ```bash
//! cargo run --bin ssdroid -- -c ssdroid.json5
//! ```

use std::process::ExitCode;

pub mod config;
pub mod logging;
pub mod monitor;
pub mod service;

/// Exit code when server exits unexpectedly (`EX_SOFTWARE`)
pub const EXIT_CODE_SERVER_EXIT_UNEXPECTEDLY: u8 = 70;
/// Exit code when server aborted (`EX_SOFTWARE`)
pub const EXIT_CODE_SERVER_ABORTED: u8 = 70;
/// Exit code when loading configuration from file fails (`EX_CONFIG`)
pub const EXIT_CODE_LOAD_CONFIG_FAILURE: u8 = 78;

/// Current package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status of a stopped service, `msg` is the reason reported with the stop
pub fn stop_exit_code(msg: Option<&str>) -> ExitCode {
    match msg {
        None => ExitCode::SUCCESS,
        Some(..) => EXIT_CODE_SERVER_ABORTED.into(),
    }
}
