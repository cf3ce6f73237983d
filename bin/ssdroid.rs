//! This is a binary running the ssdroid service
//!
//! It supervises the proxy helpers and serves the local DNS forwarder until it receives `SIGTERM` or `SIGINT`,
//! or until the service stops by itself. The format of the configuration file is defined in
//! `ssdroid_service::config`.

use std::process::ExitCode;

use clap::Command;
use ssdroid_rust::service::local;

fn main() -> ExitCode {
    let mut app = Command::new("ssdroid")
        .version(ssdroid_rust::VERSION)
        .about("Data plane bootstrap of the ssdroid proxy client: helper supervisor, local DNS forwarder and ACL engine");
    app = local::define_command_line_options(app);

    let matches = app.get_matches();
    local::main(&matches)
}
