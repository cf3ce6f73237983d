//! Service launcher

use std::{
    net::SocketAddr,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex, PoisonError},
};

use clap::{builder::PossibleValuesParser, Arg, ArgAction, ArgMatches, Command, ValueHint};
use futures::future::{self, Either};
use log::{error, info, trace};
use tokio::{self, runtime::Builder};

use ssdroid_service::{
    acl::Route,
    config::ServiceConfig,
    core::variant_from_config,
    ServiceCallback,
    ServiceCore,
    State,
};

use crate::{
    config::{Config, RuntimeMode},
    logging,
    monitor,
};

/// Defines command line options
pub fn define_command_line_options(mut app: Command) -> Command {
    app = app
        .arg(
            Arg::new("CONFIG")
                .short('c')
                .long("config")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf))
                .value_hint(ValueHint::FilePath)
                .help("Service configuration file, JSON5"),
        )
        .arg(
            Arg::new("ROUTE")
                .long("route")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(PossibleValuesParser::new(Route::available_routes().iter().copied()))
                .help("Route of the profile, overrides acl.route"),
        )
        .arg(
            Arg::new("DNS_ADDR")
                .long("dns-addr")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Local DNS forwarder listen address, overrides dns.local_address and dns.local_port"),
        )
        .arg(
            Arg::new("REMOTE_DNS")
                .long("remote-dns")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(SocketAddr))
                .help("Remote DNS server address"),
        )
        .arg(
            Arg::new("DNS_FORWARD_ONLY")
                .long("dns-forward-only")
                .action(ArgAction::SetTrue)
                .help("Forward every DNS query to the remote DNS server"),
        );

    app = app
        .arg(
            Arg::new("VERBOSE")
                .short('v')
                .action(ArgAction::Count)
                .help("Set log level"),
        )
        .arg(
            Arg::new("LOG_WITHOUT_TIME")
                .long("log-without-time")
                .action(ArgAction::SetTrue)
                .help("Log without datetime prefix"),
        )
        .arg(
            Arg::new("LOG_CONFIG")
                .long("log-config")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(PathBuf))
                .value_hint(ValueHint::FilePath)
                .help("log4rs configuration file"),
        );

    app = app
        .arg(
            Arg::new("SINGLE_THREADED")
                .long("single-threaded")
                .action(ArgAction::SetTrue)
                .help("Run the program all in one thread"),
        )
        .arg(
            Arg::new("WORKER_THREADS")
                .long("worker-threads")
                .num_args(1)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize))
                .help("Sets the number of worker threads the `Runtime` will use"),
        );

    app
}

/// Logs state changes and keeps the reason of the last stop
#[derive(Default)]
struct LogCallback {
    stop_reason: Mutex<Option<String>>,
}

impl LogCallback {
    fn stop_reason(&self) -> Option<String> {
        self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl ServiceCallback for LogCallback {
    fn state_changed(&self, state: State, profile_name: &str, msg: Option<&str>) {
        match msg {
            Some(msg) => error!("service {} of profile \"{}\", {}", state, profile_name, msg),
            None => info!("service {} of profile \"{}\"", state, profile_name),
        }
        if state == State::Stopped {
            *self.stop_reason.lock().unwrap_or_else(PoisonError::into_inner) = msg.map(ToOwned::to_owned);
        }
    }
}

/// Program entrance `main`
pub fn main(matches: &ArgMatches) -> ExitCode {
    let (config, runtime) = {
        let config_path_opt = matches.get_one::<PathBuf>("CONFIG").cloned().or_else(|| {
            match crate::config::get_default_config_path() {
                None => None,
                Some(p) => {
                    println!("loading default config {p:?}");
                    Some(p)
                }
            }
        });

        let mut app_config = Config::default();
        app_config.set_options(matches);

        match app_config.log.config_path {
            Some(ref path) => {
                logging::init_with_file(path);
            }
            None => {
                logging::init_with_config("ssdroid", &app_config.log);
            }
        }

        trace!("{:?}", app_config);

        let mut config = match config_path_opt {
            Some(cpath) => match ServiceConfig::load_from_file(&cpath) {
                Ok(cfg) => cfg,
                Err(err) => {
                    eprintln!("loading config {cpath:?}, {err}");
                    return crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into();
                }
            },
            None => {
                eprintln!("missing configuration file, consider specifying it by --config command line option");
                return crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into();
            }
        };

        if let Some(route) = matches.get_one::<String>("ROUTE") {
            match route.parse::<Route>() {
                Ok(route) => config.acl.route = route,
                Err(err) => {
                    eprintln!("--route {route}, {err}");
                    return crate::EXIT_CODE_LOAD_CONFIG_FAILURE.into();
                }
            }
        }
        if let Some(addr) = matches.get_one::<SocketAddr>("DNS_ADDR") {
            config.dns.bind_addr = *addr;
        }
        if let Some(addr) = matches.get_one::<SocketAddr>("REMOTE_DNS") {
            config.dns.remote_addr = *addr;
        }
        if matches.get_flag("DNS_FORWARD_ONLY") {
            config.dns.forward_only = true;
        }

        trace!("{:?}", config);

        info!("ssdroid {}", crate::VERSION);

        let mut builder = match app_config.runtime.mode {
            RuntimeMode::SingleThread => Builder::new_current_thread(),
            RuntimeMode::MultiThread => {
                let mut builder = Builder::new_multi_thread();
                if let Some(worker_threads) = app_config.runtime.worker_count {
                    builder.worker_threads(worker_threads);
                }

                builder
            }
        };

        let runtime = builder.enable_all().build().expect("create tokio Runtime");

        (config, runtime)
    };

    runtime.block_on(async move {
        let variant = variant_from_config(&config.variant);
        let callback = Arc::new(LogCallback::default());
        let core = Arc::new(ServiceCore::new(config, variant, callback.clone()));

        let mut state_rx = core.subscribe();
        if !core.start() {
            eprintln!("service is not stopped");
            return crate::EXIT_CODE_SERVER_EXIT_UNEXPECTEDLY.into();
        }

        let abort_signal = monitor::create_signal_monitor();
        let stopped = async { state_rx.wait_for(|state| *state == State::Stopped).await.is_ok() };

        tokio::pin!(abort_signal);
        tokio::pin!(stopped);

        match future::select(stopped, abort_signal).await {
            // The service stopped by itself, a helper crashed or the start failed
            Either::Left(..) => {
                let reason = callback.stop_reason();
                if let Some(ref reason) = reason {
                    eprintln!("service stopped, {reason}");
                }
                crate::stop_exit_code(reason.as_deref())
            }
            Either::Right((result, ..)) => {
                if let Err(err) = result {
                    error!("signal monitor failed, error: {}", err);
                }
                core.stop(None).await;
                ExitCode::SUCCESS
            }
        }
    })
}

#[cfg(test)]
mod test {
    use clap::Command;

    #[test]
    fn verify_local_command() {
        let mut app = Command::new("ssdroid")
            .version(crate::VERSION)
            .about("Data plane bootstrap of the ssdroid proxy client");
        app = super::define_command_line_options(app);
        app.debug_assert();
    }

    #[test]
    fn route_override_parses() {
        let mut app = Command::new("ssdroid");
        app = super::define_command_line_options(app);
        let matches = app
            .try_get_matches_from(["ssdroid", "--route", "gfwlist", "-vv", "--dns-addr", "127.0.0.1:5353"])
            .unwrap();
        assert_eq!(matches.get_one::<String>("ROUTE").map(String::as_str), Some("gfwlist"));
        assert_eq!(matches.get_count("VERBOSE"), 2);

        let mut app = Command::new("ssdroid");
        app = super::define_command_line_options(app);
        assert!(app.try_get_matches_from(["ssdroid", "--route", "nowhere"]).is_err());
    }
}
