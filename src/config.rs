//! Common configuration of the binary, logging and runtime

use std::path::{Path, PathBuf};

use clap::ArgMatches;
use directories::ProjectDirs;

/// Default configuration file path
pub fn get_default_config_path() -> Option<PathBuf> {
    // Linux: $XDG_CONFIG_HOME/ssdroid/ssdroid.json5
    //        $HOME/.config/ssdroid/ssdroid.json5
    // macOS: $HOME/Library/Application Support/org.ssdroid.ssdroid/ssdroid.json5
    if let Some(project_dirs) = ProjectDirs::from("org", "ssdroid", "ssdroid") {
        let mut config_path = project_dirs.config_dir().to_path_buf();
        config_path.push("ssdroid.json5");

        if config_path.exists() {
            return Some(config_path);
        }
    }

    if cfg!(unix) {
        let global_config_path = Path::new("/etc/ssdroid/ssdroid.json5");
        if global_config_path.exists() {
            return Some(global_config_path.to_path_buf());
        }
    }

    None
}

/// Log format
#[derive(Debug, Clone, Default)]
pub struct LogFormatConfig {
    pub without_time: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity, 0 to 4
    pub level: u32,
    pub format: LogFormatConfig,
    /// log4rs YAML configuration, replaces everything above
    pub config_path: Option<PathBuf>,
}

/// Runtime mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeMode {
    SingleThread,
    #[default]
    MultiThread,
}

/// Runtime configuration
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub worker_count: Option<usize>,
    pub mode: RuntimeMode,
}

/// Configuration of the binary itself, the service has its own
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub log: LogConfig,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Apply command line options
    pub fn set_options(&mut self, matches: &ArgMatches) {
        let debug_level = matches.get_count("VERBOSE");
        if debug_level > 0 {
            self.log.level = debug_level as u32;
        }

        if matches.get_flag("LOG_WITHOUT_TIME") {
            self.log.format.without_time = true;
        }

        if let Some(log_config) = matches.get_one::<PathBuf>("LOG_CONFIG").cloned() {
            self.log.config_path = Some(log_config);
        }

        if matches.get_flag("SINGLE_THREADED") {
            self.runtime.mode = RuntimeMode::SingleThread;
        }

        if let Some(worker_count) = matches.get_one::<usize>("WORKER_THREADS") {
            self.runtime.worker_count = Some(*worker_count);
        }
    }
}
