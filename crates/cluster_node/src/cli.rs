//! Command-line interface handling for the cluster node.
//!
//! Every option except the config path overrides the matching setting from
//! the TOML file.

use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the node role
    pub role: Option<String>,
    /// Optional override for the TCP listen address
    pub tcp_addr: Option<String>,
    /// Optional override for the WebSocket listen address
    pub ws_addr: Option<String>,
    /// Optional override for the master address
    pub master_addr: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    ///
    /// Exits with clap's usage message when the arguments are invalid.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            role: matches.get_one::<String>("role").cloned(),
            tcp_addr: matches.get_one::<String>("tcp").cloned(),
            ws_addr: matches.get_one::<String>("ws").cloned(),
            master_addr: matches.get_one::<String>("master").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Cluster Node")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Game cluster node with TCP, WebSocket and master uplink support")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("role")
                .short('r')
                .long("role")
                .value_name("ROLE")
                .help("Node role (master, game, gate)"),
        )
        .arg(
            Arg::new("tcp")
                .short('t')
                .long("tcp")
                .value_name("ADDRESS")
                .help("TCP listen address (e.g., 127.0.0.1:3563)"),
        )
        .arg(
            Arg::new("ws")
                .short('w')
                .long("ws")
                .value_name("ADDRESS")
                .help("WebSocket listen address (e.g., 127.0.0.1:3653)"),
        )
        .arg(
            Arg::new("master")
                .short('m')
                .long("master")
                .value_name("ADDRESS")
                .help("Master node address to dial"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
}
