//! Command-line arguments

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::logging::LogFormat;
use crate::settings::ServerSettings;

/// authgate - OAuth 2.1 authorization broker
///
/// Serves the authorization, callback and token endpoints, the discovery
/// documents, and a bearer-protected demo resource.
#[derive(Parser, Debug)]
#[command(name = "authgate", version, about, author)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "AUTHGATE_CONFIG", default_value = "authgate.toml")]
    pub config: PathBuf,

    /// Listen address, overriding `[server].bind`
    #[arg(short, long, env = "AUTHGATE_BIND")]
    pub bind: Option<SocketAddr>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    /// Layer command-line flags over file settings
    pub fn apply(&self, mut settings: ServerSettings) -> ServerSettings {
        if let Some(bind) = self.bind {
            settings.server.bind = bind;
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
        settings.logging = settings.logging.with_verbosity(self.verbose, self.quiet);
        settings
    }
}
