use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use opsdeck_notify::config::{DEFAULT_API_URL, DEFAULT_SERVER_URL};
use opsdeck_notify::{ChannelConfig, ChannelIdentity, PollConfig};

#[derive(Debug, Parser)]
#[command(
    name = "opsdeck-watch",
    author,
    version,
    about = "Follow the opsdeck notification channel or poll a status endpoint"
)]
pub struct Cli {
    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "OPSDECK_METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Subscribe to the notification channel and print the feed.
    Watch(WatchArgs),
    /// Poll `GET {api}/status/{token}` until it settles.
    Poll(PollArgs),
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Notification server base url (ws, wss, http or https).
    #[arg(long, env = "OPSDECK_SERVER_URL", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    #[arg(long, env = "OPSDECK_SUBJECT")]
    pub subject: String,

    #[arg(long, env = "OPSDECK_ROLE", default_value = "admin")]
    pub role: String,

    /// Heartbeat interval; the watchdog allows twice this much silence.
    #[arg(long, env = "OPSDECK_HEARTBEAT_SECS")]
    pub heartbeat_secs: Option<u64>,
}

pub struct WatchSettings {
    pub config: ChannelConfig,
    pub identity: ChannelIdentity,
}

impl TryFrom<WatchArgs> for WatchSettings {
    type Error = anyhow::Error;

    fn try_from(args: WatchArgs) -> Result<Self, Self::Error> {
        let mut config = ChannelConfig::from_env();
        config.server_url = args.server;
        if let Some(secs) = args.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        config
            .validate()
            .context("invalid channel configuration")?;
        let identity =
            ChannelIdentity::new(args.subject, args.role).context("invalid channel identity")?;
        Ok(WatchSettings { config, identity })
    }
}

#[derive(Debug, Args)]
pub struct PollArgs {
    /// REST api base url.
    #[arg(long, env = "OPSDECK_API_URL", default_value = DEFAULT_API_URL)]
    pub api: String,

    #[arg(long)]
    pub token: String,

    #[arg(long)]
    pub attempts: Option<u32>,

    #[arg(long)]
    pub interval_ms: Option<u64>,
}

pub struct PollSettings {
    pub config: PollConfig,
    pub token: String,
}

impl TryFrom<PollArgs> for PollSettings {
    type Error = anyhow::Error;

    fn try_from(args: PollArgs) -> Result<Self, Self::Error> {
        let mut config = PollConfig::from_env();
        config.api_url = args.api;
        if let Some(attempts) = args.attempts {
            config.max_attempts = attempts;
        }
        if let Some(ms) = args.interval_ms {
            config.interval = Duration::from_millis(ms);
        }
        config.validate().context("invalid poll configuration")?;
        let token = args.token.trim().to_string();
        anyhow::ensure!(!token.is_empty(), "token must not be empty");
        Ok(PollSettings { config, token })
    }
}
