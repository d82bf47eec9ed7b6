use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use opsdeck_notify::{
    HttpStatusSource, Notification, NotificationClient, PollOutcome, StatusPoller,
};
use time::format_description::well_known::Rfc3339;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

mod cli;
mod telemetry;

use cli::{Cli, Command, PollSettings, WatchSettings};

const FEED_REFRESH: Duration = Duration::from_millis(250);

const EXIT_POLL_FAILED: u8 = 2;
const EXIT_POLL_EXHAUSTED: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    telemetry::init(cli.metrics_addr)?;

    match cli.command {
        Command::Watch(args) => watch(WatchSettings::try_from(args)?).await,
        Command::Poll(args) => poll(PollSettings::try_from(args)?).await,
    }
}

async fn watch(settings: WatchSettings) -> Result<ExitCode> {
    let client = NotificationClient::new(settings.config)
        .context("failed to start notification client")?;
    let mut states = client.state_changes();
    let mut interrupts = client.interrupts();
    client
        .subscribe(settings.identity)
        .context("failed to subscribe")?;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut refresh = tokio::time::interval(FEED_REFRESH);
    let mut printed_up_to = 0u64;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted; closing channel");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                println!("-- channel {state}");
            }
            interrupt = interrupts.recv() => match interrupt {
                Ok(notification) => println!("!! {}", describe(&notification)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed interrupts"),
                Err(RecvError::Closed) => break,
            },
            _ = refresh.tick() => {
                let mut fresh: Vec<_> = client
                    .notifications()
                    .into_iter()
                    .filter(|n| n.local_id > printed_up_to)
                    .collect();
                fresh.reverse();
                for notification in &fresh {
                    println!("   {}", describe(notification));
                    printed_up_to = notification.local_id;
                }
            }
        }
    }

    let stats = client.stats();
    client.shutdown().await.context("failed to close channel")?;
    info!(
        connect_attempts = stats.connect_attempts,
        reconnects = stats.reconnects_scheduled,
        watchdog_expiries = stats.watchdog_expiries,
        frames_dropped = stats.frames_dropped,
        "channel closed"
    );
    Ok(ExitCode::SUCCESS)
}

fn describe(notification: &Notification) -> String {
    let at = notification
        .received_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| "-".into());
    match notification.message.as_deref() {
        Some(message) => format!(
            "{at} [{}] {}: {message}",
            notification.priority,
            notification.headline()
        ),
        None => format!("{at} [{}] {}", notification.priority, notification.headline()),
    }
}

async fn poll(settings: PollSettings) -> Result<ExitCode> {
    let source = HttpStatusSource::new(&settings.config).context("failed to build status client")?;
    let poller = StatusPoller::new(source, &settings.config)?;

    let code = match poller.run(&settings.token).await {
        PollOutcome::Confirmed { attempts } => {
            println!("confirmed after {attempts} attempt(s)");
            ExitCode::SUCCESS
        }
        PollOutcome::Failed { status, attempts } => {
            println!("failed with status {status} after {attempts} attempt(s)");
            ExitCode::from(EXIT_POLL_FAILED)
        }
        PollOutcome::Exhausted { attempts } => {
            println!("no terminal status after {attempts} attempt(s)");
            ExitCode::from(EXIT_POLL_EXHAUSTED)
        }
    };
    Ok(code)
}
