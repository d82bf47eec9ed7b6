//! Owner-facing handle and the actor task that drives the channel.
//!
//! [`NotificationClient`] is the only way in. Commands from the handle and
//! callbacks from transports and timers all funnel into one actor task, which
//! applies them to the [`Lifecycle`] one at a time and then performs the
//! resulting effects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::backoff::BackoffState;
use crate::config::ChannelConfig;
use crate::error::{ClientError, ConfigError, TransportError};
use crate::frame::OutboundFrame;
use crate::identity::{channel_address, ChannelIdentity};
use crate::lifecycle::{
    ConnectionState, Effect, Generation, Input, Lifecycle, LifecycleSettings, Transition, Trigger,
};
use crate::timer::TimerSlot;
use crate::transport::{CloseReason, Connector, Link, LinkEvent, LinkSender, WsConnector};
use crate::triage::{Notification, NotificationBuffer, SharedFeed, Triage};

/// Extra time `unsubscribe` allows on top of the close grace period.
const UNSUBSCRIBE_SLACK: Duration = Duration::from_secs(1);
const TRANSITION_HISTORY: usize = 64;

/// Counters describing the channel since the client was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub frames_dropped: u64,
    pub connect_attempts: u64,
    pub reconnects_scheduled: u64,
    pub watchdog_expiries: u64,
    pub pings_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_dropped: Arc<AtomicU64>,
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
    watchdog_expiries: AtomicU64,
    pings_sent: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            watchdog_expiries: self.watchdog_expiries.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Subscribe {
        identity: ChannelIdentity,
        address: Url,
    },
    Unsubscribe {
        done: oneshot::Sender<()>,
    },
}

enum Event {
    Connected {
        generation: Generation,
        result: Result<Link, TransportError>,
    },
    Link {
        generation: Generation,
        event: LinkEvent,
    },
    HeartbeatDue {
        generation: Generation,
    },
    WatchdogCheck {
        generation: Generation,
    },
    RetryDue {
        generation: Generation,
    },
    CloseGraceElapsed {
        generation: Generation,
    },
}

/// Single-owner handle to one notification channel.
///
/// Must be created inside a Tokio runtime. Dropping the handle stops the
/// actor, abandons any open link and cancels every timer.
pub struct NotificationClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<Transition>,
    interrupts: broadcast::Sender<Notification>,
    feed: SharedFeed,
    counters: Arc<Counters>,
    base_url: Url,
    close_grace: Duration,
    actor: JoinHandle<()>,
}

impl NotificationClient {
    /// Client over the real WebSocket transport.
    pub fn new(config: ChannelConfig) -> Result<Self, ConfigError> {
        Self::with_connector(config, WsConnector)
    }

    pub fn with_connector<C: Connector>(
        config: ChannelConfig,
        connector: C,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let base_url = config.server_url()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (transitions_tx, _) = broadcast::channel(TRANSITION_HISTORY);
        let (interrupts_tx, _) = broadcast::channel(config.interrupt_capacity);
        let feed: SharedFeed = Arc::new(RwLock::new(NotificationBuffer::new(config.feed_capacity)));
        let counters = Arc::new(Counters::default());

        let lifecycle = Lifecycle::new(
            LifecycleSettings {
                heartbeat_interval: config.heartbeat_interval,
                close_grace: config.close_grace,
            },
            BackoffState::new(config.backoff),
        );
        let actor = ChannelActor {
            lifecycle,
            connector: Arc::new(connector),
            events_tx,
            triage: Triage::new(
                feed.clone(),
                interrupts_tx.clone(),
                counters.frames_dropped.clone(),
            ),
            state_tx,
            transitions_tx: transitions_tx.clone(),
            counters: counters.clone(),
            link: None,
            connect: TimerSlot::default(),
            pump: TimerSlot::default(),
            heartbeat: TimerSlot::default(),
            watchdog: TimerSlot::default(),
            retry: TimerSlot::default(),
            close_grace: TimerSlot::default(),
            idle_waiters: Vec::new(),
            connect_timeout: config.connect_timeout,
        };
        let actor = tokio::spawn(actor.run(commands_rx, events_rx));

        Ok(Self {
            commands: commands_tx,
            state: state_rx,
            transitions: transitions_tx,
            interrupts: interrupts_tx,
            feed,
            counters,
            base_url,
            close_grace: config.close_grace,
            actor,
        })
    }

    /// Opens the channel for `identity`. Returns immediately; progress is
    /// reported through [`state_changes`](Self::state_changes).
    ///
    /// Subscribing again with the same identity is a no-op. A different
    /// identity tears the current channel down first.
    pub fn subscribe(&self, identity: ChannelIdentity) -> Result<(), ClientError> {
        let address = channel_address(&self.base_url, &identity)?;
        self.commands
            .send(Command::Subscribe { identity, address })
            .map_err(|_| ClientError::ActorStopped)
    }

    /// Closes the channel and waits until it is idle.
    ///
    /// The wait is bounded by the configured close grace; a server that never
    /// confirms the close is abandoned locally.
    pub async fn unsubscribe(&self) -> Result<(), ClientError> {
        let (done, idle) = oneshot::channel();
        self.commands
            .send(Command::Unsubscribe { done })
            .map_err(|_| ClientError::ActorStopped)?;
        let limit = self.close_grace + UNSUBSCRIBE_SLACK;
        match timeout(limit, idle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ActorStopped),
            Err(_) => Err(ClientError::CloseTimedOut(limit)),
        }
    }

    /// Unsubscribes and waits for the actor task to finish.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let result = self.unsubscribe().await;
        let Self {
            commands, actor, ..
        } = self;
        drop(commands);
        let _ = actor.await;
        result
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every transition taken, in order. Slow receivers observe `Lagged`.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// High-priority notifications as they arrive.
    pub fn interrupts(&self) -> broadcast::Receiver<Notification> {
        self.interrupts.subscribe()
    }

    /// Newest-first copy of the feed.
    pub fn notifications(&self) -> Vec<Notification> {
        self.feed.read().snapshot()
    }

    pub fn clear_notifications(&self) {
        self.feed.write().clear();
    }

    pub fn mark_read(&self, local_id: u64) -> bool {
        self.feed.write().mark_read(local_id)
    }

    pub fn mark_all_read(&self) {
        self.feed.write().mark_all_read();
    }

    pub fn unread_count(&self) -> usize {
        self.feed.read().unread_count()
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for NotificationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationClient")
            .field("state", &self.current_state())
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

struct ChannelActor<C> {
    lifecycle: Lifecycle,
    connector: Arc<C>,
    events_tx: mpsc::UnboundedSender<Event>,
    triage: Triage,
    state_tx: watch::Sender<ConnectionState>,
    transitions_tx: broadcast::Sender<Transition>,
    counters: Arc<Counters>,
    link: Option<LinkSender>,
    connect: TimerSlot,
    pump: TimerSlot,
    heartbeat: TimerSlot,
    watchdog: TimerSlot,
    retry: TimerSlot,
    close_grace: TimerSlot,
    idle_waiters: Vec<oneshot::Sender<()>>,
    connect_timeout: Duration,
}

impl<C: Connector> ChannelActor<C> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event),
            }
        }
        debug!(
            target = "opsdeck::channel",
            state = %self.lifecycle.state(),
            "client handle dropped; stopping channel actor"
        );
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe { identity, address } => {
                debug!(
                    target = "opsdeck::channel",
                    subject = identity.subject_id(),
                    role = identity.role(),
                    "subscribe requested"
                );
                self.apply(Input::Start { identity, address });
            }
            Command::Unsubscribe { done } => {
                self.idle_waiters.push(done);
                self.apply(Input::Stop);
            }
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Connected { generation, result } => self.on_connected(generation, result),
            Event::Link { generation, event } => self.on_link_event(generation, event),
            Event::HeartbeatDue { generation } => self.apply(Input::HeartbeatDue { generation }),
            Event::WatchdogCheck { generation } => self.apply(Input::WatchdogCheck { generation }),
            Event::RetryDue { generation } => self.apply(Input::RetryDue { generation }),
            Event::CloseGraceElapsed { generation } => {
                self.apply(Input::CloseGraceElapsed { generation })
            }
        }
    }

    fn on_connected(&mut self, generation: Generation, result: Result<Link, TransportError>) {
        if generation != self.lifecycle.generation() {
            debug!(
                target = "opsdeck::channel",
                %generation,
                current = %self.lifecycle.generation(),
                "discarding connect result from superseded attempt"
            );
            return;
        }
        match result {
            Ok(link) => {
                let (sender, mut link_events) = link.into_parts();
                self.link = Some(sender);
                let tx = self.events_tx.clone();
                self.pump.track(tokio::spawn(async move {
                    while let Some(event) = link_events.recv().await {
                        let terminal = matches!(event, LinkEvent::Closed(_));
                        if tx.send(Event::Link { generation, event }).is_err() || terminal {
                            return;
                        }
                    }
                    let _ = tx.send(Event::Link {
                        generation,
                        event: LinkEvent::Closed(CloseReason::Ended),
                    });
                }));
                self.apply(Input::TransportOpened { generation });
            }
            Err(err) => {
                warn!(
                    target = "opsdeck::channel",
                    %generation,
                    error = %err,
                    "connect attempt failed"
                );
                self.apply(Input::TransportFailed { generation });
            }
        }
    }

    fn on_link_event(&mut self, generation: Generation, event: LinkEvent) {
        if generation != self.lifecycle.generation() {
            return;
        }
        match event {
            LinkEvent::Text(text) => {
                self.apply(Input::FrameReceived { generation });
                // Only an open channel feeds triage; a closing link is draining.
                if self.lifecycle.state() == ConnectionState::Open {
                    self.triage.on_text(&text);
                }
            }
            LinkEvent::Closed(reason) => {
                info!(
                    target = "opsdeck::channel",
                    %generation,
                    %reason,
                    "link closed"
                );
                self.apply(Input::TransportClosed { generation });
            }
        }
    }

    fn apply(&mut self, input: Input) {
        let step = self.lifecycle.apply(input, Instant::now());
        let step_reached_idle = step
            .transitions
            .iter()
            .any(|transition| transition.to == ConnectionState::Idle);
        for transition in &step.transitions {
            self.record(transition);
        }
        for effect in step.effects {
            self.execute(effect);
        }
        let state = self.lifecycle.state();
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        let reached_idle = step_reached_idle || state == ConnectionState::Idle;
        if reached_idle {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn record(&self, transition: &Transition) {
        info!(
            target = "opsdeck::channel",
            from = %transition.from,
            to = %transition.to,
            trigger = ?transition.trigger,
            generation = %self.lifecycle.generation(),
            "channel state changed"
        );
        counter!(
            "opsdeck_notify_transitions_total",
            1,
            "from" => transition.from.to_string(),
            "to" => transition.to.to_string()
        );
        if transition.trigger == Trigger::WatchdogExpired {
            self.counters.watchdog_expiries.fetch_add(1, Ordering::Relaxed);
            counter!("opsdeck_notify_watchdog_expiries_total", 1);
            warn!(
                target = "opsdeck::channel",
                "no inbound traffic within the watchdog window; reconnecting"
            );
        }
        let _ = self.transitions_tx.send(*transition);
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport {
                generation,
                address,
            } => {
                self.counters.connect_attempts.fetch_add(1, Ordering::Relaxed);
                counter!("opsdeck_notify_connect_attempts_total", 1);
                debug!(target = "opsdeck::channel", %generation, %address, "opening transport");
                let connector = self.connector.clone();
                let tx = self.events_tx.clone();
                let limit = self.connect_timeout;
                self.connect.track(tokio::spawn(async move {
                    let result = match timeout(limit, connector.connect(&address)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::ConnectTimeout(limit)),
                    };
                    let _ = tx.send(Event::Connected { generation, result });
                }));
            }
            Effect::CloseTransport { generation } => {
                let requested = self.link.as_ref().map(|link| link.close());
                if !matches!(requested, Some(Ok(()))) {
                    debug!(
                        target = "opsdeck::channel",
                        %generation,
                        "link already gone; waiting out close grace"
                    );
                }
            }
            Effect::DropTransport => {
                self.connect.cancel();
                self.pump.cancel();
                self.link = None;
            }
            Effect::SendPing { generation } => self.send_ping(generation),
            Effect::StartHeartbeat {
                generation,
                interval,
            } => {
                self.heartbeat
                    .arm_every(interval, self.events_tx.clone(), move || Event::HeartbeatDue {
                        generation,
                    });
            }
            Effect::StopHeartbeat => {
                self.heartbeat.cancel();
                self.watchdog.cancel();
            }
            Effect::ArmWatchdog { generation, after } => {
                self.watchdog.arm_once(
                    after,
                    self.events_tx.clone(),
                    Event::WatchdogCheck { generation },
                );
            }
            Effect::ScheduleRetry {
                generation,
                delay,
                attempt,
            } => {
                self.counters
                    .reconnects_scheduled
                    .fetch_add(1, Ordering::Relaxed);
                counter!("opsdeck_notify_reconnects_total", 1);
                info!(
                    target = "opsdeck::channel",
                    %generation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.retry
                    .arm_once(delay, self.events_tx.clone(), Event::RetryDue { generation });
            }
            Effect::CancelRetry => self.retry.cancel(),
            Effect::ArmCloseGrace { generation, after } => {
                self.close_grace.arm_once(
                    after,
                    self.events_tx.clone(),
                    Event::CloseGraceElapsed { generation },
                );
            }
            Effect::CancelCloseGrace => self.close_grace.cancel(),
        }
    }

    fn send_ping(&mut self, generation: Generation) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let text = match OutboundFrame::ping_at(OffsetDateTime::now_utc()).to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(target = "opsdeck::channel", error = %err, "failed to encode ping");
                return;
            }
        };
        match link.send_text(text) {
            Ok(()) => {
                self.counters.pings_sent.fetch_add(1, Ordering::Relaxed);
            }
            // The link reports its own close; the watchdog covers the rest.
            Err(err) => debug!(target = "opsdeck::channel", %generation, error = %err, "ping not sent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::transport::mock::mock_transport;
    use crate::transport::LinkCommand;

    fn config() -> ChannelConfig {
        ChannelConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                jitter_fraction: 0.0,
            },
            ..ChannelConfig::default()
        }
    }

    async fn wait_for(client: &NotificationClient, state: ConnectionState) {
        let mut states = client.state_changes();
        states.wait_for(|current| *current == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ping_is_sent_every_heartbeat_interval() {
        let (connector, mut server) = mock_transport();
        let client = NotificationClient::with_connector(config(), connector).unwrap();
        client
            .subscribe(ChannelIdentity::new("A1", "admin").unwrap())
            .unwrap();
        let mut peer = server.next_attempt().await.unwrap().accept();
        wait_for(&client, ConnectionState::Open).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        match peer.recv().await {
            Some(LinkCommand::Text(text)) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "ping");
                assert!(value["timestamp"].as_u64().unwrap() > 0);
            }
            other => panic!("expected ping, got {other:?}"),
        }
        assert_eq!(client.stats().pings_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_counts_as_failure() {
        let (connector, mut server) = mock_transport();
        let client = NotificationClient::with_connector(
            ChannelConfig {
                connect_timeout: Duration::from_secs(5),
                ..config()
            },
            connector,
        )
        .unwrap();
        client
            .subscribe(ChannelIdentity::new("A1", "admin").unwrap())
            .unwrap();
        // Hold the attempt without answering it.
        let _pending = server.next_attempt().await.unwrap();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(client.current_state(), ConnectionState::ReconnectPending);
        assert_eq!(client.stats().reconnects_scheduled, 1);
    }

    #[tokio::test]
    async fn subscribe_rejects_unusable_base() {
        let (connector, _server) = mock_transport();
        let client = NotificationClient::with_connector(
            ChannelConfig {
                server_url: "ftp://example.com".into(),
                ..config()
            },
            connector,
        );
        assert!(matches!(client, Err(ConfigError::InvalidUrl { .. })));
    }
}
