//! One-shot status polling for flows that cannot rely on the channel.
//!
//! A [`StatusPoller`] repeatedly asks a [`StatusSource`] for the status of a
//! token, classifies each response and stops on the first terminal verdict.
//! Running out of attempts is reported as [`PollOutcome::Exhausted`], never as
//! a failure.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::PollConfig;
use crate::error::{ConfigError, PollError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollVerdict {
    Success,
    Failure { status: String },
    /// Not terminal yet, or not understood. Costs one attempt.
    Inconclusive,
}

pub trait StatusClassifier: Send + Sync {
    fn classify(&self, body: &Value) -> PollVerdict;
}

impl<F> StatusClassifier for F
where
    F: Fn(&Value) -> PollVerdict + Send + Sync,
{
    fn classify(&self, body: &Value) -> PollVerdict {
        self(body)
    }
}

/// `{"payment_status":"paid"}` succeeds, `{"status":"expired"}` fails,
/// anything else is inconclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentStatusClassifier;

impl StatusClassifier for PaymentStatusClassifier {
    fn classify(&self, body: &Value) -> PollVerdict {
        if body.get("payment_status").and_then(Value::as_str) == Some("paid") {
            return PollVerdict::Success;
        }
        match body.get("status").and_then(Value::as_str) {
            Some("expired") => PollVerdict::Failure {
                status: "expired".into(),
            },
            _ => PollVerdict::Inconclusive,
        }
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, token: &str) -> Result<Value, PollError>;
}

#[async_trait]
impl<S: StatusSource + ?Sized> StatusSource for std::sync::Arc<S> {
    async fn fetch(&self, token: &str) -> Result<Value, PollError> {
        (**self).fetch(token).await
    }
}

/// Reads `GET {api}/status/{token}`.
#[derive(Clone)]
pub struct HttpStatusSource {
    http: Client,
    base_url: Url,
}

impl HttpStatusSource {
    pub fn new(config: &PollConfig) -> Result<Self, PollError> {
        config.validate()?;
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: config.api_url()?,
        })
    }

    pub fn status_url(&self, token: &str) -> Result<Url, PollError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .push("status")
            .push(token);
        Ok(url)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, token: &str) -> Result<Value, PollError> {
        let url = self.status_url(token)?;
        let res = self.http.get(url).send().await?;

        if res.status().is_success() {
            Ok(res.json::<Value>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(PollError::UnexpectedStatus { status, body })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Confirmed { attempts: u32 },
    Failed { status: String, attempts: u32 },
    Exhausted { attempts: u32 },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Confirmed { attempts }
            | PollOutcome::Failed { attempts, .. }
            | PollOutcome::Exhausted { attempts } => *attempts,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PollOutcome::Confirmed { .. } => "confirmed",
            PollOutcome::Failed { .. } => "failed",
            PollOutcome::Exhausted { .. } => "exhausted",
        }
    }
}

pub struct StatusPoller<S> {
    source: S,
    classifier: Box<dyn StatusClassifier>,
    max_attempts: u32,
    interval: Duration,
}

impl<S: StatusSource> StatusPoller<S> {
    pub fn new(source: S, config: &PollConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            source,
            classifier: Box::new(PaymentStatusClassifier),
            max_attempts: config.max_attempts,
            interval: config.interval,
        })
    }

    pub fn with_classifier(mut self, classifier: impl StatusClassifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    /// Polls until a terminal verdict or until attempts run out.
    ///
    /// The first request goes out immediately; later ones are spaced by the
    /// configured interval regardless of how quickly the previous one failed.
    pub async fn run(&self, token: &str) -> PollOutcome {
        let mut outcome = PollOutcome::Exhausted {
            attempts: self.max_attempts,
        };
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                sleep(self.interval).await;
            }
            let verdict = match self.source.fetch(token).await {
                Ok(body) => self.classifier.classify(&body),
                Err(err) => {
                    warn!(
                        target = "opsdeck::poll",
                        attempt,
                        error = %err,
                        "status request failed"
                    );
                    PollVerdict::Inconclusive
                }
            };
            debug!(target = "opsdeck::poll", attempt, ?verdict, "status poll attempt");
            counter!("opsdeck_notify_poll_attempts_total", 1);

            match verdict {
                PollVerdict::Success => {
                    outcome = PollOutcome::Confirmed { attempts: attempt };
                    break;
                }
                PollVerdict::Failure { status } => {
                    outcome = PollOutcome::Failed {
                        status,
                        attempts: attempt,
                    };
                    break;
                }
                PollVerdict::Inconclusive => {}
            }
        }

        info!(
            target = "opsdeck::poll",
            outcome = outcome.label(),
            attempts = outcome.attempts(),
            "status poll finished"
        );
        counter!("opsdeck_notify_poll_outcomes_total", 1, "outcome" => outcome.label());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::time::Instant;

    struct Scripted {
        replies: Mutex<VecDeque<Result<Value, PollError>>>,
        seen: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Value, PollError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::default(),
            })
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn fetch(&self, _token: &str) -> Result<Value, PollError> {
            self.seen.lock().push(Instant::now());
            self.replies.lock().pop_front().unwrap_or_else(|| Ok(json!({})))
        }
    }

    fn config(max_attempts: u32) -> PollConfig {
        PollConfig {
            max_attempts,
            ..PollConfig::default()
        }
    }

    #[test]
    fn payment_classifier_reads_both_status_fields() {
        let classifier = PaymentStatusClassifier;
        assert_eq!(
            classifier.classify(&json!({"payment_status": "paid"})),
            PollVerdict::Success
        );
        assert_eq!(
            classifier.classify(&json!({"status": "expired"})),
            PollVerdict::Failure {
                status: "expired".into()
            }
        );
        assert_eq!(
            classifier.classify(&json!({"payment_status": "pending"})),
            PollVerdict::Inconclusive
        );
        assert_eq!(classifier.classify(&json!([1, 2])), PollVerdict::Inconclusive);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_spaced_by_interval() {
        let source = Scripted::new(Vec::new());
        let poller = StatusPoller::new(source.clone(), &config(3)).unwrap();
        let started = Instant::now();

        assert_eq!(poller.run("tok").await, PollOutcome::Exhausted { attempts: 3 });

        let offsets: Vec<_> = source
            .seen
            .lock()
            .iter()
            .map(|at| at.duration_since(started))
            .collect();
        assert_eq!(
            offsets,
            vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_terminal_verdict() {
        let source = Scripted::new(vec![
            Ok(json!({"payment_status": "pending"})),
            Ok(json!({"status": "expired"})),
        ]);
        let poller = StatusPoller::new(source.clone(), &config(5)).unwrap();
        assert_eq!(
            poller.run("tok").await,
            PollOutcome::Failed {
                status: "expired".into(),
                attempts: 2
            }
        );
        assert_eq!(source.seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn request_errors_consume_an_attempt() {
        let source = Scripted::new(vec![
            Err(url::ParseError::EmptyHost.into()),
            Ok(json!({"payment_status": "paid"})),
        ]);
        let poller = StatusPoller::new(source.clone(), &config(5)).unwrap();
        assert_eq!(poller.run("tok").await, PollOutcome::Confirmed { attempts: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier_replaces_the_payment_rules() {
        let source = Scripted::new(vec![Ok(json!({"state": "done"}))]);
        let poller = StatusPoller::new(source.clone(), &config(2))
            .unwrap()
            .with_classifier(|body: &Value| {
                if body["state"] == "done" {
                    PollVerdict::Success
                } else {
                    PollVerdict::Inconclusive
                }
            });
        assert_eq!(poller.run("tok").await, PollOutcome::Confirmed { attempts: 1 });
    }

    #[test]
    fn status_url_escapes_the_token() {
        let source = HttpStatusSource::new(&PollConfig {
            api_url: "https://api.example.com/v1/".into(),
            ..PollConfig::default()
        })
        .unwrap();
        assert_eq!(
            source.status_url("ab/c d").unwrap().as_str(),
            "https://api.example.com/v1/status/ab%2Fc%20d"
        );
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let source = Scripted::new(Vec::new());
        assert!(StatusPoller::new(source.clone(), &config(0)).is_err());
    }
}
