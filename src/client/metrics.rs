//! Live-metrics subscription client
//!
//! Subscribes to the monitoring push channel over a persistent socket,
//! governed by its own [`ReconnectController`] instance. Unlike the terminal,
//! metrics have a meaningful degraded mode: when the controller gives up the
//! client falls back to periodic pull polling through [`MetricsSource`], and
//! only surfaces an error if polling fails too.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::reconnect::{CloseKind, ReconnectController, ReconnectDecision, ReconnectPolicy};
use crate::directory::ResourceType;

/// Client->server subscription management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum MetricsRequest {
    Subscribe {
        resource_type: ResourceType,
        resource_id: i64,
    },
    Unsubscribe {
        resource_type: ResourceType,
        resource_id: i64,
    },
}

/// Server->client pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsPush {
    Connected {
        message: String,
    },
    Data {
        resource_type: ResourceType,
        resource_id: i64,
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct MetricsSample {
    pub resource_type: ResourceType,
    pub resource_id: i64,
    pub payload: serde_json::Value,
}

/// Pull seam used in degraded mode (the REST monitoring endpoint).
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(
        &self,
        resource_type: ResourceType,
        resource_id: i64,
    ) -> Result<MetricsSample, String>;
}

#[derive(Debug, Clone)]
pub enum MetricsEvent {
    Sample(MetricsSample),
    /// Push channel gave up; samples now come from polling.
    DegradedToPolling,
    /// Polling failed as well - the only error the UI ever sees.
    PollFailed(String),
    Closed,
}

pub struct MetricsClient {
    url: String,
    subscriptions: Vec<(ResourceType, i64)>,
    controller: ReconnectController,
    fallback: Arc<dyn MetricsSource>,
    poll_interval: Duration,
    events_tx: mpsc::Sender<MetricsEvent>,
    events_rx: Mutex<mpsc::Receiver<MetricsEvent>>,
    stopped: AtomicBool,
}

impl MetricsClient {
    pub fn new(
        url: impl Into<String>,
        subscriptions: Vec<(ResourceType, i64)>,
        policy: ReconnectPolicy,
        fallback: Arc<dyn MetricsSource>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(256);
        Arc::new(Self {
            url: url.into(),
            subscriptions,
            controller: ReconnectController::new(policy),
            fallback,
            poll_interval,
            events_tx,
            events_rx: Mutex::new(events_rx),
            stopped: AtomicBool::new(false),
        })
    }

    pub async fn next_event(&self) -> Option<MetricsEvent> {
        self.events_rx.lock().await.recv().await
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Leave degraded mode and try the push channel again.
    pub fn restart(&self) {
        self.controller.reset();
    }

    /// Drive the client until stopped: socket mode with automatic retries,
    /// polling mode after `gave-up`.
    pub async fn run(self: Arc<Self>) {
        while !self.stopped.load(Ordering::SeqCst) {
            let kind = match self.subscribe_and_stream().await {
                Ok(kind) => kind,
                Err(e) => {
                    debug!("metrics socket connect failed: {e}");
                    CloseKind::Abnormal
                }
            };

            match self.controller.on_close(kind) {
                ReconnectDecision::Stop => {
                    self.emit(MetricsEvent::Closed).await;
                    return;
                }
                ReconnectDecision::RetryAfter(delay) => {
                    debug!(
                        attempt = self.controller.attempts(),
                        ?delay,
                        "metrics reconnect scheduled"
                    );
                    tokio::time::sleep(delay).await;
                }
                ReconnectDecision::GiveUp => {
                    self.poll_loop().await;
                }
            }
        }
    }

    /// One socket lifetime: connect, subscribe, stream pushes until close.
    async fn subscribe_and_stream(&self) -> Result<CloseKind, String> {
        let (ws, _) = connect_async(&self.url).await.map_err(|e| e.to_string())?;
        self.controller.on_connected();
        info!("metrics push channel connected");

        let (mut sink, mut stream) = ws.split();
        for (resource_type, resource_id) in &self.subscriptions {
            let request = MetricsRequest::Subscribe {
                resource_type: *resource_type,
                resource_id: *resource_id,
            };
            let text = serde_json::to_string(&request).map_err(|e| e.to_string())?;
            sink.send(Message::Text(text)).await.map_err(|e| e.to_string())?;
        }

        while let Some(message) = stream.next().await {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(CloseKind::Normal);
            }
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<MetricsPush>(&text) {
                    Ok(MetricsPush::Data {
                        resource_type,
                        resource_id,
                        payload,
                    }) => {
                        self.emit(MetricsEvent::Sample(MetricsSample {
                            resource_type,
                            resource_id,
                            payload,
                        }))
                        .await;
                    }
                    Ok(MetricsPush::Connected { message }) => {
                        debug!("metrics channel banner: {message}");
                    }
                    Ok(MetricsPush::Error { message }) => {
                        warn!("metrics channel error: {message}");
                    }
                    Err(e) => warn!("dropping malformed metrics push: {e}"),
                },
                Ok(Message::Close(frame)) => {
                    return Ok(CloseKind::from_close_code(frame.map(|f| u16::from(f.code))));
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("metrics socket error: {e}");
                    return Ok(CloseKind::Abnormal);
                }
            }
        }
        Ok(CloseKind::Abnormal)
    }

    /// Degraded mode: pull each subscription on a fixed interval until the
    /// client is stopped or explicitly restarted.
    async fn poll_loop(&self) {
        info!("metrics push gave up, degrading to pull polling");
        self.emit(MetricsEvent::DegradedToPolling).await;

        let mut ticker = tokio::time::interval(self.poll_interval);
        while !self.stopped.load(Ordering::SeqCst) && self.controller.gave_up() {
            ticker.tick().await;
            for (resource_type, resource_id) in &self.subscriptions {
                match self.fallback.fetch(*resource_type, *resource_id).await {
                    Ok(sample) => self.emit(MetricsEvent::Sample(sample)).await,
                    Err(e) => self.emit(MetricsEvent::PollFailed(e)).await,
                }
            }
        }
    }

    async fn emit(&self, event: MetricsEvent) {
        let _ = self.events_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource;

    #[async_trait]
    impl MetricsSource for FixedSource {
        async fn fetch(
            &self,
            resource_type: ResourceType,
            resource_id: i64,
        ) -> Result<MetricsSample, String> {
            Ok(MetricsSample {
                resource_type,
                resource_id,
                payload: serde_json::json!({ "cpu_percent": 12.5 }),
            })
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl MetricsSource for BrokenSource {
        async fn fetch(&self, _: ResourceType, _: i64) -> Result<MetricsSample, String> {
            Err("monitoring endpoint unavailable".to_string())
        }
    }

    fn fast_policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            multiplier: 1.0,
            max_delay: Duration::from_millis(2),
        }
    }

    #[test]
    fn subscription_frames_roundtrip() {
        let request = MetricsRequest::Subscribe {
            resource_type: ResourceType::Server,
            resource_id: 4,
        };
        let text = serde_json::to_string(&request).unwrap();
        assert_eq!(
            serde_json::from_str::<MetricsRequest>(&text).unwrap(),
            request
        );
        assert!(serde_json::from_str::<MetricsRequest>(r#"{"action":"noop"}"#).is_err());
    }

    #[tokio::test]
    async fn gives_up_and_degrades_to_polling() {
        // Nothing listens on this port; every connect fails fast.
        let client = MetricsClient::new(
            "ws://127.0.0.1:9/metrics",
            vec![(ResourceType::Server, 4)],
            fast_policy(),
            Arc::new(FixedSource),
            Duration::from_millis(5),
        );
        tokio::spawn(client.clone().run());

        let mut degraded = false;
        let mut samples = 0;
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = client.next_event().await {
                match event {
                    MetricsEvent::DegradedToPolling => degraded = true,
                    MetricsEvent::Sample(sample) => {
                        assert!(degraded, "samples must come after the degrade notice");
                        assert_eq!(sample.resource_id, 4);
                        samples += 1;
                        if samples >= 2 {
                            break;
                        }
                    }
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        })
        .await;
        deadline.expect("degraded polling should deliver samples");
        client.stop();
    }

    #[tokio::test]
    async fn polling_failures_are_surfaced() {
        let client = MetricsClient::new(
            "ws://127.0.0.1:9/metrics",
            vec![(ResourceType::Server, 4)],
            fast_policy(),
            Arc::new(BrokenSource),
            Duration::from_millis(5),
        );
        tokio::spawn(client.clone().run());

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client.next_event().await {
                    Some(MetricsEvent::PollFailed(msg)) => break msg,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("poll failure should surface");
        assert!(event.contains("unavailable"));
        client.stop();
    }
}
