use crate::events::{EventStore, StoreError};
use crate::lifecycle::{is_shutting_down, Activity, LifeCycle, ShutdownSubscription};
use crate::metrics;
use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use relay_log_types::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How many unforwarded events one cycle picks up
const MAX_BATCH: usize = 10;
/// How long to sleep when the store has nothing for us
const EMPTY_SLEEP: Duration = Duration::from_secs(1);

/// Delivers an event body to the operator's endpoint and hands back the
/// full response body. Abstracted so tests can observe exactly what
/// would hit the wire.
#[async_trait]
pub trait EventPoster: Send + Sync {
    async fn post(&self, url: &str, body: String) -> anyhow::Result<String>;
}

pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl ReqwestPoster {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EventPoster for ReqwestPoster {
    async fn post(&self, url: &str, body: String) -> anyhow::Result<String> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "text/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        // the endpoint signals acceptance through the body, not the
        // status code
        response.text().await.context("reading response body")
    }
}

pub(crate) enum CycleOutcome {
    /// Nothing was waiting; sleep before the next look
    Idle,
    Forwarded(usize),
}

/// Ships durable events to the operator-configured HTTP endpoint with
/// at-least-once semantics: an event only stops being offered once the
/// endpoint has answered with a `.`-prefixed body and the `forwarded`
/// bit has been persisted.
pub struct EventHttpForwarder {
    url: Option<String>,
    store: Arc<dyn EventStore>,
    poster: Arc<dyn EventPoster>,
    stop_tx: tokio::sync::watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventHttpForwarder {
    pub fn new(
        url: Option<String>,
        store: Arc<dyn EventStore>,
        poster: Arc<dyn EventPoster>,
    ) -> Arc<Self> {
        let (stop_tx, _) = tokio::sync::watch::channel(false);
        Arc::new(Self {
            url,
            store,
            poster,
            stop_tx,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the forwarder worker iff an endpoint is configured
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let Some(url) = self.url.clone() else {
            tracing::info!("event forwarding is not configured");
            return Ok(());
        };
        let activity = Activity::get()?;
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move { me.run_loop(url, activity).await });
        self.worker.lock().replace(handle);
        Ok(())
    }

    /// Set the stop flag and block until the worker observes it.
    /// The in-flight cycle runs to completion first.
    pub async fn stop(&self) {
        self.stop_tx.send(true).ok();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.await.ok();
        }
    }

    async fn run_loop(self: Arc<Self>, url: String, _activity: Activity) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut shutdown = ShutdownSubscription::get();
        tracing::info!("event forwarder running, posting to {url}");
        loop {
            if *stop_rx.borrow() || is_shutting_down() {
                break;
            }
            match self.run_once(&url).await {
                Ok(CycleOutcome::Forwarded(count)) => {
                    tracing::trace!("forwarded {count} events");
                }
                Ok(CycleOutcome::Idle) => {
                    tokio::select! {
                        _ = tokio::time::sleep(EMPTY_SLEEP) => {}
                        _ = stop_rx.changed() => {}
                        _ = shutdown.shutting_down() => {}
                    }
                }
                Err(err) => {
                    // Per-event trouble is retried next cycle; a failure
                    // of the loop itself takes the whole process down
                    tracing::error!("event forwarder cannot continue: {err:#}");
                    LifeCycle::request_shutdown().await;
                    break;
                }
            }
        }
        tracing::info!("event forwarder stopped");
    }

    /// One fetch-and-forward cycle. The batch fans out concurrently,
    /// bounded by the batch size itself.
    pub(crate) async fn run_once(&self, url: &str) -> anyhow::Result<CycleOutcome> {
        let batch = match self.store.events_to_forward(MAX_BATCH).await {
            Ok(events) if events.is_empty() => return Ok(CycleOutcome::Idle),
            Ok(events) => events,
            // some stores say "nothing matched" with an error
            Err(StoreError::Empty) => return Ok(CycleOutcome::Idle),
            Err(StoreError::Other(err)) => {
                return Err(err.context("fetching events to forward"))
            }
        };

        let results = join_all(
            batch
                .into_iter()
                .map(|event| self.forward_one(url, event)),
        )
        .await;
        Ok(CycleOutcome::Forwarded(
            results.into_iter().filter(|forwarded| *forwarded).count(),
        ))
    }

    /// Returns true when the event was acknowledged and marked.
    /// Every failure path leaves the event unforwarded so the next
    /// cycle offers it again.
    async fn forward_one(&self, url: &str, mut event: Event) -> bool {
        if *self.stop_tx.borrow() {
            return false;
        }

        let body = match event.wire_json() {
            Ok(body) => body,
            Err(err) => {
                tracing::error!("failed to serialize event {}: {err:#}", event.id);
                metrics::EVENT_FORWARD_ERRORS.inc();
                return false;
            }
        };

        match self.poster.post(url, body).await {
            Ok(response) if response.trim_start().starts_with('.') => {
                event.forwarded = true;
                match self.store.save(event).await {
                    Ok(()) => {
                        metrics::EVENTS_FORWARDED.inc();
                        true
                    }
                    Err(err) => {
                        tracing::error!("failed to persist the forwarded flag: {err:#}");
                        metrics::EVENT_FORWARD_ERRORS.inc();
                        false
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(
                    "endpoint did not accept event {}: {:?}",
                    event.id,
                    response.chars().take(128).collect::<String>()
                );
                metrics::EVENT_FORWARD_ERRORS.inc();
                false
            }
            Err(err) => {
                tracing::error!("failed to forward event {}: {err:#}", event.id);
                metrics::EVENT_FORWARD_ERRORS.inc();
                false
            }
        }
    }
}
