use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use strata_core::event::EventBus;
use strata_core::types::{StreamEvent, StreamEventType};

type Channels = Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>;

/// Fans progress events out to per-execution, per-workflow, and global channels.
///
/// Keyed channels exist only while someone listens: a channel whose last
/// receiver has gone is dropped on the next publish or heartbeat.
pub struct StreamManager {
    global: EventBus,
    executions: Channels,
    workflows: Channels,
    capacity: usize,
}

impl StreamManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            global: EventBus::new(capacity),
            executions: Mutex::new(HashMap::new()),
            workflows: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(channels: &Channels) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<StreamEvent>>> {
        channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn subscribe_in(&self, channels: &Channels, key: &str) -> broadcast::Receiver<StreamEvent> {
        Self::lock(channels)
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send on the channel for `key`, dropping the channel if nobody receives.
    fn send_in(channels: &Channels, key: &str, event: &StreamEvent) {
        let mut channels = Self::lock(channels);
        let unheard = match channels.get(key) {
            Some(tx) => tx.send(event.clone()).is_err(),
            None => false,
        };
        if unheard {
            channels.remove(key);
            debug!(channel = key, "Dropped stream channel without subscribers");
        }
    }

    pub fn publish(&self, event: StreamEvent) {
        Self::send_in(&self.executions, &event.execution_id, &event);
        if let Some(workflow_id) = &event.workflow_id {
            Self::send_in(&self.workflows, workflow_id, &event);
        }
        self.global.publish(event);
    }

    pub fn subscribe_execution(&self, execution_id: &str) -> broadcast::Receiver<StreamEvent> {
        self.subscribe_in(&self.executions, execution_id)
    }

    pub fn subscribe_workflow(&self, workflow_id: &str) -> broadcast::Receiver<StreamEvent> {
        self.subscribe_in(&self.workflows, workflow_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<StreamEvent> {
        self.global.subscribe()
    }

    /// Drop an execution's channel; its subscribers see the stream end.
    pub fn close_execution(&self, execution_id: &str) {
        Self::lock(&self.executions).remove(execution_id);
    }

    pub fn open_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = Self::lock(&self.executions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn open_workflows(&self) -> Vec<String> {
        let mut ids: Vec<String> = Self::lock(&self.workflows).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send one heartbeat on every open execution channel, and drop channels
    /// nobody listens on any more.
    pub fn heartbeat(&self) {
        Self::lock(&self.executions).retain(|execution_id, tx| {
            tx.send(StreamEvent::new(
                StreamEventType::Heartbeat,
                execution_id.clone(),
                None,
                serde_json::json!({}),
            ))
            .is_ok()
        });
        Self::lock(&self.workflows).retain(|_, tx| tx.receiver_count() > 0);
    }

    /// Run the heartbeat loop. Blocks until cancelled.
    pub async fn run_heartbeat(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Stream heartbeat started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    info!("Stream heartbeat shutting down");
                    break;
                }
            }
            debug!(channels = self.open_executions().len(), "Stream heartbeat");
            self.heartbeat();
        }
    }

    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_heartbeat(interval, cancel).await })
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(256)
    }
}
