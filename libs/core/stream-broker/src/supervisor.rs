//! Lifecycle of the background loops of many routes

use crate::broker::{DeliveryBroker, TaskHandle, join_tasks};
use crate::error::BrokerError;
use crate::handler::Handler;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Owns the shutdown signal and every spawned loop.
///
/// ```rust,ignore
/// let mut supervisor = Supervisor::new();
/// supervisor.register(broker.normal().as_ref(), "orders", "created", handler);
/// supervisor.run_until(shutdown_signal()).await?;
/// ```
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<TaskHandle>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// A receiver that flips to `true` on shutdown
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start a broker's loops for one route
    pub fn register(
        &mut self,
        broker: &dyn DeliveryBroker,
        channel: &str,
        topic: &str,
        handler: Arc<dyn Handler>,
    ) {
        info!(
            mode = %broker.mode(),
            channel,
            topic,
            handler = handler.name(),
            "Registering route"
        );
        let handles = broker.start(channel, topic, handler, self.subscribe());
        self.handles.extend(handles);
    }

    /// Track an externally spawned loop
    pub fn track(&mut self, handle: TaskHandle) {
        self.handles.push(handle);
    }

    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Signal every loop to stop
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Wait for every loop to exit; the first error wins
    pub async fn join(self) -> Result<(), BrokerError> {
        join_tasks(self.handles).await
    }

    /// Run until `signal` resolves, then stop and drain every loop.
    /// In-flight batches finish before this returns.
    pub async fn run_until<F>(self, signal: F) -> Result<(), BrokerError>
    where
        F: Future<Output = ()>,
    {
        signal.await;
        info!(tasks = self.handles.len(), "Shutting down broker loops");
        self.shutdown();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_reaches_subscribers() {
        let mut supervisor = Supervisor::new();
        let mut rx = supervisor.subscribe();

        supervisor.track(tokio::spawn(async move {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            Ok(())
        }));

        assert_eq!(supervisor.task_count(), 1);
        supervisor.run_until(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_join_surfaces_task_error() {
        let mut supervisor = Supervisor::new();
        supervisor.track(tokio::spawn(async {
            Err(BrokerError::Config("route misconfigured".into()))
        }));

        supervisor.shutdown();
        assert!(supervisor.join().await.is_err());
    }
}
