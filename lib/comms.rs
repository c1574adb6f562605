//! Typed in-memory comms capabilities.
//!
//! The orchestrator never sees a wire: it talks to `Sender`s (send with a
//! timeout) and drives `Receiver`s by installing a callback while a run is
//! active. Connections are declared in a module configuration and resolved
//! by data-type tag through the [`IoRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::{warn, Instrument};

use crate::types::{TriggerDecision, TriggerDecisionToken, TriggerInhibit};

#[derive(Error, Debug)]
pub enum SendError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Closed,
}

/// Outbound capability: a named connection that accepts one message at a
/// time within a bounded wait.
#[async_trait]
pub trait Sender<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Observational readiness probe; a `false` result is not fatal.
    fn is_ready(&self) -> bool;

    async fn send(&self, message: T, timeout: Duration)
        -> Result<(), SendError>;
}

pub type DynSender<T> = Arc<dyn Sender<T>>;

/// [`Sender`] over a bounded tokio channel.
pub struct ChannelSender<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T> ChannelSender<T> {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<T>) -> Self {
        Self {
            name: name.into(),
            tx,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Sender<T> for ChannelSender<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_ready(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(
        &self,
        message: T,
        timeout: Duration,
    ) -> Result<(), SendError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendError::Timeout(timeout),
                SendTimeoutError::Closed(_) => SendError::Closed,
            })
    }
}

struct Subscription<T> {
    stop: watch::Sender<bool>,
    join: JoinHandle<mpsc::Receiver<T>>,
}

/// Inbound capability. `subscribe` installs a callback task that drains the
/// channel, processing one message to completion at a time in arrival
/// order; `unsubscribe` stops the task and hands the channel back so a
/// later run can subscribe again.
pub struct Receiver<T> {
    name: String,
    channel: Mutex<Option<mpsc::Receiver<T>>>,
    subscription: tokio::sync::Mutex<Option<Subscription<T>>>,
}

impl<T: Send + 'static> Receiver<T> {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<T>) -> Self {
        Self {
            name: name.into(),
            channel: Mutex::new(Some(rx)),
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn subscribe<F, Fut>(&self, handler: F)
    where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            warn!(connection = %self.name, "Callback already installed");
            return;
        }
        let Some(mut rx) = self.channel.lock().unwrap().take() else {
            warn!(connection = %self.name, "Channel is gone, cannot subscribe");
            return;
        };
        let (stop, mut stopped) = watch::channel(false);
        // The callback task logs under the span and subscriber of whoever
        // installed it.
        let join = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        message = rx.recv() => match message {
                            Some(message) => handler(message).await,
                            None => break,
                        },
                        _ = stopped.changed() => break,
                    }
                }
                rx
            }
            .instrument(tracing::Span::current())
            .with_current_subscriber(),
        );
        *subscription = Some(Subscription { stop, join });
    }

    /// Removes the callback, waiting for an in-flight message to finish.
    pub async fn unsubscribe(&self) {
        let mut subscription = self.subscription.lock().await;
        if let Some(Subscription { stop, join }) = subscription.take() {
            let _ = stop.send(true);
            if let Ok(rx) = join.await {
                *self.channel.lock().unwrap() = Some(rx);
            }
        }
    }
}

/// Data-type tag a connection is discovered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    TriggerDecision,
    TriggerDecisionToken,
    TriggerInhibit,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::TriggerDecision => "TriggerDecision",
            DataType::TriggerDecisionToken => "TriggerDecisionToken",
            DataType::TriggerInhibit => "TriggerInhibit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDecl {
    pub uid: String,
    pub data_type: DataType,
}

impl ConnectionDecl {
    pub fn new(uid: impl Into<String>, data_type: DataType) -> Self {
        Self {
            uid: uid.into(),
            data_type,
        }
    }
}

/// The slice of the module configuration the orchestrator consumes: its
/// input and output connections, each carrying a data-type tag.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleConfig {
    pub inputs: Vec<ConnectionDecl>,
    pub outputs: Vec<ConnectionDecl>,
}

/// Registry of instantiated channel endpoints, keyed by connection uid.
/// Receivers are taken (moved out) by the module that owns them; senders
/// are shared.
#[derive(Default)]
pub struct IoRegistry {
    decision_receivers: HashMap<String, Receiver<TriggerDecision>>,
    token_receivers: HashMap<String, Receiver<TriggerDecisionToken>>,
    inhibit_senders: HashMap<String, DynSender<TriggerInhibit>>,
    decision_senders: HashMap<String, DynSender<TriggerDecision>>,
}

impl IoRegistry {
    pub fn add_decision_receiver(
        &mut self,
        uid: impl Into<String>,
        receiver: Receiver<TriggerDecision>,
    ) {
        self.decision_receivers.insert(uid.into(), receiver);
    }

    pub fn add_token_receiver(
        &mut self,
        uid: impl Into<String>,
        receiver: Receiver<TriggerDecisionToken>,
    ) {
        self.token_receivers.insert(uid.into(), receiver);
    }

    pub fn add_inhibit_sender(
        &mut self,
        uid: impl Into<String>,
        sender: DynSender<TriggerInhibit>,
    ) {
        self.inhibit_senders.insert(uid.into(), sender);
    }

    pub fn add_decision_sender(
        &mut self,
        uid: impl Into<String>,
        sender: DynSender<TriggerDecision>,
    ) {
        self.decision_senders.insert(uid.into(), sender);
    }

    pub fn take_decision_receiver(
        &mut self,
        uid: &str,
    ) -> Option<Receiver<TriggerDecision>> {
        self.decision_receivers.remove(uid)
    }

    pub fn take_token_receiver(
        &mut self,
        uid: &str,
    ) -> Option<Receiver<TriggerDecisionToken>> {
        self.token_receivers.remove(uid)
    }

    pub fn inhibit_sender(&self, uid: &str) -> Option<DynSender<TriggerInhibit>> {
        self.inhibit_senders.get(uid).cloned()
    }

    pub fn decision_sender(
        &self,
        uid: &str,
    ) -> Option<DynSender<TriggerDecision>> {
        self.decision_senders.get(uid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test]
    async fn send_timeout_and_closed_are_distinguished() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let sender = ChannelSender::new("out", tx);

        sender.send(1, Duration::from_millis(10)).await.unwrap();
        // Channel full now; the next send must time out.
        let err = sender.send(2, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SendError::Timeout(_)));

        drop(rx);
        let err = sender.send(3, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
        assert!(!sender.is_ready());
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_cycle_preserves_the_channel() {
        let (tx, rx) = mpsc::channel::<u64>(8);
        let receiver = Receiver::new("in", rx);
        let seen = Arc::new(AtomicU64::new(0));

        let sink = seen.clone();
        receiver
            .subscribe(move |value| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(value, Ordering::SeqCst);
                }
            })
            .await;

        tx.send(3).await.unwrap();
        tx.send(4).await.unwrap();
        while seen.load(Ordering::SeqCst) != 7 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        receiver.unsubscribe().await;

        // Messages sent while no callback is installed stay queued for the
        // next subscriber.
        tx.send(5).await.unwrap();
        let sink = seen.clone();
        receiver
            .subscribe(move |value| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(value, Ordering::SeqCst);
                }
            })
            .await;
        while seen.load(Ordering::SeqCst) != 12 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        receiver.unsubscribe().await;
    }
}
