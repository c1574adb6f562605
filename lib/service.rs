//! Service context and shutdown plumbing shared by the daemon services.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{Config, ConfigLoader};

/// A latched shutdown flag. Cloning produces a new listener on the same
/// flag; the signal is broadcast once and observed by every clone.
pub struct Shutdown {
    notify: Arc<watch::Sender<bool>>,
    watch: watch::Receiver<bool>,
}

impl Clone for Shutdown {
    fn clone(&self) -> Self {
        Self {
            notify: self.notify.clone(),
            watch: self.notify.subscribe(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        let (notify, watch) = watch::channel(false);
        Self {
            notify: Arc::new(notify),
            watch,
        }
    }
}

impl Shutdown {
    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        *self.watch.borrow()
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if *self.watch.borrow() {
            return;
        }
        // The sender half is held in `self`, so the channel cannot close
        // before the flag flips.
        while self.watch.changed().await.is_ok() {
            if *self.watch.borrow() {
                return;
            }
        }
    }

    /// Causes all listeners to start the shutdown sequence.
    pub fn broadcast_shutdown(&self) {
        let _ = self.notify.send(true);
    }
}

#[derive(Clone)]
pub struct ServiceContext {
    name: String,
    config_loader: Arc<ConfigLoader>,
    shutdown: Shutdown,
}

impl ServiceContext {
    pub fn new(
        name: String,
        config_loader: Arc<ConfigLoader>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            name,
            config_loader,
            shutdown,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn get_config(&self) -> Config {
        self.config_loader.load().unwrap()
    }

    pub fn config_loader(&self) -> Arc<ConfigLoader> {
        self.config_loader.clone()
    }

    /// Awaits the shutdown signal
    pub async fn recv_shutdown_signal(&mut self) {
        self.shutdown.recv().await
    }

    /// Causes all listeners to start the shutdown sequence.
    pub fn broadcast_shutdown(&mut self) {
        self.shutdown.broadcast_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_is_latched_across_clones() {
        let shutdown = Shutdown::default();
        let mut listener = shutdown.clone();
        assert!(!listener.is_shutdown());

        shutdown.broadcast_shutdown();
        listener.recv().await;
        assert!(listener.is_shutdown());

        // Clones taken after the broadcast observe the latched flag.
        let mut late = shutdown.clone();
        late.recv().await;
    }
}
