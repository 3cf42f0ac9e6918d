//! Platform setup orchestration.
//!
//! Setup passes for one integration instance run one at a time, and a
//! platform is never set up again while its previous setup is still running.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use super::channel::Platform;

/// Whatever registers a platform's entities with the host.
#[async_trait]
pub trait PlatformHost: Send + Sync + 'static {
    async fn setup_platform(&self, platform: Platform);
}

#[derive(Debug, Default)]
struct PlatformState {
    loaded: BTreeSet<Platform>,
    in_setup: BTreeSet<Platform>,
}

#[derive(Debug, Default)]
pub struct PlatformSetup {
    /// Held for the duration of a setup pass
    running: Mutex<()>,
    state: std::sync::Mutex<PlatformState>,
    settled: Notify,
}

impl PlatformSetup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_loaded(&self, platform: Platform) -> bool {
        self.state
            .lock()
            .map(|s| s.loaded.contains(&platform))
            .unwrap_or(false)
    }

    pub fn in_setup(&self, platform: Platform) -> bool {
        self.state
            .lock()
            .map(|s| s.in_setup.contains(&platform))
            .unwrap_or(false)
    }

    async fn wait_settled(&self, platform: Platform) {
        loop {
            let settled = self.settled.notified();
            if !self.in_setup(platform) {
                return;
            }
            settled.await;
        }
    }

    fn finish(&self, platform: Platform) {
        if let Ok(mut state) = self.state.lock() {
            state.in_setup.remove(&platform);
        }
        self.settled.notify_waiters();
    }

    /// Kick off setup of `platforms`.
    ///
    /// Waits for any running pass first. Returns the handles of the spawned
    /// per-platform setups.
    pub async fn setup<H: PlatformHost>(
        self: &Arc<Self>,
        host: Arc<H>,
        platforms: &[Platform],
    ) -> Vec<JoinHandle<()>> {
        let _running = self.running.lock().await;
        let mut handles = Vec::with_capacity(platforms.len());

        for &platform in platforms {
            if self.is_loaded(platform) {
                self.wait_settled(platform).await;
                debug!("Reloading platform {}", platform);
            } else {
                debug!("Loading platform {}", platform);
            }

            if let Ok(mut state) = self.state.lock() {
                state.loaded.insert(platform);
                state.in_setup.insert(platform);
            }

            let this = self.clone();
            let host = host.clone();
            handles.push(tokio::spawn(async move {
                host.setup_platform(platform).await;
                this.finish(platform);
            }));
        }

        handles
    }
}
