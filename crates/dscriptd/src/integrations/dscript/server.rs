use std::time::Duration;

use tracing::debug;
use tracing::info;

use super::channel::Topic;
use super::dispatch::EventQueue;
use super::error::Error;
use super::error::Result;
use super::protocol::EventServer;

/// Readiness checks after a start or stop request.
const READINESS_POLLS: u32 = 10;
const READINESS_INTERVAL: Duration = Duration::from_secs(1);

/// The built-in event server of an integration instance.
pub struct BuiltInServer {
    entry_id: String,
    server: Box<dyn EventServer>,
    interval: Duration,
}

impl BuiltInServer {
    /// Wrap `server` and route every topic into `queue`.
    pub fn new(
        entry_id: impl Into<String>,
        mut server: Box<dyn EventServer>,
        aes_key: &str,
        queue: &EventQueue,
    ) -> Self {
        if !aes_key.is_empty() {
            server.set_aes_key(aes_key);
        }
        for topic in Topic::ALL {
            server.add_event_handler(topic, queue.handler());
        }
        Self {
            entry_id: entry_id.into(),
            server,
            interval: READINESS_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    async fn wait_for(&self, running: bool) -> Result<()> {
        for _ in 0..READINESS_POLLS {
            if self.server.is_running() == running {
                return Ok(());
            }
            tokio::time::sleep(self.interval).await;
        }
        if self.server.is_running() == running {
            return Ok(());
        }
        let state = if running { "running" } else { "stopped" };
        Err(Error::ServerTimeout(state, READINESS_POLLS))
    }

    pub async fn start(&self) -> Result<()> {
        if self.server.is_running() {
            return Ok(());
        }
        debug!("[{}] Starting event server", self.entry_id);
        self.server.start().await?;
        self.wait_for(true).await?;
        info!("[{}] Event server started", self.entry_id);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if !self.server.is_running() {
            return Ok(());
        }
        debug!("[{}] Stopping event server", self.entry_id);
        self.server.stop().await?;
        self.wait_for(false).await?;
        info!("[{}] Event server stopped", self.entry_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::integrations::dscript::protocol::mock::MockEventServer;

    fn server(mock: &MockEventServer) -> BuiltInServer {
        let (queue, _rx) = EventQueue::new();
        BuiltInServer::new("test", Box::new(mock.clone()), "key", &queue)
            .with_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_registers_all_topics() {
        let mock = MockEventServer::default();
        let _server = server(&mock);
        assert_eq!(mock.handlers.lock().unwrap().len(), Topic::ALL.len());
        assert_eq!(mock.aes_key.lock().unwrap().as_deref(), Some("key"));
    }

    #[tokio::test]
    async fn test_start_and_stop_wait_for_readiness() {
        let mock = MockEventServer::default();
        let server = server(&mock);

        mock.lag.store(3, Ordering::SeqCst);
        server.start().await.unwrap();
        assert!(server.is_running());

        mock.lag.store(3, Ordering::SeqCst);
        server.stop().await.unwrap();
        assert!(!server.is_running());

        // Already stopped
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_times_out() {
        let mock = MockEventServer::default();
        let server = server(&mock);
        mock.lag.store(100, Ordering::SeqCst);

        let err = server.start().await.unwrap_err();
        assert!(matches!(err, Error::ServerTimeout("running", 10)));
    }
}
