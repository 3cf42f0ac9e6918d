use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

/// Synthetic result codes for probes that got no HTTP response.
pub const PROBE_FAILED: u16 = 404;
pub const PROBE_TIMEOUT: u16 = 408;
pub const PROBE_UNREACHABLE: u16 = 113;

/// Checks whether a board's web interface answers.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    /// HTTP status of the board's index page, or one of the synthetic codes.
    async fn probe(&self, ip: IpAddr) -> u16;
}

pub struct HttpStatusProbe {
    client: reqwest::Client,
}

impl HttpStatusProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpStatusProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl StatusProbe for HttpStatusProbe {
    async fn probe(&self, ip: IpAddr) -> u16 {
        let url = format!("http://{}/index.htm", ip);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().as_u16(),
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                if e.is_timeout() {
                    PROBE_TIMEOUT
                } else if e.is_connect() {
                    PROBE_UNREACHABLE
                } else {
                    PROBE_FAILED
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_connection_maps_to_unreachable() {
        // Free port, released again so the connect is refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HttpStatusProbe::new(Duration::from_secs(2));
        let url = format!("http://127.0.0.1:{}/index.htm", port);
        let err = probe.client.get(&url).send().await.unwrap_err();
        assert!(err.is_connect());
    }
}
