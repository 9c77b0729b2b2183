//! Post-setup connectivity check
//!
//! A local forwarder such as `ssh -L` accepts TCP connections on its pool port
//! even when the far side is down, so a bare connect proves nothing. The probe
//! sends one HTTP request through the binding and only succeeds once the
//! agent's web interface has answered.

use async_trait::async_trait;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use outpost_router::ProxyBinding;
use std::time::Duration;
use tracing::debug;

use crate::error::ProbeError;

/// Verifies a fresh binding actually reaches the agent
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, binding: &ProxyBinding) -> Result<(), ProbeError>;
}

/// Sends `GET /` to the binding's upstream port; any HTTP response counts
pub struct HttpProbe {
    client: Client<HttpConnector, String>,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self { client, timeout }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self, binding: &ProxyBinding) -> Result<(), ProbeError> {
        let addr = binding.upstream_addr();
        let unreachable = |reason: String| ProbeError::Unreachable {
            addr: addr.clone(),
            reason,
        };

        let request = http::Request::get(format!("http://{}/", addr))
            .header(http::header::HOST, addr.as_str())
            .body(String::new())
            .map_err(|e| unreachable(format!("invalid request: {}", e)))?;

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    addr = %addr,
                    binding_id = %binding.binding_id,
                    status = %response.status(),
                    "Probe succeeded"
                );
                Ok(())
            }
            // Refused, reset or closed before a response
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(ProbeError::Timeout {
                addr,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_router::ProxyRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept connections on a fresh port and hand each one to `serve`
    async fn listen<F, Fut>(serve: F) -> u16
    where
        F: Fn(tokio::net::TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream));
            }
        });
        port
    }

    fn binding_for(port: u16) -> ProxyBinding {
        ProxyRegistry::default().bind("sess-1", "A1", port).unwrap()
    }

    #[tokio::test]
    async fn test_probe_answering_upstream() {
        let port = listen(|mut stream| async move {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
                .await;
        })
        .await;

        assert!(HttpProbe::default().probe(&binding_for(port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_forwarder_with_dead_far_end() {
        // Accepts locally, then drops the connection like ssh -L does when
        // the remote side cannot be reached
        let port = listen(|stream| async move {
            drop(stream);
        })
        .await;

        let result = HttpProbe::default().probe(&binding_for(port)).await;
        assert!(matches!(result, Err(ProbeError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn test_probe_silent_upstream_times_out() {
        let port = listen(|stream| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        })
        .await;

        let result = HttpProbe::new(Duration::from_millis(200))
            .probe(&binding_for(port))
            .await;
        assert!(matches!(result, Err(ProbeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = HttpProbe::default().probe(&binding_for(port)).await;
        assert!(matches!(result, Err(ProbeError::Unreachable { .. })));
    }
}
