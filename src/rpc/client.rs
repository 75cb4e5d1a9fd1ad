use std::io;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::RpcConfig;
use crate::proto::{
    NodeSnapshot, ProbeResultRequest, ProbeSample, ProbeTask, ProbeTaskRequest, StatusResponse,
    SEND_METRICS_PATH, SEND_PROBE_RESULTS_PATH, SEND_PROBE_TASKS_PATH,
};

/// Errors surfaced by RPC calls.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("connecting to {endpoint} failed after {attempts} attempts: {source}")]
    Connect {
        endpoint: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("{method} to {endpoint}: {source}")]
    Transport {
        endpoint: String,
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} to {endpoint} rejected (HTTP {status}): {message}")]
    Rejected {
        endpoint: String,
        method: &'static str,
        status: u16,
        message: String,
    },

    #[error("{method} to {endpoint}: undecodable response: {source}")]
    Decode {
        endpoint: String,
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Formats `host:port`, bracketing IPv6 literals.
pub fn endpoint(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{host}:{port}"),
    }
}

/// Established RPC channel to one remote service endpoint.
///
/// Establishment verifies TCP reachability, retrying a fixed number of times
/// with a fixed backoff. Calls made afterwards are never retried.
#[derive(Debug, Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
}

impl RpcClient {
    /// Establish a channel to `endpoint` (host:port).
    pub async fn connect(endpoint: &str, cfg: &RpcConfig) -> Result<Self, RpcError> {
        let attempts = cfg.connect_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            let err = match tokio::time::timeout(cfg.timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(_stream)) => break,
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            };

            if attempt >= attempts {
                return Err(RpcError::Connect {
                    endpoint: endpoint.to_string(),
                    attempts,
                    source: err,
                });
            }

            debug!(endpoint, attempt, error = %err, "rpc connect failed, retrying");
            tokio::time::sleep(cfg.connect_backoff).await;
        }

        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|source| RpcError::Transport {
                endpoint: endpoint.to_string(),
                method: "connect",
                source,
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }

    /// Returns the remote endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// ProbeTaskService.SendProbeTasks
    pub async fn send_probe_tasks(&self, tasks: Vec<ProbeTask>) -> Result<(), RpcError> {
        self.call(
            "SendProbeTasks",
            SEND_PROBE_TASKS_PATH,
            &ProbeTaskRequest { tasks },
        )
        .await
    }

    /// ProbeResultService.SendProbeResults
    pub async fn send_probe_results(&self, results: Vec<ProbeSample>) -> Result<(), RpcError> {
        self.call(
            "SendProbeResults",
            SEND_PROBE_RESULTS_PATH,
            &ProbeResultRequest { results },
        )
        .await
    }

    /// MetricsService.SendMetrics
    pub async fn send_metrics(&self, snapshot: &NodeSnapshot) -> Result<(), RpcError> {
        self.call("SendMetrics", SEND_METRICS_PATH, snapshot).await
    }

    async fn call<T: Serialize + ?Sized>(
        &self,
        method: &'static str,
        path: &str,
        body: &T,
    ) -> Result<(), RpcError> {
        let url = format!("http://{}{}", self.endpoint, path);

        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| RpcError::Transport {
                endpoint: self.endpoint.clone(),
                method,
                source,
            })?;

        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<StatusResponse>(&text)
                .ok()
                .and_then(|s| s.message)
                .unwrap_or(text);

            return Err(RpcError::Rejected {
                endpoint: self.endpoint.clone(),
                method,
                status: status.as_u16(),
                message,
            });
        }

        let ack: StatusResponse = response.json().await.map_err(|source| RpcError::Decode {
            endpoint: self.endpoint.clone(),
            method,
            source,
        })?;

        if !ack.is_ok() {
            return Err(RpcError::Rejected {
                endpoint: self.endpoint.clone(),
                method,
                status: status.as_u16(),
                message: ack.message.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fast_rpc() -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_millis(500),
            connect_attempts: 2,
            connect_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_endpoint_ipv4() {
        assert_eq!(endpoint("10.0.0.1", 50051), "10.0.0.1:50051");
    }

    #[test]
    fn test_endpoint_ipv6_is_bracketed() {
        assert_eq!(endpoint("fe80::1", 50051), "[fe80::1]:50051");
    }

    #[test]
    fn test_endpoint_hostname() {
        assert_eq!(endpoint("agent-a", 50051), "agent-a:50051");
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails_after_attempts() {
        // Bind then drop to obtain a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = RpcClient::connect(&addr.to_string(), &fast_rpc())
            .await
            .expect_err("nothing listening");

        match err {
            RpcError::Connect { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connect_to_listening_port_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let client = RpcClient::connect(&addr.to_string(), &fast_rpc())
            .await
            .expect("reachable");
        assert_eq!(client.endpoint(), addr.to_string());
    }
}
