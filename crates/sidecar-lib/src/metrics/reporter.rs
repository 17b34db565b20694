//! Aggregator telemetry stream
//!
//! Connects to the queue proxy over WebSocket with bounded retries and ships
//! the windowed CPU utilization as protobuf frames on a fixed period. The
//! pump stops on the first failed send; supervision belongs to the
//! orchestrator.

use super::collector::CpuUtilizationTracker;
use crate::proto::PodMetrics;
use anyhow::{bail, Result};
use futures_util::SinkExt;
use prost::Message as _;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub reporting_period: Duration,
    /// Scheme-qualified host, e.g. `ws://queue-proxy`.
    pub qp_host: String,
    pub qp_port: u16,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ReporterConfig {
    fn address(&self) -> String {
        format!("{}:{}", self.qp_host, self.qp_port)
    }
}

pub struct MetricsReporter {
    config: ReporterConfig,
    tracker: CpuUtilizationTracker,
}

impl MetricsReporter {
    pub fn new(config: ReporterConfig, tracker: CpuUtilizationTracker) -> Self {
        Self { config, tracker }
    }

    /// Pump loop. Returns when the stream cannot be established or a send
    /// fails.
    pub async fn run(mut self) {
        let addr = self.config.address();
        let mut stream = match self.connect_with_retry(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(address = %addr, reason = %e, "failed to connect to queue proxy");
                return;
            }
        };
        info!(address = %addr, "connected to queue proxy");

        let mut ticker = time::interval(self.config.reporting_period);
        loop {
            ticker.tick().await;
            self.tracker.update().await;

            let metrics = PodMetrics {
                cpu_utilization: self.tracker.average_utilization(),
            };
            if let Err(e) = stream.send(Message::Binary(metrics.encode_to_vec())).await {
                error!(reason = %e, "failed to write message to queue proxy");
                return;
            }
        }
    }

    async fn connect_with_retry(&self, addr: &str) -> Result<WsStream> {
        for attempt in 1..=self.config.max_retries {
            match connect_async(addr).await {
                Ok((stream, _)) => return Ok(stream),
                Err(e) => {
                    warn!(attempt, reason = %e, "queue proxy connection attempt failed");
                }
            }
            time::sleep(self.config.retry_delay).await;
        }
        bail!(
            "could not connect to {} after {} attempts",
            addr,
            self.config.max_retries
        )
    }
}
