//! Zabbix trapper sender.
//!
//! Speaks the sender wire format directly: a `ZBXD\x01` header, a
//! little-endian length, and a `sender data` JSON body. The server's `info`
//! string is parsed for processed/failed counts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::errors::{SinkError, SinkResult};

const ZBX_HEADER: &[u8; 5] = b"ZBXD\x01";
/// Upper bound on a trapper response; real answers are a few hundred bytes.
const MAX_RESPONSE_LEN: u64 = 1024 * 1024;

/// One `(host, key, value)` item tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZabbixMetric {
    pub host: String,
    pub key: String,
    pub value: String,
}

impl ZabbixMetric {
    pub fn new(host: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Outcome of one send, mirroring the server's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZabbixSendResult {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Serialize)]
struct SenderRequest<'a> {
    request: &'static str,
    data: &'a [ZabbixMetric],
}

/// Trapper client for one configured Zabbix server.
#[derive(Debug, Clone)]
pub struct ZabbixSender {
    server: String,
    port: u16,
    dry_run: bool,
    single_debug: bool,
}

impl ZabbixSender {
    pub fn new(server: impl Into<String>, port: u16, dry_run: bool, single_debug: bool) -> Self {
        Self {
            server: server.into(),
            port,
            dry_run,
            single_debug,
        }
    }

    /// Sends a batch of item tuples. Transport problems are caught and
    /// reported as `failed = len`, never raised to the caller.
    pub async fn send(&self, metrics: &[ZabbixMetric]) -> ZabbixSendResult {
        if metrics.is_empty() {
            return ZabbixSendResult::default();
        }
        if self.dry_run {
            debug!(count = metrics.len(), "dry run, not sending to zabbix");
            return ZabbixSendResult {
                processed: metrics.len(),
                failed: 0,
            };
        }

        if self.single_debug {
            let mut total = ZabbixSendResult::default();
            for metric in metrics {
                match self.send_batch(std::slice::from_ref(metric)).await {
                    Ok(result) => {
                        info!(key = %metric.key, value = %metric.value, "sent zabbix item");
                        total.processed += result.processed;
                        total.failed += result.failed;
                    }
                    Err(e) => {
                        error!(key = %metric.key, error = %e, "failed to send zabbix item");
                        total.failed += 1;
                    }
                }
            }
            return total;
        }

        match self.send_batch(metrics).await {
            Ok(result) => result,
            Err(e) => {
                error!(server = %self.server, error = %e, "zabbix send failed");
                ZabbixSendResult {
                    processed: 0,
                    failed: metrics.len(),
                }
            }
        }
    }

    async fn send_batch(&self, metrics: &[ZabbixMetric]) -> SinkResult<ZabbixSendResult> {
        let request = encode_request(metrics);
        let address = format!("{}:{}", self.server, self.port);

        let transport_err = |message: String| SinkError::ZabbixTransport {
            server: address.clone(),
            message,
        };

        let mut stream = TcpStream::connect(&address)
            .await
            .map_err(|e| transport_err(e.to_string()))?;
        stream
            .write_all(&request)
            .await
            .map_err(|e| transport_err(e.to_string()))?;

        let mut header = [0u8; 13];
        stream
            .read_exact(&mut header)
            .await
            .map_err(|e| transport_err(e.to_string()))?;
        if &header[..5] != ZBX_HEADER {
            return Err(SinkError::ZabbixProtocol {
                message: "response is missing the ZBXD header".to_string(),
            });
        }
        let body_len = u64::from_le_bytes(
            header[5..13]
                .try_into()
                .map_err(|_| SinkError::ZabbixProtocol {
                    message: "short response header".to_string(),
                })?,
        );
        if body_len > MAX_RESPONSE_LEN {
            return Err(SinkError::ZabbixProtocol {
                message: format!("unreasonable response length {body_len}"),
            });
        }

        let mut body = vec![0u8; body_len as usize];
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| transport_err(e.to_string()))?;

        parse_response(&body)
    }
}

/// Frames the sender-data JSON with the trapper header.
pub fn encode_request(metrics: &[ZabbixMetric]) -> Vec<u8> {
    let body = serde_json::to_vec(&SenderRequest {
        request: "sender data",
        data: metrics,
    })
    .unwrap_or_default();

    let mut frame = Vec::with_capacity(13 + body.len());
    frame.extend_from_slice(ZBX_HEADER);
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Parses the response body's `info` counters.
pub fn parse_response(body: &[u8]) -> SinkResult<ZabbixSendResult> {
    static INFO_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"processed:\s*(\d+);\s*failed:\s*(\d+)").unwrap());

    let parsed: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| SinkError::ZabbixProtocol {
            message: format!("response body is not JSON: {e}"),
        })?;
    let info = parsed["info"]
        .as_str()
        .ok_or_else(|| SinkError::ZabbixProtocol {
            message: "response carries no info field".to_string(),
        })?;
    let caps = INFO_RE
        .captures(info)
        .ok_or_else(|| SinkError::ZabbixProtocol {
            message: format!("unparseable info string '{info}'"),
        })?;

    Ok(ZabbixSendResult {
        processed: caps[1].parse().unwrap_or(0),
        failed: caps[2].parse().unwrap_or(0),
    })
}
