//! etcd v3 JSON gateway client
//!
//! Talks to etcd through its grpc-gateway (`/v3/kv/*`, `/v3/lease/*`,
//! `/v3/watch`). Keys and values travel base64-encoded and 64-bit integers
//! as JSON strings. Transport errors fail over to the next endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use servicerd_common::codec::prefix_range_end;
use servicerd_common::{RegistryError, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{
    KeepAliveResponse, KeepAliveStream, KeyValue, LeaseClient, LeaseId, WatchEvent,
    WatchEventKind, WatchStream,
};

const WATCH_CHANNEL_CAPACITY: usize = 64;
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the gateway client
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Gateway base URLs, e.g. `http://127.0.0.1:2379`
    pub endpoints: Vec<String>,
    pub connect_timeout: Duration,
    /// Timeout for unary calls; watches are not bounded by it
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Num(i64),
        Str(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Num(n) => Ok(n),
        Int64::Str(s) => s.parse().map_err(D::Error::custom),
    }
}

fn decode_b64(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| RegistryError::unavailable(format!("invalid base64 from gateway: {}", e)))
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", deserialize_with = "de_i64")]
    id: i64,
}

#[derive(Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct LeaseKeepAliveEnvelope {
    result: Option<LeaseKeepAliveResult>,
}

#[derive(Deserialize)]
struct LeaseKeepAliveResult {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<String>,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default, deserialize_with = "de_i64")]
    lease: i64,
}

impl RawKeyValue {
    fn decode(self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: String::from_utf8_lossy(&decode_b64(&self.key)?).into_owned(),
            value: decode_b64(&self.value)?,
            lease: self.lease,
        })
    }
}

#[derive(Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Serialize)]
struct WatchCreateRequest {
    key: String,
    range_end: String,
}

#[derive(Deserialize)]
struct WatchEnvelope {
    result: Option<WatchResult>,
}

#[derive(Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<RawWatchEvent>,
    #[serde(default)]
    canceled: bool,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    /// Omitted for PUT, the zero value of the enum
    #[serde(rename = "type", default)]
    kind: Option<String>,
    kv: RawWatchKey,
}

#[derive(Deserialize)]
struct RawWatchKey {
    key: String,
}

impl RawWatchEvent {
    fn decode(self) -> Result<WatchEvent> {
        let kind = match self.kind.as_deref() {
            Some("DELETE") => WatchEventKind::Delete,
            _ => WatchEventKind::Put,
        };
        Ok(WatchEvent {
            kind,
            key: String::from_utf8_lossy(&decode_b64(&self.kv.key)?).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct GatewayInner {
    client: Client,
    config: GatewayConfig,
    current_endpoint: AtomicUsize,
}

/// `LeaseClient` over the etcd v3 JSON gateway. Cheap to clone.
#[derive(Clone)]
pub struct EtcdGatewayClient {
    inner: Arc<GatewayInner>,
}

impl EtcdGatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(RegistryError::unavailable("no etcd endpoints configured"));
        }
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(RegistryError::unavailable)?;

        Ok(Self {
            inner: Arc::new(GatewayInner {
                client,
                config,
                current_endpoint: AtomicUsize::new(0),
            }),
        })
    }

    fn current_endpoint(&self) -> String {
        let endpoints = &self.inner.config.endpoints;
        let index = self.inner.current_endpoint.load(Ordering::Relaxed) % endpoints.len();
        endpoints[index].trim_end_matches('/').to_string()
    }

    fn switch_to_next_endpoint(&self) {
        let next = self.inner.current_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Switched to etcd endpoint index: {}",
            next % self.inner.config.endpoints.len()
        );
    }

    /// Send `body` to `path`, trying each endpoint once on transport errors.
    async fn send<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let mut last_error = None;

        for _ in 0..self.inner.config.endpoints.len() {
            let url = format!("{}{}", self.current_endpoint(), path);
            let mut request = self.inner.client.post(&url).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Request to {} failed: {}", url, e);
                    last_error = Some(e);
                    self.switch_to_next_endpoint();
                }
            }
        }

        Err(RegistryError::unavailable(
            last_error.map_or_else(|| "no endpoint reachable".to_string(), |e| e.to_string()),
        ))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .send(path, body, Some(self.inner.config.request_timeout))
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RegistryError::unavailable(format!(
                "{} returned {}: {}",
                path, status, text
            )));
        }
        response.json::<T>().await.map_err(RegistryError::unavailable)
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Option<KeepAliveResponse>> {
        let envelope: LeaseKeepAliveEnvelope = self
            .post("/v3/lease/keepalive", &LeaseIdRequest { id: lease.to_string() })
            .await?;
        Ok(envelope
            .result
            .filter(|r| r.ttl > 0)
            .map(|r| KeepAliveResponse {
                id: if r.id == 0 { lease } else { r.id },
                ttl: Duration::from_secs(r.ttl as u64),
            }))
    }

    async fn open_watch(&self, request: &WatchRequest) -> Result<Response> {
        let response = self.send("/v3/watch", request, None).await?;
        if !response.status().is_success() {
            return Err(RegistryError::unavailable(format!(
                "/v3/watch returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

/// Forward events from one watch response until it ends.
///
/// Returns `false` when the receiver is gone and watching should stop.
async fn pump_watch(
    response: Response,
    tx: &mpsc::Sender<WatchEvent>,
    cancel: &CancellationToken,
) -> bool {
    let mut body = Box::pin(response.bytes_stream());
    let mut buffer = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return false,
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                warn!("Watch stream error: {}", e);
                return true;
            }
            None => return true,
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let frame = buffer.split_to(pos + 1);
            let line = &frame[..pos];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let envelope: WatchEnvelope = match serde_json::from_slice(line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Skipping malformed watch message: {}", e);
                    continue;
                }
            };
            let Some(result) = envelope.result else { continue };
            for raw in result.events {
                match raw.decode() {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => warn!("Skipping undecodable watch event: {}", e),
                }
            }
            if result.canceled {
                return true;
            }
        }
    }
}

#[async_trait]
impl LeaseClient for EtcdGatewayClient {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let ttl = ttl.as_secs().max(1) as i64;
        let response: LeaseGrantResponse = self.post("/v3/lease/grant", &LeaseGrantRequest { ttl }).await?;
        Ok(response.id)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let response = self
            .send(
                "/v3/lease/revoke",
                &LeaseIdRequest { id: lease.to_string() },
                Some(self.inner.config.request_timeout),
            )
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if text.contains("lease not found") {
            return Ok(());
        }
        Err(RegistryError::unavailable(format!("revoke lease {}: {}", lease, text)))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let first = self
            .keep_alive_once(lease)
            .await?
            .ok_or_else(|| RegistryError::unavailable(format!("lease {} not found", lease)))?;

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stream = KeepAliveStream::new(rx, cancel.clone());
        let client = self.clone();

        tokio::spawn(async move {
            let mut ack = first;
            loop {
                let period = (ack.ttl / 3).max(Duration::from_millis(500));
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(ack) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
                ack = match client.keep_alive_once(lease).await {
                    Ok(Some(ack)) => ack,
                    Ok(None) => {
                        debug!("Lease {} no longer exists, ending keep-alive", lease);
                        return;
                    }
                    Err(e) => {
                        warn!("Keep-alive for lease {} failed: {}", lease, e);
                        return;
                    }
                };
            }
        });

        Ok(stream)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let request = PutRequest {
            key: STANDARD.encode(key),
            value: STANDARD.encode(value),
            lease: lease.map(|id| id.to_string()),
        };
        let _: serde_json::Value = self.post("/v3/kv/put", &request).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let request = RangeRequest {
            key: STANDARD.encode(key),
            range_end: None,
        };
        let response: RangeResponse = self.post("/v3/kv/range", &request).await?;
        response.kvs.into_iter().next().map(RawKeyValue::decode).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let request = RangeRequest {
            key: STANDARD.encode(prefix),
            range_end: Some(STANDARD.encode(prefix_range_end(prefix.as_bytes()))),
        };
        let response: RangeResponse = self.post("/v3/kv/range", &request).await?;
        response.kvs.into_iter().map(RawKeyValue::decode).collect()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let request = RangeRequest {
            key: STANDARD.encode(key),
            range_end: None,
        };
        let _: serde_json::Value = self.post("/v3/kv/deleterange", &request).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let request = WatchRequest {
            create_request: WatchCreateRequest {
                key: STANDARD.encode(prefix),
                range_end: STANDARD.encode(prefix_range_end(prefix.as_bytes())),
            },
        };
        let response = self.open_watch(&request).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let stream = WatchStream::new(rx, cancel.clone());
        let client = self.clone();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            let mut response = response;
            loop {
                if !pump_watch(response, &tx, &cancel).await {
                    return;
                }
                // Reconnect, then force a re-read since events may have been missed.
                response = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(WATCH_RECONNECT_DELAY) => {}
                    }
                    match client.open_watch(&request).await {
                        Ok(response) => break response,
                        Err(e) => debug!("Re-opening watch on {} failed: {}", prefix, e),
                    }
                };
                let resync = WatchEvent {
                    kind: WatchEventKind::Put,
                    key: prefix.clone(),
                };
                if tx.send(resync).await.is_err() {
                    return;
                }
            }
        });

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_de_i64_accepts_strings_and_numbers() {
        let r: LeaseGrantResponse = serde_json::from_str(r#"{"ID":"7587862072","TTL":"15"}"#).unwrap();
        assert_eq!(r.id, 7587862072);
        let r: LeaseGrantResponse = serde_json::from_str(r#"{"ID":42}"#).unwrap();
        assert_eq!(r.id, 42);
        assert!(serde_json::from_str::<LeaseGrantResponse>(r#"{"ID":"x"}"#).is_err());
    }

    #[test]
    fn test_watch_event_decode() {
        let raw: RawWatchEvent = serde_json::from_str(&format!(
            r#"{{"type":"DELETE","kv":{{"key":"{}"}}}}"#,
            STANDARD.encode("/ns/orders/a1")
        ))
        .unwrap();
        let event = raw.decode().unwrap();
        assert_eq!(event.kind, WatchEventKind::Delete);
        assert_eq!(event.key, "/ns/orders/a1");

        let raw: RawWatchEvent = serde_json::from_str(&format!(
            r#"{{"kv":{{"key":"{}","value":"eA=="}}}}"#,
            STANDARD.encode("/ns/orders/a1")
        ))
        .unwrap();
        assert_eq!(raw.decode().unwrap().kind, WatchEventKind::Put);
    }

    #[test]
    fn test_new_requires_endpoints() {
        assert!(EtcdGatewayClient::new(GatewayConfig::new(vec![])).is_err());
        assert!(EtcdGatewayClient::new(GatewayConfig::default()).is_ok());
    }
}
