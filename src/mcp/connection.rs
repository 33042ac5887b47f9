//! Connection management for tool-provider servers.
//!
//! Live clients are cached by a deterministic signature of their descriptor
//! and reused across requests until they sit idle past the TTL. A request's
//! batch of connect attempts fans out unordered, each attempt raced against
//! the per-transport connect timeout and the whole batch against one overall
//! budget. A server that cannot be reached is excluded from the aggregated
//! tool map; the batch itself never fails because of one bad server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use rmcp::{
    RoleClient, ServiceExt,
    service::RunningService,
    transport::{
        SseClientTransport, StreamableHttpClientTransport, sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::config::TimeoutsConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::schema::sanitize_schema;

/// Live MCP client handle.
pub type McpClient = RunningService<RoleClient, ()>;

/// Transport kind for a tool-provider server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Persistent bidirectional event stream.
    Sse,
    /// Unary request/response over a streaming-capable channel.
    StreamableHttp,
}

/// Connection parameters for one tool-provider server, supplied by the
/// caller per request. Immutable once received.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDescriptor {
    /// Caller-chosen server key used to group tools.
    pub key: String,
    pub transport: TransportKind,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Per-tool call timeout override, seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ServerDescriptor {
    /// Deterministic signature used to deduplicate and reuse connections.
    pub fn cache_key(&self) -> CacheKey {
        let mut headers = self.headers.clone();
        headers.sort();
        let headers: Vec<String> = headers
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        CacheKey(format!(
            "{:?}|{}|{}|{}",
            self.transport,
            self.url,
            headers.join(","),
            self.timeout_secs.map_or_else(String::new, |t| t.to_string()),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

/// One discovered tool with its sanitized parameter schema.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Sanitized: every node carries an explicit type.
    pub schema: Value,
}

pub type ToolMap = HashMap<String, ToolDefinition>;

struct CachedEntry<C> {
    client: C,
    server: String,
    tools: ToolMap,
    last_used: Instant,
}

/// TTL cache of live connections. Generic over the client handle so the
/// eviction logic is testable without a live server.
pub struct ConnectionCache<C> {
    ttl: Duration,
    inner: Mutex<HashMap<CacheKey, CachedEntry<C>>>,
}

pub type McpCache = ConnectionCache<Arc<McpClient>>;

impl<C: Clone> ConnectionCache<C> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Cache hit within the TTL: touch last-used and hand back the live
    /// client with its resolved tool map. No second handshake happens.
    pub fn lookup(&self, key: &CacheKey) -> Option<(C, ToolMap)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.get_mut(key)?;
        if entry.last_used.elapsed() > self.ttl {
            return None;
        }
        entry.last_used = Instant::now();
        Some((entry.client.clone(), entry.tools.clone()))
    }

    /// Insert after a fresh connect. Another request may have populated the
    /// slot while we were connecting; last writer wins.
    pub fn insert(&self, key: CacheKey, server: &str, client: C, tools: ToolMap) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            key,
            CachedEntry {
                client,
                server: server.to_string(),
                tools,
                last_used: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &CacheKey) -> Option<C> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(key).map(|entry| entry.client)
    }

    /// Evict everything idle beyond the TTL and return the clients so the
    /// caller can close them.
    pub fn sweep(&self) -> Vec<C> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<CacheKey> = inner
            .iter()
            .filter(|(_, entry)| entry.last_used.elapsed() > self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| inner.remove(&key).map(|entry| entry.client))
            .collect()
    }

    /// Tool names currently resolvable for a server key, for diagnostics.
    pub fn tools_for(&self, server: &str) -> Option<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .values()
            .find(|entry| entry.server == server)
            .map(|entry| entry.tools.keys().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn backdate(&self, key: &CacheKey, by: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.get_mut(key) {
            entry.last_used -= by;
        }
    }
}

/// Outcome of one request's connect batch.
pub struct ConnectResult {
    /// server key → sanitized tool map. Unreachable servers are absent.
    pub tools_by_server: HashMap<String, ToolMap>,
    /// server key → live client.
    pub clients: HashMap<String, Arc<McpClient>>,
    /// Connections newly established by this request, for cancellation
    /// teardown. Cache reuses are not listed; this request does not own them.
    pub acquired: Vec<(CacheKey, Arc<McpClient>)>,
}

pub struct ConnectionManager {
    cache: Arc<McpCache>,
    timeouts: TimeoutsConfig,
}

impl ConnectionManager {
    pub fn new(cache: Arc<McpCache>, timeouts: TimeoutsConfig) -> Self {
        Self { cache, timeouts }
    }

    pub fn cache(&self) -> Arc<McpCache> {
        Arc::clone(&self.cache)
    }

    /// Spawn the background sweep that closes connections idle beyond the
    /// TTL. Eviction is purely time-based.
    pub fn spawn_sweeper(cache: Arc<McpCache>, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for client in cache.sweep() {
                    tracing::debug!("Evicting idle connection");
                    if let Some(client) = Arc::into_inner(client) {
                        tokio::spawn(async move {
                            let _ = client.cancel().await;
                        });
                    }
                }
            }
        });
    }

    /// Resolve live clients and tool maps for a batch of descriptors.
    ///
    /// Descriptors are deduplicated by cache key. Attempts still pending when
    /// the overall budget expires, or when `cancel` flips, are abandoned
    /// rather than aborted mid-handshake and simply excluded. Cancellation
    /// additionally tears down the connections this request already acquired.
    pub async fn connect_all(
        &self,
        descriptors: &[ServerDescriptor],
        cancel: watch::Receiver<bool>,
    ) -> GatewayResult<ConnectResult> {
        // Dedupe; one cache key may back several caller-chosen server keys.
        let mut groups: HashMap<CacheKey, (ServerDescriptor, Vec<String>)> = HashMap::new();
        for descriptor in descriptors {
            groups
                .entry(descriptor.cache_key())
                .or_insert_with(|| (descriptor.clone(), Vec::new()))
                .1
                .push(descriptor.key.clone());
        }

        let mut result = ConnectResult {
            tools_by_server: HashMap::new(),
            clients: HashMap::new(),
            acquired: Vec::new(),
        };

        let connect_timeout = Duration::from_secs(self.timeouts.connect);
        let mut pending = FuturesUnordered::new();

        for (cache_key, (descriptor, server_keys)) in groups {
            if let Some((client, tools)) = self.cache.lookup(&cache_key) {
                tracing::debug!(server = %descriptor.key, "Reusing cached connection");
                for key in &server_keys {
                    result.tools_by_server.insert(key.clone(), tools.clone());
                    result.clients.insert(key.clone(), Arc::clone(&client));
                }
                continue;
            }

            pending.push(tokio::spawn(async move {
                let attempt = async {
                    let client = establish(&descriptor).await?;
                    let tools = enumerate_tools(&client, &descriptor.key).await?;
                    Ok::<_, GatewayError>((client, tools))
                };
                let outcome = match tokio::time::timeout(connect_timeout, attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::Timeout(format!(
                        "connect to '{}'",
                        descriptor.key
                    ))),
                };
                (cache_key, descriptor, server_keys, outcome)
            }));
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.timeouts.connect_budget);
        let cancel_wait = wait_cancelled(cancel);
        tokio::pin!(cancel_wait);
        let mut cancelled = false;

        while !pending.is_empty() {
            tokio::select! {
                _ = &mut cancel_wait => {
                    cancelled = true;
                    break;
                }
                joined = tokio::time::timeout_at(deadline, pending.next()) => {
                    let Ok(Some(joined)) = joined else {
                        // Budget expired: drop the handles, leaving the
                        // remaining attempts to finish unobserved.
                        tracing::warn!("Connect budget expired; excluding pending servers");
                        break;
                    };
                    let Ok((cache_key, descriptor, server_keys, outcome)) = joined else {
                        continue;
                    };
                    match outcome {
                        Ok((client, tools)) => {
                            let client = Arc::new(client);
                            self.cache.insert(
                                cache_key.clone(),
                                &descriptor.key,
                                Arc::clone(&client),
                                tools.clone(),
                            );
                            result.acquired.push((cache_key, Arc::clone(&client)));
                            for key in &server_keys {
                                result.tools_by_server.insert(key.clone(), tools.clone());
                                result.clients.insert(key.clone(), Arc::clone(&client));
                            }
                        }
                        Err(e) => {
                            // One bad server never fails the batch.
                            tracing::warn!(server = %descriptor.key, "Excluding server: {}", e);
                        }
                    }
                }
            }
        }

        if cancelled {
            let acquired = std::mem::take(&mut result.acquired);
            self.teardown(acquired).await;
            return Err(GatewayError::Internal("request cancelled".to_string()));
        }

        Ok(result)
    }

    /// Tear down connections newly acquired by a cancelled request. Cached
    /// connections reused from prior requests are left untouched.
    pub async fn teardown(&self, acquired: Vec<(CacheKey, Arc<McpClient>)>) {
        for (key, client) in acquired {
            self.cache.remove(&key);
            drop(client);
        }
        // The cache entries held the last strong references; dropping them
        // closes the transports.
    }
}

async fn wait_cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: cancellation can no longer arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Establish a transport for one descriptor. Each transport's client is
/// adapted once, here, to the single call capability used downstream.
async fn establish(descriptor: &ServerDescriptor) -> GatewayResult<McpClient> {
    match descriptor.transport {
        TransportKind::StreamableHttp => {
            let http = http_client(&descriptor.headers, &descriptor.key)?;
            let config = StreamableHttpClientTransportConfig::with_uri(descriptor.url.clone());
            let transport = StreamableHttpClientTransport::with_client(http, config);
            ().serve(transport)
                .await
                .map_err(|e| GatewayError::Connect {
                    server: descriptor.key.clone(),
                    reason: format!("initialize streamable client: {}", e),
                })
        }
        TransportKind::Sse => {
            let http = http_client(&descriptor.headers, &descriptor.key)?;
            let config = SseClientConfig {
                sse_endpoint: descriptor.url.clone().into(),
                ..Default::default()
            };
            let transport = SseClientTransport::start_with_client(http, config)
                .await
                .map_err(|e| GatewayError::Connect {
                    server: descriptor.key.clone(),
                    reason: format!("create SSE transport: {}", e),
                })?;
            ().serve(transport)
                .await
                .map_err(|e| GatewayError::Connect {
                    server: descriptor.key.clone(),
                    reason: format!("initialize SSE client: {}", e),
                })
        }
    }
}

fn http_client(headers: &[(String, String)], server: &str) -> GatewayResult<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            GatewayError::Connect {
                server: server.to_string(),
                reason: format!("invalid header name '{}': {}", name, e),
            }
        })?;
        let value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
            GatewayError::Connect {
                server: server.to_string(),
                reason: format!("invalid header value: {}", e),
            }
        })?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::Connect {
            server: server.to_string(),
            reason: format!("build HTTP client: {}", e),
        })
}

/// Resolve the server's tool list and sanitize every parameter schema on the
/// way in. Malformed schemas are corrected in place, never surfaced.
async fn enumerate_tools(client: &McpClient, server: &str) -> GatewayResult<ToolMap> {
    let tools = client
        .peer()
        .list_all_tools()
        .await
        .map_err(|e| GatewayError::Connect {
            server: server.to_string(),
            reason: format!("list tools: {}", e),
        })?;

    tracing::info!(server = %server, count = tools.len(), "Discovered tools");

    let mut map = ToolMap::new();
    for tool in tools {
        let mut schema = Value::Object((*tool.input_schema).clone());
        sanitize_schema(&mut schema);
        let name = tool.name.to_string();
        map.insert(
            name.clone(),
            ToolDefinition {
                name,
                description: tool
                    .description
                    .as_deref()
                    .unwrap_or_default()
                    .to_string(),
                schema,
            },
        );
    }
    Ok(map)
}
