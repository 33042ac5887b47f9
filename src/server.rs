//! Gateway HTTP surface: script execution, the sandbox's proxy endpoint and
//! a diagnostic tool listing.
//!
//! Every response is a well-formed JSON object. Tool-level failures come back
//! as `{"error": ...}` payloads with status 200 so the sandboxed script
//! always receives an addressable value; non-2xx statuses are reserved for
//! the surface itself (auth, malformed requests, unknown routes).

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::config::AppConfig;
use crate::enrich;
use crate::error::GatewayError;
use crate::helpers::codegen::{self, SECRET_HEADER};
use crate::helpers::HelperRegistry;
use crate::mcp::{
    ConnectionManager, InvocationStatus, InvocationWrapper, McpCache, McpClient, McpInvoker,
    ServerDescriptor,
};
use crate::metrics::ToolMetrics;
use crate::sandbox::{Sandbox, SandboxRequest, SandboxResult};
use crate::schema::describe_params;

/// Per-execution registry of resolved servers, visible to `/proxy` while the
/// script runs.
struct SessionState {
    registry: HelperRegistry,
    clients: HashMap<String, Arc<McpClient>>,
}

pub struct GatewayState {
    config: AppConfig,
    manager: ConnectionManager,
    cache: Arc<McpCache>,
    metrics: Arc<ToolMetrics>,
    wrapper: InvocationWrapper,
    sandbox: Sandbox,
    proxy_url: String,
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
}

impl GatewayState {
    pub fn new(config: AppConfig, metrics: Arc<ToolMetrics>) -> anyhow::Result<Self> {
        let cache = Arc::new(McpCache::new(Duration::from_secs(config.cache.ttl_secs)));
        let manager = ConnectionManager::new(Arc::clone(&cache), config.timeouts.clone());
        let wrapper = InvocationWrapper::new(
            Arc::clone(&metrics),
            Duration::from_secs(config.timeouts.tool_call),
            config.retry.substitute_first_enum_value,
        );
        let proxy_url = config
            .gateway
            .proxy_url
            .clone()
            .unwrap_or_else(|| format!("http://{}/proxy", config.gateway.bind));
        let sandbox = Sandbox::new(
            &config.sandbox,
            Duration::from_secs(config.timeouts.sandbox_run),
            &proxy_url,
        )
        .context("cannot build sandbox runner")?;

        Ok(Self {
            config,
            manager,
            cache,
            metrics,
            wrapper,
            sandbox,
            proxy_url,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache(&self) -> Arc<McpCache> {
        Arc::clone(&self.cache)
    }

    fn session(&self, id: &str) -> Option<Arc<SessionState>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(id).map(Arc::clone)
    }

    fn register_session(&self, id: String, state: SessionState) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(id, Arc::new(state));
    }

    fn drop_session(&self, id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(id);
    }
}

/// Bind the listener and serve until the process exits.
pub async fn run(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let addr: SocketAddr = state
        .config
        .gateway
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", state.config.gateway.bind))?;

    let make = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(handle(state, req).await) }
            }))
        }
    });

    tracing::info!(%addr, "Gateway listening");
    hyper::Server::bind(&addr)
        .serve(make)
        .await
        .context("gateway server failed")
}

async fn handle(state: Arc<GatewayState>, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if !authorized(state.config.gateway.secret.as_deref(), &req) {
        return json_response(
            StatusCode::UNAUTHORIZED,
            json!({"error": GatewayError::Unauthorized.to_string()}),
        );
    }

    match (method, path.as_str()) {
        (Method::POST, "/execute") => match read_json(req).await {
            Ok(body) => execute(state, body).await,
            Err(message) => json_response(StatusCode::BAD_REQUEST, json!({"error": message})),
        },
        (Method::POST, "/proxy") => match read_json(req).await {
            Ok(body) => proxy(state, body).await,
            Err(message) => json_response(StatusCode::BAD_REQUEST, json!({"error": message})),
        },
        (Method::GET, "/metrics") => match serde_json::to_value(state.metrics.snapshot()) {
            Ok(snapshot) => json_response(StatusCode::OK, snapshot),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": format!("cannot serialize metrics: {e}")}),
            ),
        },
        (Method::POST, "/metrics/reset") => {
            // Counters accumulate for the process lifetime; this is the one
            // explicit operator action that clears them.
            state.metrics.reset();
            json_response(StatusCode::OK, json!({"ok": true}))
        }
        (Method::GET, "/tools") => {
            let server = query_param(req.uri().query(), "server");
            match server {
                Some(server) => tools(state, &server),
                None => json_response(
                    StatusCode::BAD_REQUEST,
                    json!({"error": "missing 'server' query parameter"}),
                ),
            }
        }
        _ => json_response(StatusCode::NOT_FOUND, json!({"error": "no such route"})),
    }
}

fn authorized(secret: Option<&str>, req: &Request<Body>) -> bool {
    // Unconfigured secret is explicit open mode.
    let Some(secret) = secret else {
        return true;
    };
    req.headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == secret)
}

async fn read_json(req: Request<Body>) -> Result<Value, String> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| format!("cannot read request body: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("request body is not valid JSON: {e}"))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn json_response(status: StatusCode, body: Value) -> Response<Body> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::from("{}")))
}

/// Flips the connect-cancellation signal when the owning request future is
/// dropped before the connect batch resolves.
struct CancelOnDrop(watch::Sender<bool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        let _ = self.0.send(true);
    }
}

#[derive(serde::Deserialize)]
struct ExecuteBody {
    script: String,
    #[serde(default)]
    servers: Vec<ServerDescriptor>,
}

async fn execute(state: Arc<GatewayState>, body: Value) -> Response<Body> {
    let request: ExecuteBody = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("invalid execute request: {e}")}),
            );
        }
    };

    // The connect batch runs detached; if the client disconnects and hyper
    // drops this future, the guard flips the signal and the batch tears down
    // whatever it acquired. Cached reuses are untouched either way.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let _cancel_guard = CancelOnDrop(cancel_tx);
    let servers = request.servers.clone();
    let connect_state = Arc::clone(&state);
    let connect =
        tokio::spawn(async move { connect_state.manager.connect_all(&servers, cancel_rx).await });
    let connected = match connect.await {
        Ok(Ok(connected)) => connected,
        Ok(Err(e)) => {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": e.to_string()}),
            );
        }
        Err(e) => {
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": format!("connect task failed: {e}")}),
            );
        }
    };

    let mut entries = Vec::new();
    for descriptor in &request.servers {
        if let Some(tools) = connected.tools_by_server.get(&descriptor.key) {
            entries.push((descriptor.clone(), tools.clone()));
        }
    }
    let registry = HelperRegistry::build(entries);
    if registry.is_empty() {
        tracing::warn!("No servers reachable; script runs with an empty helper surface");
    }

    let session = uuid::Uuid::new_v4().to_string();
    let helper_source = codegen::generate_helper_source(
        &registry,
        &state.proxy_url,
        &session,
        state.config.gateway.secret.as_deref(),
    );
    let tool_names: Vec<String> = registry
        .entries()
        .flat_map(|(_, entry)| entry.tools.keys().cloned())
        .collect();
    let helper_meta = json!({
        "docs": codegen::generate_docs(&registry),
        "servers": registry.server_keys(),
    });

    state.register_session(
        session.clone(),
        SessionState {
            registry,
            clients: connected.clients,
        },
    );

    let result = state
        .sandbox
        .execute(SandboxRequest {
            script: request.script,
            helper_source,
            tool_names,
            helper_meta,
        })
        .await;

    // Connections stay cached for TTL reuse; only the session entry dies.
    state.drop_session(&session);

    let status_ok = matches!(result, SandboxResult::Success { .. });
    tracing::info!(session = %session, ok = status_ok, "execute finished");
    match serde_json::to_value(&result) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": format!("cannot serialize result: {e}")}),
        ),
    }
}

#[derive(serde::Deserialize)]
struct ProxyBody {
    session: String,
    server: String,
    tool: String,
    #[serde(default)]
    args: Value,
}

async fn proxy(state: Arc<GatewayState>, body: Value) -> Response<Body> {
    let request: ProxyBody = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": format!("invalid proxy request: {e}")}),
            );
        }
    };

    let Some(session) = state.session(&request.session) else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"error": format!("unknown session '{}'", request.session)}),
        );
    };

    let payload = invoke_for_session(&state, &session, &request.server, &request.tool, request.args)
        .await;
    json_response(StatusCode::OK, payload)
}

/// Server-side invoke path: resolve name, validate required arguments, call
/// through the wrapper, enrich, and on failure retry once with optional
/// arguments stripped.
async fn invoke_for_session(
    state: &GatewayState,
    session: &SessionState,
    server: &str,
    tool_name: &str,
    args: Value,
) -> Value {
    let Some(entry) = session.registry.entry(server) else {
        return json!({"error": format!(
            "{} (available: {})",
            GatewayError::ServerNotFound(server.to_string()),
            session.registry.server_keys().join(", "),
        )});
    };
    let server_key = entry.descriptor.key.clone();

    let Some(tool) = session.registry.find_tool(server, tool_name).cloned() else {
        let mut known: Vec<String> = entry.tools.keys().cloned().collect();
        known.sort_unstable();
        return json!({"error": format!(
            "tool '{}' not found on server '{}' (known tools: {})",
            tool_name,
            server_key,
            known.join(", "),
        )});
    };

    let args = if args.is_null() { json!({}) } else { args };
    if let Some(missing) = missing_required(&args, &tool.schema) {
        return json!({"error": format!(
            "missing required parameter '{}' for tool '{}'",
            missing, tool.name,
        )});
    }

    let Some(client) = session.clients.get(&server_key) else {
        return json!({"error": format!("server '{}' has no live connection", server_key)});
    };
    let invoker = McpInvoker::new(Arc::clone(client));
    let timeout = entry.descriptor.timeout_secs.map(Duration::from_secs);

    let mut outcome = state
        .wrapper
        .call(&server_key, &tool, &invoker, args.clone(), timeout)
        .await;

    if outcome.status == InvocationStatus::Error {
        if let Some(reduced) = strip_optional_args(&args, &tool.schema) {
            tracing::debug!(tool = %tool.name, "Retrying with required arguments only");
            let retried = state
                .wrapper
                .call(&server_key, &tool, &invoker, reduced, timeout)
                .await;
            if retried.status == InvocationStatus::Success {
                outcome = retried;
            }
        }
    }

    if outcome.status != InvocationStatus::Success {
        // Already a structured {"error": ...} value.
        return outcome.value;
    }

    let extraction = enrich::extract(&outcome.value);
    let hints = enrich::cross_reference(
        &extraction.data,
        &state.config.identifiers,
        &state.config.servers,
    );
    let mut result = match serde_json::to_value(&extraction) {
        Ok(value) => value,
        Err(e) => return json!({"error": format!("cannot serialize extraction: {e}")}),
    };
    if !hints.is_empty() {
        if let (Value::Object(map), Ok(hints)) = (&mut result, serde_json::to_value(&hints)) {
            map.insert("hints".to_string(), hints);
        }
    }
    json!({"result": result})
}

/// First required parameter absent from the arguments, if any.
fn missing_required(args: &Value, schema: &Value) -> Option<String> {
    let params = describe_params(schema);
    let map = args.as_object()?;
    params
        .into_iter()
        .filter(|p| p.required)
        .find(|p| !map.contains_key(&p.name))
        .map(|p| p.name)
}

/// Arguments reduced to the required set, or `None` when nothing would
/// change.
fn strip_optional_args(args: &Value, schema: &Value) -> Option<Value> {
    let map = args.as_object()?;
    let params = describe_params(schema);
    let reduced: serde_json::Map<String, Value> = map
        .iter()
        .filter(|(name, _)| {
            params
                .iter()
                .any(|p| p.required && &p.name == *name)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if reduced.len() == map.len() {
        return None;
    }
    Some(Value::Object(reduced))
}

fn tools(state: Arc<GatewayState>, server: &str) -> Response<Body> {
    // A live session's view wins; otherwise fall back to the cache.
    let from_sessions = {
        let sessions = state.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().find_map(|session| {
            session.registry.entry(server).map(|entry| {
                let mut names: Vec<String> = entry.tools.keys().cloned().collect();
                names.sort_unstable();
                names
            })
        })
    };

    let names = from_sessions.or_else(|| state.cache.tools_for(server));
    match names {
        Some(mut names) => {
            names.sort_unstable();
            json_response(StatusCode::OK, json!({"server": server, "tools": names}))
        }
        None => json_response(
            StatusCode::NOT_FOUND,
            json!({"error": format!("no tools resolvable for server '{}'", server)}),
        ),
    }
}
