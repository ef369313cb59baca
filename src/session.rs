//! Stdio Session Server
//!
//! Line-delimited JSON-RPC 2.0 over stdio. Unlike the one-shot CLI, a
//! session keeps one [`Service`] (and so one connection cache) alive across
//! requests, so every database operation after the first reuses the cached
//! connection once it passes its liveness check.
//!
//! # Protocol
//! - Each request is a single line of JSON, each response a single line
//! - `-32700` parse error, `-32601` unknown method, `-32603` operation failure
//! - Operation failures carry `data: {"code": ..., "details": [...]}`
//!
//! # Methods
//! `probe`, `discover`, `connect`, `products.names`, `products.list`,
//! `products.describe`, `products.add`, `products.update`, `products.delete`,
//! `products.explain`, `connection.close`, `connection.state`
//!
//! Requests are handled strictly in order.

use std::time::Duration;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::assist::{Embedder, TextGenerator};
use crate::connection::Reachability;
use crate::engine::Driver;
use crate::error::DbReachError;
use crate::service::{ProbeRequest, Service};

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn failure(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(JsonRpcError { code, message, data }) }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeParams {
    port: Option<u16>,
    tls: Option<bool>,
    read_banner: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DiscoverParams {
    ports: Option<Vec<u16>>,
}

#[derive(Debug, Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AddParams {
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateParams {
    name: String,
    description: String,
}

/// Serve requests from stdin until EOF
///
/// # Errors
///
/// Returns an error if stdio communication fails.
pub async fn serve_stdio<D, R, G, E>(service: &mut Service<D, R, G, E>) -> Result<()>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(service, stdin, tokio::io::stdout()).await
}

/// Serve requests from `input`, writing one response line per request to `output`
///
/// # Errors
///
/// Returns an error if reading or writing fails. Request failures are
/// reported in-band and never end the loop.
pub async fn serve<D, R, G, E, I, O>(service: &mut Service<D, R, G, E>, input: I, mut output: O) -> Result<()>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    info!("session started");
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<JsonRpcRequest>(&line) {
            Ok(request) if request.id.is_none() => {
                // Notifications run but are never answered
                let method = request.method.clone();
                handle_request(service, request).await;
                debug!(%method, "notification handled");
                continue;
            }
            Ok(request) => handle_request(service, request).await,
            Err(e) => JsonRpcResponse::failure(None, PARSE_ERROR, format!("Parse error: {e}"), None),
        };

        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
        output.flush().await?;
    }

    // Release the cached connection with the session
    service.close().await;
    info!("session ended");
    Ok(())
}

/// Route a request to its handler
async fn handle_request<D, R, G, E>(service: &mut Service<D, R, G, E>, request: JsonRpcRequest) -> JsonRpcResponse
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    debug!(method = %request.method, "session request");

    let result = match request.method.as_str() {
        "probe" => handle_probe(service, request.params).await,
        "discover" => handle_discover(service, request.params).await,
        "connect" => respond(service.connect().await),
        "products.names" => respond(service.product_names().await),
        "products.list" => respond(service.list_products().await),
        "products.describe" => handle_describe(service, request.params).await,
        "products.add" => handle_add(service, request.params).await,
        "products.update" => handle_update(service, request.params).await,
        "products.delete" => handle_delete(service, request.params).await,
        "products.explain" => handle_explain(service, request.params).await,
        "connection.close" => to_value(service.close().await),
        "connection.state" => to_value(service.state()),
        other => {
            return JsonRpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("Unknown method: {other}"),
                None,
            )
        }
    };

    match result {
        Ok(value) => JsonRpcResponse::success(request.id, value),
        Err(e) => {
            let data = e.downcast_ref::<DbReachError>().map(|err| {
                serde_json::json!({
                    "code": err.error_code(),
                    "details": err.details().unwrap_or_default(),
                })
            });
            JsonRpcResponse::failure(request.id, INTERNAL_ERROR, e.to_string(), data)
        }
    }
}

async fn handle_probe<D, R, G, E>(service: &Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: ProbeParams = parse_params(params)?;
    let request = ProbeRequest {
        port: params.port,
        tls: params.tls,
        read_banner: params.read_banner,
        timeout: params.timeout_secs.map(Duration::from_secs),
    };
    to_value(service.probe(request).await)
}

async fn handle_discover<D, R, G, E>(service: &Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: DiscoverParams = parse_params(params)?;
    to_value(service.discover(params.ports).await)
}

async fn handle_describe<D, R, G, E>(service: &mut Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: NameParams = parse_params(params)?;
    respond(service.describe_product(&params.name).await)
}

async fn handle_add<D, R, G, E>(service: &mut Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: AddParams = parse_params(params)?;
    respond(service.add_product(&params.name, params.description).await)
}

async fn handle_update<D, R, G, E>(service: &mut Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: UpdateParams = parse_params(params)?;
    respond(service.update_product(&params.name, &params.description).await)
}

async fn handle_delete<D, R, G, E>(service: &mut Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: NameParams = parse_params(params)?;
    respond(service.delete_product(&params.name).await)
}

async fn handle_explain<D, R, G, E>(service: &mut Service<D, R, G, E>, params: Option<Value>) -> Result<Value>
where
    D: Driver,
    R: Reachability,
    G: TextGenerator,
    E: Embedder,
{
    let params: NameParams = parse_params(params)?;
    respond(service.explain_product(&params.name).await)
}

/// Missing params are treated as an empty object
fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    serde_json::from_value(params).map_err(|e| DbReachError::invalid_input(format!("Invalid params: {e}")).into())
}

fn respond<T: Serialize>(outcome: crate::error::Result<T>) -> Result<Value> {
    to_value(outcome?)
}

fn to_value(data: impl Serialize) -> Result<Value> {
    Ok(serde_json::to_value(data)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::catalog::Catalog;
    use crate::connection::{ConnectionCache, DiscoverySettings, ProbeOptions, RetryPolicy, TcpProber};
    use crate::engine::{ConnectionConfig, DatabaseType, EngineDriver};
    use crate::service::DefaultService;

    fn offline_service() -> DefaultService {
        let config = ConnectionConfig::new(DatabaseType::Postgres, "127.0.0.1", 1, "app", "secret");
        let cache =
            ConnectionCache::new(EngineDriver, TcpProber, config, DiscoverySettings::disabled(), RetryPolicy::default());
        Service::new(cache, Catalog::new("SMART_RETAIL1").unwrap(), ProbeOptions::default(), None, None)
    }

    async fn run(lines: &str) -> Vec<Value> {
        let mut service = offline_service();
        let mut output = Vec::new();
        serve(&mut service, lines.as_bytes(), &mut output).await.unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_parse_error() {
        let responses = run("{not json}\n").await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[0]["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let responses = run(r#"{"jsonrpc":"2.0","id":7,"method":"tables.drop"}"#).await;
        assert_eq!(responses[0]["id"], 7);
        assert_eq!(responses[0]["error"]["code"], -32601);
        assert!(responses[0]["error"]["message"].as_str().unwrap().contains("tables.drop"));
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let input = "\n   \n{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"connection.state\"}\n\n";
        let responses = run(input).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["result"]["state"], "empty");
        assert_eq!(responses[0]["result"]["endpoint"], "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"method\":\"connection.close\"}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"tables.drop\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"connection.state\"}\n",
        );
        let responses = run(input).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 4);
    }

    #[tokio::test]
    async fn test_close_without_connection() {
        let responses = run(r#"{"jsonrpc":"2.0","id":"c","method":"connection.close"}"#).await;
        assert_eq!(responses[0]["result"], json!({"released": false, "state": "empty"}));
    }

    #[tokio::test]
    async fn test_invalid_params_reported_with_code() {
        let responses = run(r#"{"jsonrpc":"2.0","id":2,"method":"products.describe","params":{}}"#).await;
        let error = &responses[0]["error"];
        assert_eq!(error["code"], -32603);
        assert_eq!(error["data"]["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_explain_without_generator_is_service_error() {
        let responses =
            run(r#"{"jsonrpc":"2.0","id":3,"method":"products.explain","params":{"name":"Lamp"}}"#).await;
        assert_eq!(responses[0]["error"]["data"]["code"], "SERVICE_ERROR");
    }
}
