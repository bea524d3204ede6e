use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const TARGET_PREFIX: &str = "AmazonEC2ContainerRegistry_V20150921.";

#[derive(Default)]
struct EcrState {
    repositories: Vec<String>,
    page_size: usize,
    operations: Vec<String>,
    max_results: Vec<u64>,
    registry_ids: Vec<String>,
    token: String,
}

/// Control-plane double answering the three ECR operations the mirror uses.
#[derive(Clone)]
pub struct MockEcr {
    state: Arc<Mutex<EcrState>>,
}

impl MockEcr {
    pub fn new(repositories: &[&str], page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(EcrState {
                repositories: repositories.iter().map(|name| name.to_string()).collect(),
                page_size: page_size.max(1),
                token: STANDARD.encode("AWS:ecr-secret"),
                ..EcrState::default()
            })),
        }
    }

    pub fn operations(&self) -> Vec<String> {
        self.state.lock().unwrap().operations.clone()
    }

    pub fn max_results(&self) -> Vec<u64> {
        self.state.lock().unwrap().max_results.clone()
    }

    pub fn registry_ids(&self) -> Vec<String> {
        self.state.lock().unwrap().registry_ids.clone()
    }

    pub fn repositories(&self) -> Vec<String> {
        self.state.lock().unwrap().repositories.clone()
    }

    fn handle(&self, operation: &str, payload: &Value) -> (StatusCode, Value) {
        let mut state = self.state.lock().unwrap();
        state.operations.push(operation.to_owned());
        if let Some(id) = payload.get("registryId").and_then(Value::as_str) {
            state.registry_ids.push(id.to_owned());
        }

        match operation {
            "DescribeRepositories" => {
                if let Some(max) = payload.get("maxResults").and_then(Value::as_u64) {
                    state.max_results.push(max);
                }
                let start: usize = payload
                    .get("nextToken")
                    .and_then(Value::as_str)
                    .and_then(|token| token.parse().ok())
                    .unwrap_or(0);
                let end = (start + state.page_size).min(state.repositories.len());
                let repositories: Vec<Value> = state.repositories[start.min(end)..end]
                    .iter()
                    .map(|name| json!({ "repositoryName": name }))
                    .collect();
                let mut response = json!({ "repositories": repositories });
                if end < state.repositories.len() {
                    response["nextToken"] = Value::String(end.to_string());
                }
                (StatusCode::OK, response)
            }
            "CreateRepository" => {
                let Some(name) = payload.get("repositoryName").and_then(Value::as_str) else {
                    return (
                        StatusCode::BAD_REQUEST,
                        json!({ "__type": "InvalidParameterException", "message": "missing name" }),
                    );
                };
                if state.repositories.iter().any(|existing| existing == name) {
                    return (
                        StatusCode::BAD_REQUEST,
                        json!({
                            "__type": "RepositoryAlreadyExistsException",
                            "message": format!("The repository with name '{name}' already exists"),
                        }),
                    );
                }
                state.repositories.push(name.to_owned());
                (
                    StatusCode::OK,
                    json!({ "repository": { "repositoryName": name } }),
                )
            }
            "GetAuthorizationToken" => (
                StatusCode::OK,
                json!({
                    "authorizationData": [{
                        "authorizationToken": state.token,
                        "proxyEndpoint": "https://123456789012.dkr.ecr.eu-west-1.amazonaws.com",
                    }]
                }),
            ),
            other => (
                StatusCode::BAD_REQUEST,
                json!({ "__type": "UnknownOperationException", "message": other }),
            ),
        }
    }
}

pub struct MockEcrServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockEcrServer {
    pub async fn start(ecr: MockEcr) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock ECR listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let ecr = ecr.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(ecr.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock ECR server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}/", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn json_response(status: StatusCode, value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        "content-type",
        hyper::header::HeaderValue::from_static("application/x-amz-json-1.1"),
    );
    response
}

async fn serve_request(ecr: MockEcr, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::POST {
        return Ok(json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            json!({ "__type": "UnsupportedMethod", "message": "POST only" }),
        ));
    }

    let signed = req
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value.starts_with("AWS4-HMAC-SHA256 Credential=")
                && value.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-target")
        });
    if !signed {
        return Ok(json_response(
            StatusCode::FORBIDDEN,
            json!({ "__type": "MissingAuthenticationTokenException", "message": "unsigned" }),
        ));
    }

    let operation = req
        .headers()
        .get("x-amz-target")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(TARGET_PREFIX))
        .map(str::to_owned);
    let Some(operation) = operation else {
        return Ok(json_response(
            StatusCode::BAD_REQUEST,
            json!({ "__type": "MissingTarget", "message": "x-amz-target required" }),
        ));
    };

    let payload = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or(Value::Null),
        Err(err) => {
            return Ok(json_response(
                StatusCode::BAD_REQUEST,
                json!({ "__type": "BadBody", "message": err.to_string() }),
            ))
        }
    };

    let (status, value) = ecr.handle(&operation, &payload);
    Ok(json_response(status, value))
}
