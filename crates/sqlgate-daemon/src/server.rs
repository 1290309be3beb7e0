use std::{collections::HashMap, env, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Query, Request, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use sqlgate_db::{
    extract_bearer, merge_params, AccessRequest, ErrorKind, GateConfig, GateError, Operation, ParamMap,
    RequestContext, SqlGate, TableAction, WebConfig, CLEAR_TOKENS_OBJECT,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::middleware::headers::response_headers_layer;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let raw = tokio::fs::read(&config.config_path)
        .await
        .with_context(|| format!("failed to read {}", config.config_path.display()))?;
    let gate_config = GateConfig::from_slice(&raw)?;
    let web = gate_config.web.clone();
    let listen_addr = config.listen_addr(&web)?;

    let gate = SqlGate::new(gate_config, config.recompile)
        .await
        .context("failed to load sqlgate configuration")?;
    let state = Arc::new(AppState {
        gate,
        body_limit: config.body_limit,
    });

    let app = build_router(state, &web).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %listen_addr, recompile = config.recompile, "sqlgate listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("HTTP server exited")?;
    Ok(())
}

fn build_router(state: Arc<AppState>, web: &WebConfig) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .fallback(dispatch)
        .with_state(state)
        .layer(response_headers_layer(&web.headers));

    if web.cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true),
        )
    } else {
        router
    }
}

struct AppState {
    gate: SqlGate,
    body_limit: usize,
}

#[derive(Debug, Clone)]
struct AppConfig {
    config_path: PathBuf,
    listen_addr: Option<SocketAddr>,
    recompile: bool,
    body_limit: usize,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let config_path = env::var("SQLGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("sqlgate.json"));

        let listen_addr = env::var("SQLGATE_HTTP_ADDR")
            .ok()
            .map(|value| value.parse().context("invalid SQLGATE_HTTP_ADDR"))
            .transpose()?;

        let recompile = env::var("SQLGATE_ENV")
            .map(|value| value.eq_ignore_ascii_case("dev"))
            .unwrap_or(false);

        let body_limit = env::var("SQLGATE_BODY_LIMIT_BYTES")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_BODY_LIMIT_BYTES);

        Ok(Self {
            config_path,
            listen_addr,
            recompile,
            body_limit,
        })
    }

    /// Environment override, then `web.http_addr`, then the default.
    fn listen_addr(&self, web: &WebConfig) -> Result<SocketAddr> {
        if let Some(addr) = self.listen_addr {
            return Ok(addr);
        }
        web.http_addr
            .as_deref()
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or(DEFAULT_LISTEN_ADDR)
            .trim()
            .parse()
            .context("invalid web.http_addr")
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `{database}/{object}/{key}` path segments.
#[derive(Debug, PartialEq, Eq)]
struct ObjectPath<'a> {
    database: &'a str,
    object: &'a str,
    key: Option<&'a str>,
}

fn parse_path(path: &str) -> ObjectPath<'_> {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    let database = segments.next().unwrap_or_default();
    let object = segments.next().unwrap_or_default();
    let key = segments
        .next()
        .map(|key| key.trim_end_matches('/'))
        .filter(|key| !key.is_empty());
    ObjectPath {
        database,
        object,
        key,
    }
}

/// What the request method asks for on the addressed object.
#[derive(Clone, Copy)]
enum Call<'a> {
    Script,
    Table(TableAction<'a>),
}

fn classify<'a>(method: &Method, key: Option<&'a str>) -> Result<Call<'a>, ApiError> {
    let require_key = || key.ok_or_else(|| ApiError::bad_request("row key is required"));
    Ok(match method {
        &Method::PATCH => Call::Script,
        &Method::GET => Call::Table(key.map_or(TableAction::List, TableAction::Get)),
        &Method::POST => Call::Table(TableAction::Insert),
        &Method::PUT => Call::Table(TableAction::Update(require_key()?)),
        &Method::DELETE => Call::Table(TableAction::Delete(require_key()?)),
        other => {
            return Err(ApiError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                format!("method {other} not allowed"),
            ))
        }
    })
}

fn header_text<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[instrument(skip_all, fields(request_id = %Uuid::new_v4(), method = %request.method(), path = %request.uri().path()))]
async fn dispatch(State(state): State<Arc<AppState>>, request: Request) -> Response {
    match handle(&state, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn handle(state: &AppState, request: Request) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    if parts.method == Method::OPTIONS {
        return Ok(StatusCode::OK.into_response());
    }

    let path = parse_path(parts.uri.path());
    let token = header_text(&parts.headers, header::AUTHORIZATION)
        .map(extract_bearer)
        .unwrap_or_default();

    if path.database == CLEAR_TOKENS_OBJECT && state.gate.caches_tokens() && !token.is_empty() {
        state.gate.clear_token(token);
        return Ok(Json(json!({ "success": "token cleared" })).into_response());
    }

    let call = classify(&parts.method, path.key)?;
    let operation = match call {
        Call::Script => Operation::Exec,
        Call::Table(action) => action.operation(),
    };
    state
        .gate
        .authorize(&AccessRequest {
            database: path.database,
            object: path.object,
            operation,
            token,
            origin: header_text(&parts.headers, header::ORIGIN),
            referer: header_text(&parts.headers, header::REFERER),
        })
        .await?;

    let params = read_params(&parts, body, state.body_limit).await?;

    match call {
        Call::Script => {
            let context = request_context(&parts);
            let output = state
                .gate
                .execute_script(path.database, path.object, &params, &context)
                .await?;
            Ok(match output.into_json() {
                Some(value) => Json(value).into_response(),
                None => StatusCode::NO_CONTENT.into_response(),
            })
        }
        Call::Table(action) => {
            let value = state
                .gate
                .run_table(path.database, path.object, action, &params)
                .await?;
            Ok(Json(value).into_response())
        }
    }
}

/// Query-string pairs merged with an optional JSON object body.
async fn read_params(parts: &Parts, body: Body, limit: usize) -> Result<ParamMap, ApiError> {
    let Query(query) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
        .map_err(|err| ApiError::bad_request(err.body_text()))?;

    let bytes = to_bytes(body, limit)
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read request body: {err}")))?;
    let body = if bytes.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => return Err(ApiError::bad_request("request body must be a JSON object")),
            Err(err) => return Err(ApiError::bad_request(format!("invalid JSON body: {err}"))),
        }
    };

    Ok(merge_params(query, body))
}

fn request_context(parts: &Parts) -> RequestContext {
    let headers: HashMap<String, String> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
        .collect();
    let host = header_text(&parts.headers, header::HOST)
        .or_else(|| parts.uri.host())
        .unwrap_or_default()
        .to_string();
    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();

    RequestContext {
        host,
        remote_addr,
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        let status = match err.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let mut body = Map::new();
        body.insert("error".into(), Value::String(self.message));
        (self.status, Json(Value::Object(body))).into_response()
    }
}
