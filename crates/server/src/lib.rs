use anyhow::Context;
use axum::{routing::get, routing::post, routing::put, Router};
use futures_util::FutureExt;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use townhall_engine::{Broker, Consumer, Producer, StreamingService};
use townhall_protocol::TopicConfig;

pub mod broker_api;
pub mod config;
pub mod error;
pub mod listen;
pub mod observability;
pub mod relay;

#[cfg(test)]
mod tests;

use broker_api::BrokerState;
use config::{BrokerConfig, RelayConfig};

/// Relay partition; the chat topic is single-partition.
pub const CHAT_PARTITION: u32 = 0;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StreamingService>,
    pub producer: Producer,
    pub consumer: Consumer,
}

impl AppState {
    pub fn new(service: Arc<StreamingService>, topic: &str) -> Self {
        Self {
            producer: service.producer(topic),
            consumer: service.consumer(topic, CHAT_PARTITION),
            service,
        }
    }
}

pub fn build_router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(relay::health))
        .route("/send-message", post(relay::send_message))
        .with_state(state)
        .layer(cors)
}

/// Every path on the WebSocket listener upgrades.
pub fn build_ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(relay::ws_upgrade)
        .with_state(state)
}

pub fn build_broker_router(broker: Arc<dyn Broker>) -> Router {
    Router::new()
        .route("/health", get(relay::health))
        .route("/topics", get(broker_api::list_topics))
        .route("/topics/{name}", put(broker_api::create_topic))
        .route("/topics/{name}/records", post(broker_api::produce))
        .route(
            "/topics/{name}/partitions/{partition}/stream",
            get(broker_api::stream_partition),
        )
        .with_state(BrokerState { broker })
}

/// Connects to the broker (bounded retry), ensures the chat topic and takes
/// the producer/consumer handles.
pub async fn connect_relay(config: &RelayConfig) -> anyhow::Result<AppState> {
    let service = Arc::new(
        StreamingService::new(config.backend()?).with_connect_timeout(config.connect_timeout()),
    );
    service
        .initialize_with_retry(&config.broker_endpoint, config.retry_policy())
        .await
        .with_context(|| format!("connect to broker at {}", config.broker_endpoint))?;
    service
        .ensure_topic(&config.chat_topic, &TopicConfig::default())
        .await
        .with_context(|| format!("ensure topic {}", config.chat_topic))?;
    Ok(AppState::new(service, &config.chat_topic))
}

/// Startup order: broker, topic, handles, WebSocket bind, HTTP bind, serve.
/// Any failure before serving is returned to the caller.
pub async fn run_relay(
    config: RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let state = connect_relay(&config).await?;
    let ws_listener =
        listen::bind_with_retry(config.host, config.ws_port, config.ws_port_attempts)
            .await
            .context("bind websocket listener")?;
    let http_listener = TcpListener::bind((config.host, config.port))
        .await
        .with_context(|| format!("bind http listener on {}:{}", config.host, config.port))?;
    let cors = relay_cors(&config.allowed_origins);
    serve_relay_listeners(http_listener, ws_listener, state, cors, shutdown).await
}

pub async fn serve_relay_listeners(
    http_listener: TcpListener,
    ws_listener: TcpListener,
    state: AppState,
    cors: CorsLayer,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let http_addr = http_listener.local_addr()?;
    let ws_addr = ws_listener.local_addr()?;
    tracing::info!(%http_addr, %ws_addr, topic = state.producer.topic(), "relay listening");

    let state = Arc::new(state);
    let shutdown = shutdown.shared();
    let http = axum::serve(http_listener, build_router(state.clone(), cors))
        .with_graceful_shutdown(shutdown.clone());
    let ws = axum::serve(ws_listener, build_ws_router(state)).with_graceful_shutdown(shutdown);
    tokio::try_join!(http.into_future(), ws.into_future())?;
    tracing::info!("relay stopped");
    Ok(())
}

pub async fn run_broker(
    config: BrokerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(config.open_broker()?);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind broker listener on {}", config.listen))?;
    serve_broker_listener(listener, broker, shutdown).await?;
    Ok(())
}

pub async fn serve_broker_listener(
    listener: TcpListener,
    broker: Arc<dyn Broker>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SocketAddr> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, store = broker.kind(), "broker node listening");
    axum::serve(listener, build_broker_router(broker))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(addr)
}

/// Browsers on this machine (any port on localhost/127.0.0.1) plus `extra`
/// exact origins. Never a wildcard.
pub fn relay_cors(extra: &[String]) -> CorsLayer {
    use axum::http::header;
    use axum::http::HeaderValue;
    use axum::http::Method;

    let extra: Vec<String> = extra
        .iter()
        .map(|o| o.trim().trim_end_matches('/').to_string())
        .filter(|o| !o.is_empty())
        .collect();
    CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _req| {
            is_allowed_origin(origin, &extra)
        }))
}

fn is_allowed_origin(origin: &axum::http::HeaderValue, extra: &[String]) -> bool {
    let Ok(s) = origin.to_str() else {
        return false;
    };
    if extra.iter().any(|o| o == s) {
        return true;
    }
    is_http_origin_for_host(s, "localhost") || is_http_origin_for_host(s, "127.0.0.1")
}

fn is_http_origin_for_host(origin: &str, host: &str) -> bool {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = origin.strip_prefix(scheme) {
            if let Some(after) = rest.strip_prefix(host) {
                // scheme://host[:port] only
                return after.is_empty() || after.starts_with(':');
            }
        }
    }
    false
}
