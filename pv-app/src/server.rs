//! Palaver server.
//!
//! Wires channel adapters, the scheduler and the reply engine together and serves
//! the channel callbacks next to a small status API.

use crate::assistant::AssistantEngine;
use crate::channel_plugins::{self, ChannelCapabilitySchema, ChannelPluginId};
use crate::config::{PalaverConfig, RuntimeConfig};
use crate::gateway::Gateway;
use crate::outbound::ChannelOutbound;
use crate::routes;
use crate::session::SessionManager;
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::{Extension, Router};
use pv_channels::OutboundMessage;
use pv_llm::LlmClient;
use pv_sched::Scheduler;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub model: String,
    pub scheduler: Scheduler,
    pub sessions: Arc<SessionManager>,
    pub capability_matrix: HashMap<String, ChannelCapabilitySchema>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = PalaverConfig::load_with_path(config_path).await?;
    let mut enabled = Vec::new();
    for plugin_id in ChannelPluginId::ALL {
        if !channel_plugins::plugin_enabled(&cfg, plugin_id) {
            continue;
        }
        channel_plugins::build_plugin(plugin_id, &cfg).map_err(|e| {
            anyhow::anyhow!("channel {} failed to build: {e}", plugin_id.as_str())
        })?;
        enabled.push(plugin_id.as_str());
    }
    let sched = cfg.scheduler_config();
    tracing::info!(
        config_path = %path.display(),
        model = %cfg.general.model,
        api_base_url = %cfg.general.api_base_url,
        bind_addr = %cfg.runtime.bind_addr,
        channels = ?enabled,
        max_concurrent = sched.max_concurrent,
        debounce_ms = cfg.scheduler.debounce_ms,
        update_interval_ms = cfg.scheduler.update_interval_ms,
        dm_policy = ?cfg.security.dm_policy,
        "config ok"
    );
    println!(
        "palaver doctor: config ok ({})\nmodel: {}\nchannels: {}\nmax_concurrent: {}",
        path.display(),
        cfg.general.model,
        enabled.join(", "),
        sched.max_concurrent
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let (cfg, _) = PalaverConfig::load_with_path(config_path).await?;
    let plugin_id = channel_plugins::find_plugin(channel)
        .ok_or_else(|| anyhow::anyhow!("unknown channel: {channel}"))?;
    if plugin_id == ChannelPluginId::WebChat {
        return Err(anyhow::anyhow!(
            "webchat recipients only exist while `palaver serve` is running"
        ));
    }
    let loaded = channel_plugins::build_plugin(plugin_id, &cfg)?;
    let id = loaded
        .adapter
        .send(recipient, OutboundMessage::text(message))
        .await?;
    tracing::info!(channel = plugin_id.as_str(), recipient, message_id = %id, "one-shot send ok");
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = PalaverConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    let addr = cfg.bind_addr()?;
    let scheduler_config = cfg.scheduler_config();
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        model = %cfg.general.model,
        api_base_url = %cfg.general.api_base_url,
        history_max_messages = cfg.general.history_max_messages,
        webchat_enabled = cfg.channels.webchat.enabled,
        wecom_enabled = cfg.channels.wecom.enabled,
        feishu_enabled = cfg.channels.feishu.enabled,
        max_concurrent = scheduler_config.max_concurrent,
        debounce_ms = cfg.scheduler.debounce_ms,
        update_interval_ms = cfg.scheduler.update_interval_ms,
        text_chunk_limit = cfg.scheduler.text_chunk_limit,
        dm_policy = ?cfg.security.dm_policy,
        runtime_http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        runtime_http_max_in_flight = cfg.runtime.http_max_in_flight,
        runtime_shutdown_grace_seconds = cfg.runtime.shutdown_grace_seconds,
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    let channel_plugins::ChannelLoadResult {
        channels,
        routers: channel_routers,
        capability_matrix,
    } = channel_plugins::load_enabled_channels(&cfg, inbound_tx).await?;
    tracing::info!(
        loaded_channels = channels.len(),
        capability_matrix = ?capability_matrix,
        "channel plugins loaded"
    );

    let api_key = cfg
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("keys.openai_api_key is required"))?;
    let llm = LlmClient::new(&api_key, &cfg.general.model, &cfg.general.api_base_url);
    let sessions = Arc::new(SessionManager::new(cfg.general.history_max_messages));
    let engine = Arc::new(AssistantEngine::new(
        Arc::new(llm),
        cfg.general.system_prompt.clone(),
        sessions.clone(),
        started_at,
    ));
    let outbound = Arc::new(ChannelOutbound::new(channels));
    let scheduler = Scheduler::new(scheduler_config, engine, outbound.clone(), outbound);

    let shutdown = CancellationToken::new();
    let gateway_handle = Gateway::new(cfg.security.clone(), scheduler.clone(), inbound_rx)
        .start(shutdown.child_token());
    tracing::info!("gateway started");

    let state = Arc::new(AppState {
        started_at,
        model: cfg.general.model.clone(),
        scheduler: scheduler.clone(),
        sessions,
        capability_matrix,
    });
    let app = build_router(state, channel_routers, &cfg.runtime);

    tracing::info!(%addr, "palaver serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    drain_scheduler(
        &scheduler,
        Duration::from_secs(cfg.runtime.shutdown_grace_seconds),
    )
    .await;
    Ok(())
}

/// Flushes open debounce windows and waits, bounded by `grace`, for in-flight turns.
async fn drain_scheduler(scheduler: &Scheduler, grace: Duration) {
    let flushed = scheduler.flush_all();
    let snapshot = scheduler.snapshot();
    tracing::info!(
        flushed,
        active = snapshot.queue.active,
        pending = snapshot.queue.pending,
        grace_seconds = grace.as_secs(),
        "draining scheduler"
    );
    match tokio::time::timeout(grace, scheduler.wait_idle()).await {
        Ok(()) => tracing::info!("scheduler drained"),
        Err(_) => {
            let snapshot = scheduler.snapshot();
            tracing::warn!(
                active = snapshot.queue.active,
                pending = snapshot.queue.pending,
                "shutdown grace elapsed with turns still running"
            );
        }
    }
}

pub fn build_router(
    state: Arc<AppState>,
    channel_routers: Vec<Router>,
    runtime: &RuntimeConfig,
) -> Router {
    let mut router = routes::router().layer(Extension(state));
    for channel_router in channel_routers {
        router = router.merge(channel_router);
    }

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::debug!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    router
        .layer(GlobalConcurrencyLimitLayer::new(runtime.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
