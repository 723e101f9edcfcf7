//! Gateway runtime: hosts the enabled channel adapters, the `/health`
//! endpoint, and the dispatch loop that feeds inbound messages to the agent
//! and routes replies back to their source peer.

use crate::agent::AgentHandler;
use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::ChannelManager;
use crate::config::Config;
use anyhow::Result;
use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size for the health surface.
const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout to keep slow clients from pinning the server.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on stopping all adapters at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    manager: Arc<ChannelManager>,
}

/// Run the gateway until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    let bus = Arc::new(MessageBus::new());
    let workspace = crate::util::workspace_dir();
    std::fs::create_dir_all(&workspace)?;

    let manager = Arc::new(ChannelManager::from_config(
        &config,
        Arc::clone(&bus),
        &workspace,
    ));
    if !manager.has_enabled_channel() {
        tracing::warn!("No channels enabled; the gateway will only serve /health");
    }

    let failures = manager.start_all().await;
    for (name, err) in &failures {
        tracing::error!("Channel '{name}' unavailable: {err:#}");
    }

    let shutdown = install_signal_handler();

    // Dispatcher: single consumer of the inbound queue.
    let agent = AgentHandler::new(config.agents.defaults.model.clone());
    let dispatcher_bus = Arc::clone(&bus);
    let dispatcher_token = shutdown.clone();
    let dispatcher = tokio::spawn(async move {
        dispatch_loop(dispatcher_bus, agent, dispatcher_token).await;
    });

    // Health surface.
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("PicoClaw gateway listening on http://{addr}");

    let app = Router::new()
        .route("/health", get(handle_health))
        .with_state(AppState {
            manager: Arc::clone(&manager),
        })
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let server_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await?;

    // Signal received: stop the dispatcher, then the adapters, then the bus.
    tracing::info!("Shutting down gateway");
    let _ = dispatcher.await;
    manager.stop_all(SHUTDOWN_TIMEOUT).await;
    bus.shutdown();
    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM.
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    signal_token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("received Ctrl+C, shutting down");
        }

        signal_token.cancel();
    });

    token
}

async fn dispatch_loop(bus: Arc<MessageBus>, agent: AgentHandler, shutdown: CancellationToken) {
    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => return,
            m = bus.next_inbound() => m,
        };

        tracing::debug!(
            "Dispatching message {} from {} on {}",
            msg.message_id,
            msg.sender.canonical_id,
            msg.channel
        );

        let reply = match agent.reply(&msg).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Agent invocation failed for {}: {e:#}", msg.message_id);
                continue;
            }
        };
        if reply.is_empty() {
            continue;
        }

        let outbound = OutboundMessage {
            channel: msg.channel.clone(),
            chat_id: msg.peer.id.clone(),
            content: reply,
            reply_to_message_id: Some(msg.message_id.clone()),
        };
        if let Err(e) = bus.publish_outbound(outbound) {
            tracing::warn!("Failed to route reply for {}: {e}", msg.message_id);
        }
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let channels: Vec<serde_json::Value> = state
        .manager
        .statuses()
        .into_iter()
        .map(|(name, running)| serde_json::json!({"name": name, "running": running}))
        .collect();

    Json(serde_json::json!({
        "status": "ok",
        "channels": channels,
        "version": crate::VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::config::Config;
    use std::path::Path;

    #[tokio::test]
    async fn health_reports_channel_statuses() {
        let mut config = Config::default();
        config.channels.maixcam.enabled = true;

        let bus = Arc::new(MessageBus::new());
        let manager = Arc::new(ChannelManager::from_config(
            &config,
            bus,
            Path::new("/tmp/ws"),
        ));
        let state = AppState { manager };

        let Json(body) = handle_health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], crate::VERSION);
        assert_eq!(body["channels"][0]["name"], "maixcam");
        assert_eq!(body["channels"][0]["running"], false);
    }

    #[tokio::test]
    async fn dispatch_loop_exits_on_cancel() {
        let bus = Arc::new(MessageBus::new());
        let agent = AgentHandler::new(String::new());
        let token = CancellationToken::new();
        token.cancel();
        // Must return promptly with no messages queued.
        tokio::time::timeout(
            Duration::from_millis(100),
            dispatch_loop(bus, agent, token),
        )
        .await
        .expect("dispatch loop should exit when cancelled");
    }
}
