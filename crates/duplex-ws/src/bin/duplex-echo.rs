//! # duplex-echo
//!
//! Demo listener: an open endpoint at `/` with `echo`, `ping`, and `greet`
//! (which calls `name` back on the caller).

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_core::RpcError;
use duplex_core::logging::{init_json_subscriber, init_subscriber};
use duplex_rpc::server::plugins::{AuthenticationSkip, AuthorizeAll, DebugLogger};
use duplex_rpc::{DispatchEngine, Endpoint, Router, handler_fn};
use duplex_settings::ServerSettings;
use duplex_ws::DuplexServer;
use serde_json::{Value, json};

/// Duplex RPC echo server.
#[derive(Parser, Debug)]
#[command(name = "duplex-echo", about = "Duplex RPC echo server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings; 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `$DUPLEX_SETTINGS` or `~/.duplex/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log every dispatched call.
    #[arg(long)]
    debug_calls: bool,
}

fn echo_endpoint() -> Endpoint {
    Endpoint::new("echo", "/")
        .with_method("echo", handler_fn(|_, params| async move { Ok(Value::Array(params)) }))
        .with_method(
            "ping",
            handler_fn(|_, params| async move {
                Ok(params.into_iter().next().unwrap_or_else(|| json!("pong")))
            }),
        )
        .with_method(
            "greet",
            handler_fn(|ctx, _| async move {
                let name = ctx.reverse_client()?.call("name", vec![]).await?;
                Ok::<_, RpcError>(json!(format!("hello {}", name.as_str().unwrap_or("stranger"))))
            }),
        )
}

/// Dispatch Engine serving the echo endpoint under the listener's settings.
fn build_dispatcher(settings: &ServerSettings, debug_calls: bool) -> Result<Arc<DispatchEngine>> {
    let mut dispatcher = DispatchEngine::new();
    if let Some(limit) = settings.handler_timeout() {
        dispatcher = dispatcher.with_handler_timeout(limit);
    }
    dispatcher
        .register_endpoint(Arc::new(echo_endpoint()))
        .context("Failed to register endpoint")?;
    dispatcher
        .add_plugin(Arc::new(AuthenticationSkip))
        .context("Failed to add plugin")?;
    dispatcher
        .add_plugin(Arc::new(AuthorizeAll))
        .context("Failed to add plugin")?;
    if debug_calls {
        dispatcher
            .add_plugin(Arc::new(DebugLogger))
            .context("Failed to add plugin")?;
    }
    Ok(Arc::new(dispatcher))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .unwrap_or_else(duplex_settings::settings_path);
    let mut settings = duplex_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    let dispatcher = build_dispatcher(&settings.server, args.debug_calls)?;
    let metrics = duplex_ws::metrics::install_recorder().context("Failed to install metrics")?;
    let server = DuplexServer::new(settings.server, Router::new(dispatcher)).with_metrics(metrics);
    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!("duplex-echo listening on ws://{addr}/");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.stop().await;
    tracing::info!(sessions = report.sessions_closed, "Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["duplex-echo"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(!cli.debug_calls);
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from(["duplex-echo", "--host", "0.0.0.0", "--port", "9000", "--debug-calls"]);
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.port, Some(9000));
        assert!(cli.debug_calls);
    }

    #[test]
    fn dispatcher_takes_handler_timeout_from_settings() {
        let settings = ServerSettings {
            handler_timeout_ms: Some(750),
            ..ServerSettings::default()
        };
        let dispatcher = build_dispatcher(&settings, false).unwrap();
        assert_eq!(
            dispatcher.handler_timeout(),
            Some(std::time::Duration::from_millis(750))
        );
        assert_eq!(dispatcher.endpoint_paths(), vec!["/".to_string()]);

        let dispatcher = build_dispatcher(&ServerSettings::default(), true).unwrap();
        assert!(dispatcher.handler_timeout().is_none());
    }

    #[test]
    fn endpoint_has_demo_methods() {
        let endpoint = echo_endpoint();
        assert_eq!(endpoint.methods(), vec!["echo", "greet", "ping"]);
    }
}
