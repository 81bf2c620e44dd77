// Live chat gateway entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config, seeding it from defaults on first run
// 3. Build session credentials, open the chat journal
// 4. Bind the WebSocket and feedback HTTP listeners
// 5. Create mpsc channels, spawn listener and gateway tasks
// 6. Wait for Ctrl+C or the gateway loop to end
// 7. Shut down: close clients, end journals, stop listeners

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use livechat_core::audit::AuditLog;
use livechat_core::feedback::FeedbackCollector;
use livechat_core::session::SessionRegistry;
use tokio::sync::mpsc;
use tracing::{error, info};

use livechat_gateway::config::{self, Config};
use livechat_gateway::gateway::{self, GatewayCommand, GatewayState};
use livechat_gateway::http::{self, FeedbackEndpoint, HttpListener};
use livechat_gateway::ws_server::{self, WsListener};

/// Time given to writer tasks to flush close frames before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Tracing
    init_tracing()?;

    // 2. Config
    let config = config::load_config().context("failed to load configuration")?;
    let urls = config.public_urls();

    // 3. Session credentials and journals
    let session = build_session(&config);
    let audit = Arc::new(AuditLog::new(&config.audit.log_dir));
    audit.start_session(session.code());
    let feedback = Arc::new(FeedbackCollector::new(Arc::clone(&audit)));

    // 4. Listeners
    let ws_listener = WsListener::bind(&config.ws_bind_addr(), config.server.trust_forwarded_for)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {}", config.ws_bind_addr()))?;
    let http_listener = HttpListener::bind(&config.http_bind_addr())
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_bind_addr()))?;

    info!(
        session_code = session.code(),
        admin_secret = session.admin_secret(),
        ws_addr = %ws_listener.local_addr()?,
        http_addr = %http_listener.local_addr()?,
        mobile_url = %urls.mobile_url,
        ws_url = %urls.ws_url,
        journal = ?audit.chat_path(),
        "live chat gateway ready"
    );

    // 5. Channels and tasks
    let (ws_tx, ws_rx) = mpsc::channel(256);
    let (cmd_tx, cmd_rx) = mpsc::channel(4);

    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(ws_listener, ws_tx).await {
            error!("WebSocket server error: {e}");
        }
    });

    let endpoint = FeedbackEndpoint::new(Arc::clone(&feedback), config.server.trust_forwarded_for);
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http::run(http_listener, endpoint).await {
            error!("HTTP server error: {e}");
        }
    });

    let state = GatewayState::new(session, feedback, audit, urls);
    let mut gateway_handle = tokio::spawn(gateway::run(ws_rx, cmd_rx, state));

    // 6. Run until Ctrl-C or the gateway loop ends on its own
    let gateway_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Ctrl-C received");
            None
        }
        result = &mut gateway_handle => Some(result),
    };
    let gateway_result = match gateway_result {
        Some(result) => result,
        None => {
            let _ = cmd_tx.send(GatewayCommand::Shutdown).await;
            gateway_handle.await
        }
    };
    match gateway_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("gateway loop error: {e}"),
        Err(e) => error!("gateway task panicked: {e}"),
    }

    // 7. Let writers flush close frames, then stop the listeners
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    ws_handle.abort();
    http_handle.abort();
    info!("live chat gateway stopped");
    Ok(())
}

/// Fixed credentials from config where given, generated ones otherwise.
fn build_session(config: &Config) -> SessionRegistry {
    let generated = SessionRegistry::generate();
    match (&config.session.code, &config.session.admin_secret) {
        (None, None) => generated,
        (code, secret) => SessionRegistry::with_credentials(
            code.clone().unwrap_or_else(|| generated.code().to_string()),
            secret.clone().unwrap_or_else(|| generated.admin_secret().to_string()),
        ),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("livechat_gateway=info,livechat_core=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    Ok(())
}
