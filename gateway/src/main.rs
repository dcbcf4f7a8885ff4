use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatgate::cli;
use chatgate::config;
use chatgate::server;
use chatgate::session::{HttpAuthorizationBackend, SessionEvent, SessionManager};
use chatgate::store::TokenStore;
use chatgate::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "chatgate=debug,tower_http=info".into()),
    );
    if cfg.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let result = match args.command {
        Some(cli::Commands::Serve { host, port }) => run_server(cfg, host, port).await,
        Some(cli::Commands::Token { command }) => {
            let tokens = TokenStore::open(cfg.tokens_path())?;
            handle_token_command(command, &tokens).await
        }
        Some(cli::Commands::Login) => handle_login(&cfg).await,
        Some(cli::Commands::Logout) => {
            let session = open_session(&cfg)?;
            session.logout().await?;
            println!("Upstream session cleared.");
            Ok(())
        }
        None => run_server(cfg, None, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(
    mut cfg: config::Config,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        cfg.host = host;
    }
    if let Some(port) = port {
        cfg.port = port;
    }
    let addr = cfg.bind_addr();

    tracing::info!(data_dir = %cfg.data_dir.display(), "Loading credential store...");
    let state = Arc::new(AppState::build(cfg)?);

    if state.config.api_key.is_none() && state.tokens.is_empty().await? {
        tracing::warn!("no access tokens issued and no static key set: /v1 is open to any caller");
    }
    if state.config.admin_key.is_none() {
        tracing::info!("CHATGATE_ADMIN_KEY not set: administration API disabled");
    }

    // Authorize in the background so the operator sees the verification code
    // before the first chat request arrives.
    spawn_event_printer(state.session.subscribe());
    let session = state.session.clone();
    tokio::spawn(async move {
        match session.ensure_session().await {
            Ok(_) => tracing::info!("upstream session ready"),
            Err(e) => tracing::warn!("startup authorization did not complete: {}", e),
        }
    });

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("chatgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

fn open_session(cfg: &config::Config) -> anyhow::Result<SessionManager> {
    let backend = HttpAuthorizationBackend::new(cfg)?;
    let session = SessionManager::open(
        Arc::new(backend),
        cfg.session_path(),
        cfg.handshake_timeout,
    )?;
    Ok(session)
}

async fn handle_login(cfg: &config::Config) -> anyhow::Result<()> {
    let session = open_session(cfg)?;
    if session.current().await.is_some() {
        println!("Upstream session already authorized.");
        return Ok(());
    }

    spawn_event_printer(session.subscribe());
    let upstream = session.ensure_session().await?;
    match upstream.expires_at {
        Some(at) => println!("Authorized. Session token valid until {}.", at.to_rfc3339()),
        None => println!("Authorized."),
    }
    Ok(())
}

fn spawn_event_printer(mut events: broadcast::Receiver<SessionEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::VerificationRequired {
                    verification_uri,
                    user_code,
                    expires_in,
                }) => {
                    println!(
                        "Upstream authorization required:\n  Visit: {}\n  Code:  {}\n  (expires in {}s)",
                        verification_uri, user_code, expires_in
                    );
                }
                Ok(SessionEvent::AuthorizationFailed { reason }) => {
                    eprintln!("Upstream authorization failed: {}", reason);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_token_command(
    cmd: cli::TokenCommands,
    tokens: &TokenStore,
) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Create { label } => {
            let issued = tokens.issue(&label).await?;
            println!(
                "Token created:\n  ID:    {}\n  Use:   Authorization: Bearer {}\n  The secret is shown only once.",
                issued.token.id, issued.secret
            );
        }
        cli::TokenCommands::List => {
            let list = tokens.list().await?;
            if list.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<38} {:<18} {:<20} {:<8} {:<25}",
                    "ID", "PREFIX", "LABEL", "ACTIVE", "LAST USED"
                );
                for t in list {
                    let last_used = t
                        .last_used_at
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<38} {:<18} {:<20} {:<8} {:<25}",
                        t.id, t.display_prefix, t.label, t.active, last_used
                    );
                }
            }
        }
        cli::TokenCommands::Revoke { id } => {
            if tokens.revoke(&id).await? {
                println!("Token revoked.");
            } else {
                println!("Token not found.");
            }
        }
        cli::TokenCommands::Delete { id } => {
            if tokens.delete(&id).await? {
                println!("Token deleted.");
            } else {
                println!("Token not found or already deleted.");
            }
        }
    }
    Ok(())
}
