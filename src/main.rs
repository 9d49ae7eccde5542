use anyhow::{Context, Result};
use std::sync::Arc;

use catalog_session::config::{self, Command, LogFormat};
use catalog_session::{auth, http_client};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = config::Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    tracing::debug!("Backend: {}", config.api_base_url);

    let store = Arc::new(auth::SqliteTokenStore::open(&config.session_db_file)?);
    let api = http_client::ApiClient::from_config(&config, store)?;

    // The command races the shutdown signal; an interrupted refresh is
    // dropped before anything is persisted
    tokio::select! {
        result = run(&api, command) => result,
        _ = shutdown_signal() => {
            tracing::warn!("Interrupted, abandoning in-flight requests");
            Ok(())
        }
    }
}

async fn run(api: &http_client::ApiClient, command: Command) -> Result<()> {
    let session = api.session();
    session.initialize().await?;

    match command {
        Command::Login { email, password } => {
            let (email, password) = config::prompt_login_credentials(email, password)?;
            api.login(&email, &password).await?;
            println!("Signed in to {}", api.base_url());
        }

        Command::Logout => {
            session.sign_out().await?;
            println!("Signed out");
        }

        Command::Status => {
            println!("Backend:  {}", api.base_url());
            println!("Status:   {:?}", session.status());
            if let Some(profile) = session.cached_profile()? {
                println!("User:     {}", profile);
            }
        }

        Command::Request { method, path, body } => {
            let method = config::parse_method(&method)?;
            let body = body
                .map(|raw| serde_json::from_str::<serde_json::Value>(&raw))
                .transpose()
                .context("Request body must be valid JSON")?;

            let response = match api.request(method, &path, body).await {
                Ok(response) => response,
                Err(e) if e.requires_login() => {
                    anyhow::bail!("{} - run `catalog-session login` to sign in again", e)
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();
            let text = response.text().await.context("Failed to read response body")?;
            let pretty = serde_json::from_str::<serde_json::Value>(&text)
                .ok()
                .and_then(|json| serde_json::to_string_pretty(&json).ok())
                .unwrap_or(text);

            println!("{}", status);
            if !pretty.is_empty() {
                println!("{}", pretty);
            }
        }
    }

    Ok(())
}

/// Handle shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }
}
