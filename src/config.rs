use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::{Input, Password};
use reqwest::{Method, Url};
use std::path::PathBuf;

/// Catalog session client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL
    #[arg(
        short = 'u',
        long,
        env = "CATALOG_API_BASE_URL",
        default_value = "http://localhost:3000"
    )]
    pub base_url: String,

    /// Login endpoint, relative to the base URL
    #[arg(long, env = "LOGIN_PATH", default_value = "/auth/login")]
    pub login_path: String,

    /// Refresh endpoint, relative to the base URL
    #[arg(long, env = "REFRESH_TOKEN_PATH", default_value = "/auth/refresh-token")]
    pub refresh_path: String,

    /// Path to the session SQLite database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Log line format on stderr
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in with email and password
    Login {
        #[arg(short, long, env = "CATALOG_EMAIL")]
        email: Option<String>,

        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
    },

    /// Sign out and forget stored credentials
    Logout,

    /// Show the current session status
    Status,

    /// Send a request through the authorized client
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE)
        method: String,

        /// Path relative to the base URL
        path: String,

        /// JSON body
        #[arg(short, long)]
        body: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,
    pub login_path: String,
    pub refresh_path: String,

    // Storage
    pub session_db_file: PathBuf,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let session_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path()?,
        };

        Ok(Config {
            api_base_url: args.base_url,

            login_path: args.login_path,
            refresh_path: args.refresh_path,

            session_db_file,

            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,

            log_level: args.log_level,
            log_format: args.log_format,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("Invalid CATALOG_API_BASE_URL: {}", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("CATALOG_API_BASE_URL must be http or https: {}", url);
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Default session database under the platform data directory
fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context(
        "Could not determine data directory (use -d or set SESSION_DB_FILE env var)",
    )?;
    Ok(data_dir.join("catalog-session").join("session.sqlite3"))
}

/// Parse an HTTP method name, case-insensitively
pub fn parse_method(s: &str) -> Result<Method> {
    Method::from_bytes(s.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", s))
}

// === Interactive Login ===

/// Fill in missing login credentials from the terminal
pub fn prompt_login_credentials(
    email: Option<String>,
    password: Option<String>,
) -> Result<(String, String)> {
    let email = match email {
        Some(email) => email,
        None => Input::new()
            .with_prompt("Email")
            .interact_text()
            .context("Failed to read email")?,
    };

    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    if email.trim().is_empty() || password.is_empty() {
        anyhow::bail!("Email and password are required");
    }

    Ok((email.trim().to_string(), password))
}
