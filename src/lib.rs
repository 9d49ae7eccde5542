// Catalog session - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;

pub use auth::{SessionManager, SessionSnapshot, SessionStatus};
pub use error::{RefreshError, SessionError};
pub use http_client::{ApiClient, RequestOptions};
