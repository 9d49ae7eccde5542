// Authentication module
// Manages the session credential lifecycle and token storage

mod manager;
mod refresh;
mod store;
mod types;

pub use manager::SessionManager;
pub(crate) use manager::AccessSnapshot;
pub use refresh::login;
pub use store::{
    MemoryTokenStore, SqliteTokenStore, TokenStore, ACCESS_TOKEN_KEY, PROFILE_KEYS,
    REFRESH_TOKEN_KEY, USER_PROFILE_KEY,
};
pub use types::{LoginCredentials, SessionSnapshot, SessionStatus};
