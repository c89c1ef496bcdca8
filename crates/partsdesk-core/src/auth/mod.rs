//! Authentication module for managing the user session and its tokens.
//!
//! This module provides:
//! - `Session`: login/logout state machine restored from durable storage
//! - `TokenStore`: durable storage for the access/refresh token pair, backed
//!   by a JSON file, the OS keychain or process memory
//!
//! Token refresh itself happens in the API client; the session observes it
//! through `SessionEvent`s.

pub mod credentials;
pub mod session;
pub mod storage;

pub use credentials::{Credentials, TokenPair};
pub use session::{Session, SessionEvent, SessionSnapshot, SessionState};
pub use storage::{
    FileTokenStore, KeyringTokenStore, MemoryTokenStore, StorageError, TokenStore,
    AUTH_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
