//! Core library for partsdesk - the back-office client for a spare-parts
//! distributor.
//!
//! This crate provides:
//! - `api`: the authenticated HTTP client with single-flight token refresh
//! - `auth`: session state, credentials and durable token storage
//! - `config`: configuration file and environment overrides

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, OutgoingRequest};
pub use auth::{
    Credentials, Session, SessionEvent, SessionSnapshot, SessionState, TokenPair, TokenStore,
};
pub use config::Config;
