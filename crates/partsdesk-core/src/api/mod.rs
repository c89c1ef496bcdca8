//! REST API client module for the back-office backend.
//!
//! This module provides the `ApiClient` used by every screen to talk to the
//! backend. Requests carry a JWT bearer token obtained from `/auth/login`;
//! expired tokens are renewed through `/auth/refresh` transparently.

pub mod client;
pub mod error;
pub mod request;

pub use client::{ApiClient, LOGIN_PATH, REFRESH_PATH};
pub use error::ApiError;
pub use request::OutgoingRequest;
pub use reqwest::Method;
