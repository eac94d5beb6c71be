//! Authorized calls to protected resources for Portal.
//!
//! [`AuthorizedRequestDispatcher`] acquires a token through the session,
//! attaches it as a bearer credential and issues a single `GET`. The typed
//! clients build on it:
//!
//! - [`ApiClient`]: the application's protected API (`/hello`)
//! - [`ProfileClient`]: the signed-in user's directory profile

pub mod client;
pub mod dispatcher;
pub mod error;

pub use client::{ApiClient, ApiConfig, Profile, ProfileClient};
pub use dispatcher::AuthorizedRequestDispatcher;
pub use error::{ApiError, ApiErrorKind};
