//! Client-side OAuth2 engine for the Colizeum platform: PKCE authorization,
//! encrypted token persistence, transparent refresh, and a typed resource
//! API client shared by the CLI and embedding applications.

pub mod api;
pub mod auth;
pub mod config;
