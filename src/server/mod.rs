//! HTTP server, protocol engine and persistence.

pub mod clients;
pub mod cookies;
pub mod flow;
pub mod handlers;
pub mod issue;
pub mod keys;
pub mod oidc;
pub mod persist;
pub mod service;
pub mod session;
pub mod tokens;
