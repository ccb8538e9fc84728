//! Issuer proxy - a hostname-routed reverse proxy for credential issuers
//!
//! This library provides a reverse proxy that:
//! - Routes HTTP and HTTPS traffic to issuer backends by `Host` header
//! - Keeps the hostname routing table in memory and persists every change atomically
//! - Discovers unknown issuers by probing well-known local ports
//! - Exposes an admin API and console for inspecting and editing routes

pub mod admin;
pub mod config;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod proxy;
pub mod store;
