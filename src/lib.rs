//! Vhostgate - provisions virtual hosts on demand
//!
//! This library sits in front of a multi-tenant host runtime and:
//! - Normalizes the requested hostname and checks it against the live hosts
//! - Attaches unknown hostnames as aliases of their web-server context host
//! - Creates brand-new hosts, throttled by a process-wide rate limit
//! - Writes the per-host config directory and descriptor the runtime deploys
//! - Waits (bounded) for deployment, then redirects the client to retry

pub mod artifacts;
pub mod config;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod hostname;
pub mod redirect;
pub mod registry;
pub mod router;
pub mod server;
pub mod throttle;
