//! REST adapter for the reconciliation core.
//!
//! Speaks the `_apis` JSON surface with personal access token auth and
//! exposes it through [`RemoteTransport`](azdo_reconcile_core::RemoteTransport)
//! and [`MembershipClient`](azdo_reconcile_core::MembershipClient).

mod client;
mod config;
mod error;

pub use client::RestClient;
pub use config::{RestConfig, DEFAULT_API_VERSION, DEFAULT_TIMEOUT_SECS};
pub use error::{RestError, Result};
