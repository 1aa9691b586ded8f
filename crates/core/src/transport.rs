//! Narrow interfaces to the remote system.
//!
//! Implementations live outside this crate (see the REST crate); the
//! reconciliation code only ever sees JSON payloads and [`RemoteError`]s.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

use crate::error::Result;

/// Remote call kinds the dispatcher issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Create,
    Get,
    Update,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Create => "create",
            Method::Get => "get",
            Method::Update => "update",
            Method::Delete => "delete",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque RPC used by every dispatched operation.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// `resource_id` is `None` for calls against the collection (create).
    async fn call(
        &self,
        method: Method,
        resource_type: &str,
        resource_id: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value>;
}

/// Group membership operations. Add and remove must be idempotent.
#[async_trait]
pub trait MembershipClient: Send + Sync {
    /// Direct members of `group`. A missing group is a not-found error.
    async fn list_members(&self, group: &str) -> Result<HashSet<String>>;

    async fn add_member(&self, group: &str, member: &str) -> Result<()>;

    async fn remove_member(&self, group: &str, member: &str) -> Result<()>;
}
