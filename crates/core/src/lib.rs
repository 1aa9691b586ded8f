//! Reconciliation core for eventually consistent remote APIs.
//!
//! A write is considered done only once subsequent reads agree with it.
//! The modules here classify failures, retry them within a deadline, diff
//! member sets and poll until the remote side has settled.

pub mod classify;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod lifecycle;
pub mod membership;
pub mod poll;
pub mod retry;
pub mod transport;

pub use classify::{Classification, Classify, ErrorClassifier, Rule};
pub use config::{DispatcherConfig, MembershipConfig, RetryPolicy};
pub use diff::{member_set, DiffResult, MembershipMode};
pub use dispatch::{DispatchError, Dispatcher, FetchError, ResourceCodec};
pub use error::{CodecError, RemoteError, Result};
pub use lifecycle::{Operation, ReadOutcome, ResourceLifecycle};
pub use membership::{GroupMembership, MembershipError, MembershipReconciler};
pub use poll::{ConvergenceError, PollEvent, PollOutcome, PollState, Poller};
pub use retry::{execute, execute_classified, RetryError};
pub use transport::{MembershipClient, Method, RemoteTransport};
