//! Generic create/read/update/delete over a [`RemoteTransport`].
//!
//! A resource type plugs in by implementing [`ResourceCodec`]: how to turn
//! its state into a request payload and a response payload back into state.
//! The dispatcher owns everything else: retrying transient write failures,
//! tolerating read-after-write lag, waiting for readiness, treating deletes
//! of missing entities as success and naming the resource in every error.

use log::{debug, info};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::classify::ErrorClassifier;
use crate::config::{DispatcherConfig, RetryPolicy};
use crate::error::{CodecError, RemoteError};
use crate::lifecycle::{Operation, ReadOutcome};
use crate::poll::{ConvergenceError, Poller};
use crate::retry::{execute_classified, RetryError};
use crate::transport::{Method, RemoteTransport};

/// Key used in errors before the remote system assigned an identity.
const UNASSIGNED_KEY: &str = "(unassigned)";

/// Serialize/deserialize pair for one resource type.
pub trait ResourceCodec: Send + Sync {
    type State: Send + Sync;

    /// Resource type identity, used in requests, logs and errors.
    fn resource_type(&self) -> &'static str;

    /// Identifying key, once the remote system has assigned one.
    fn key(&self, state: &Self::State) -> Option<String>;

    fn serialize(&self, state: &Self::State) -> Result<Value, CodecError>;

    fn deserialize(&self, response: &Value) -> Result<Self::State, CodecError>;

    /// Whether a written entity has finished provisioning.
    fn is_ready(&self, _state: &Self::State) -> bool {
        true
    }
}

/// Failure to fetch a single entity.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Remote(#[from] RetryError<RemoteError>),

    #[error("decoding response failed: {0}")]
    Codec(#[from] CodecError),

    #[error("entity not found after it was written")]
    Missing,
}

/// Dispatcher failure. Always names the operation, resource type and key.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{operation} {resource_type} [{key}]: {source}")]
    Codec {
        operation: Operation,
        resource_type: &'static str,
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("{operation} {resource_type} [{key}]: {source}")]
    Remote {
        operation: Operation,
        resource_type: &'static str,
        key: String,
        #[source]
        source: RetryError<RemoteError>,
    },

    /// The write was accepted but the remote state never settled. Retrying
    /// the wait alone is enough; the write itself need not be repeated.
    #[error("{operation} {resource_type} [{key}] was applied but did not converge: {source}")]
    NotConverged {
        operation: Operation,
        resource_type: &'static str,
        key: String,
        #[source]
        source: ConvergenceError<FetchError>,
    },

    /// The write was accepted but its response or the trailing read could
    /// not confirm the result. Repeating the write is not safe.
    #[error("{operation} {resource_type} [{key}] was applied but could not be confirmed: {source}")]
    Applied {
        operation: Operation,
        resource_type: &'static str,
        key: String,
        #[source]
        source: FetchError,
    },
}

impl DispatchError {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Codec { operation, .. }
            | Self::Remote { operation, .. }
            | Self::NotConverged { operation, .. }
            | Self::Applied { operation, .. } => *operation,
        }
    }

    pub fn resource_type(&self) -> &'static str {
        match self {
            Self::Codec { resource_type, .. }
            | Self::Remote { resource_type, .. }
            | Self::NotConverged { resource_type, .. }
            | Self::Applied { resource_type, .. } => resource_type,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Codec { key, .. }
            | Self::Remote { key, .. }
            | Self::NotConverged { key, .. }
            | Self::Applied { key, .. } => key,
        }
    }

    /// True when the remote side effect happened and only confirmation failed.
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::NotConverged { .. } | Self::Applied { .. })
    }
}

/// Uniform lifecycle for one resource type.
pub struct Dispatcher<C, T> {
    codec: C,
    transport: T,
    config: DispatcherConfig,
    write_classifier: ErrorClassifier,
}

impl<C, T> Dispatcher<C, T>
where
    C: ResourceCodec,
    T: RemoteTransport,
{
    pub fn new(codec: C, transport: T, config: DispatcherConfig) -> Self {
        Self {
            codec,
            transport,
            config,
            write_classifier: ErrorClassifier::dependency_pending(),
        }
    }

    /// Replace the classifier used for create/update/delete calls.
    pub fn with_write_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.write_classifier = classifier;
        self
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Create the entity, wait until it reports ready, then read it back.
    ///
    /// Once the create call succeeded every later failure is partial.
    pub async fn create(
        &self,
        desired: &C::State,
        cancel: &CancellationToken,
    ) -> Result<C::State, DispatchError> {
        let hint = self
            .codec
            .key(desired)
            .unwrap_or_else(|| UNASSIGNED_KEY.to_string());
        let created = self
            .write(Operation::Create, &hint, desired, cancel)
            .await?;
        let key = self.codec.key(&created).ok_or_else(|| {
            self.applied_error(
                Operation::Create,
                &hint,
                FetchError::Codec(CodecError::MissingField("id")),
            )
        })?;
        info!("Created {} [{}]", self.codec.resource_type(), key);

        self.await_ready(Operation::Create, &key, &created, cancel)
            .await?;
        self.confirm(Operation::Create, &key, cancel).await
    }

    /// Refresh the entity. Not-found is retried within the read budget, then
    /// reported as [`ReadOutcome::Absent`].
    pub async fn read(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome<C::State>, DispatchError> {
        match self.fetch(key, cancel).await {
            Ok(Some(state)) => Ok(ReadOutcome::Present(state)),
            Ok(None) => {
                info!(
                    "{} [{}] not found, marking absent",
                    self.codec.resource_type(),
                    key
                );
                Ok(ReadOutcome::Absent)
            }
            Err(FetchError::Remote(source)) => Err(self.remote_error(Operation::Read, key, source)),
            Err(FetchError::Codec(source)) => Err(self.codec_error(Operation::Read, key, source)),
            Err(FetchError::Missing) => Ok(ReadOutcome::Absent),
        }
    }

    /// Update the entity, wait until it reports ready, then read it back.
    pub async fn update(
        &self,
        key: &str,
        desired: &C::State,
        cancel: &CancellationToken,
    ) -> Result<C::State, DispatchError> {
        let updated = self
            .write(Operation::Update, key, desired, cancel)
            .await?;
        info!("Updated {} [{}]", self.codec.resource_type(), key);

        self.await_ready(Operation::Update, key, &updated, cancel)
            .await?;
        self.confirm(Operation::Update, key, cancel).await
    }

    /// Delete the entity and wait until reads stop finding it. Deleting an
    /// entity that is already gone succeeds.
    pub async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<(), DispatchError> {
        let resource_type = self.codec.resource_type();
        let result = execute_classified(
            || self.transport.call(Method::Delete, resource_type, Some(key), None),
            &self.write_classifier,
            &self.config.delete,
            cancel,
        )
        .await;

        match result {
            Ok(_) => info!("Deleted {} [{}]", resource_type, key),
            Err(err) if ended_not_found(&err) => {
                debug!("{} [{}] already absent, nothing to delete", resource_type, key);
                return Ok(());
            }
            Err(source) => return Err(self.remote_error(Operation::Delete, key, source)),
        }

        let poller = Poller::new(
            self.config.deletion,
            format!("delete of {}", resource_type),
            key,
        );
        poller
            .wait_for_absence(|| self.probe(key, cancel), cancel)
            .await
            .map_err(|source| self.not_converged(Operation::Delete, key, source))?;
        Ok(())
    }

    /// Create goes to the collection; update targets `key`. A response that
    /// does not decode is a partial failure: the write already happened.
    async fn write(
        &self,
        operation: Operation,
        key: &str,
        desired: &C::State,
        cancel: &CancellationToken,
    ) -> Result<C::State, DispatchError> {
        let (method, resource_id, policy) = match operation {
            Operation::Create => (Method::Create, None, &self.config.create),
            _ => (Method::Update, Some(key), &self.config.update),
        };
        let resource_type = self.codec.resource_type();
        let body = self
            .codec
            .serialize(desired)
            .map_err(|source| self.codec_error(operation, key, source))?;

        let response = execute_classified(
            || {
                self.transport
                    .call(method, resource_type, resource_id, Some(body.clone()))
            },
            &self.write_classifier,
            policy,
            cancel,
        )
        .await
        .map_err(|source| self.remote_error(operation, key, source))?;

        self.codec
            .deserialize(&response)
            .map_err(|source| self.applied_error(operation, key, FetchError::Codec(source)))
    }

    async fn await_ready(
        &self,
        operation: Operation,
        key: &str,
        written: &C::State,
        cancel: &CancellationToken,
    ) -> Result<(), DispatchError> {
        if self.codec.is_ready(written) {
            return Ok(());
        }

        debug!(
            "Waiting for {} [{}] to become ready",
            self.codec.resource_type(),
            key
        );
        let poller = Poller::new(
            self.config.readiness,
            format!("{} of {}", operation, self.codec.resource_type()),
            key,
        );
        poller
            .wait_for(
                || self.fetch(key, cancel),
                |found: &Option<C::State>| {
                    found
                        .as_ref()
                        .map(|state| self.codec.is_ready(state))
                        .unwrap_or(false)
                },
                cancel,
            )
            .await
            .map_err(|source| self.not_converged(operation, key, source))?;
        Ok(())
    }

    /// Trailing read after a successful write. Nothing found is partial too.
    async fn confirm(
        &self,
        operation: Operation,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<C::State, DispatchError> {
        match self.fetch(key, cancel).await {
            Ok(Some(state)) => Ok(state),
            Ok(None) => Err(self.applied_error(operation, key, FetchError::Missing)),
            Err(source) => Err(self.applied_error(operation, key, source)),
        }
    }

    /// Get with not-found retried inside the read budget. Running out of
    /// budget on not-found means the entity does not exist.
    async fn fetch(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<C::State>, FetchError> {
        self.get(key, &ErrorClassifier::not_found(), &self.config.read, cancel)
            .await
    }

    /// Single get; not-found means gone.
    async fn probe(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<C::State>, FetchError> {
        let policy = RetryPolicy::default().with_max_attempts(1);
        self.get(key, &ErrorClassifier::new(), &policy, cancel).await
    }

    async fn get(
        &self,
        key: &str,
        classifier: &ErrorClassifier,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Option<C::State>, FetchError> {
        let resource_type = self.codec.resource_type();
        let result = execute_classified(
            || self.transport.call(Method::Get, resource_type, Some(key), None),
            classifier,
            policy,
            cancel,
        )
        .await;

        match result {
            Ok(response) => Ok(Some(self.codec.deserialize(&response)?)),
            Err(err) if ended_not_found(&err) => Ok(None),
            Err(err) => Err(FetchError::Remote(err)),
        }
    }

    fn codec_error(&self, operation: Operation, key: &str, source: CodecError) -> DispatchError {
        DispatchError::Codec {
            operation,
            resource_type: self.codec.resource_type(),
            key: key.to_string(),
            source,
        }
    }

    fn remote_error(
        &self,
        operation: Operation,
        key: &str,
        source: RetryError<RemoteError>,
    ) -> DispatchError {
        DispatchError::Remote {
            operation,
            resource_type: self.codec.resource_type(),
            key: key.to_string(),
            source,
        }
    }

    fn applied_error(&self, operation: Operation, key: &str, source: FetchError) -> DispatchError {
        DispatchError::Applied {
            operation,
            resource_type: self.codec.resource_type(),
            key: key.to_string(),
            source,
        }
    }

    fn not_converged(
        &self,
        operation: Operation,
        key: &str,
        source: ConvergenceError<FetchError>,
    ) -> DispatchError {
        DispatchError::NotConverged {
            operation,
            resource_type: self.codec.resource_type(),
            key: key.to_string(),
            source,
        }
    }
}

/// The call gave up (fatal or out of budget) on a not-found error.
fn ended_not_found(err: &RetryError<RemoteError>) -> bool {
    let not_found = err
        .last_error()
        .map(RemoteError::is_not_found)
        .unwrap_or(false);
    not_found && !matches!(err, RetryError::Cancelled { .. })
}
