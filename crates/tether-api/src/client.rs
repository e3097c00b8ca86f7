//! Resource client: compose, send, classify, normalize, dispatch.

use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tracing::{debug, error, warn};

use crate::cache::{DataUpdate, Store};
use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ApiError, ApplicationError};
use crate::ids::{Identifiable, RecordId};
use crate::normalize::{id_sections, normalize};
use crate::request::{RequestDescriptor, RequestOptions, make_request, with_parameters};
use crate::resources::{Record, ResourceName};
use crate::status::{StatusOutcome, classify};
use crate::transport::{HttpTransport, Transport};

/// How a fetch ended, when it did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Records were received and dispatched to the store.
    Loaded {
        /// Records of the requested type, in response order.
        records: Vec<Record>,
        /// Collection size reported by the server.
        total: Option<u64>,
    },
    /// The server kept answering 202 past the retry budget.
    Delayed,
    /// 204: the addressed records were removed.
    Deleted,
    /// 404 with an `invalid` section.
    Invalid,
    NotFound,
    /// A registered handler took care of an application error.
    Handled(ApplicationError),
    /// An application error was reported through the notifier.
    Failed(ApplicationError),
}

impl FetchOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, FetchOutcome::Loaded { .. })
    }
}

/// Channel for errors the user should see.
pub trait Notifier: Send + Sync {
    fn notify(&self, resource: ResourceName, error: &ApiError);
}

/// Reports errors through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, resource: ResourceName, err: &ApiError) {
        error!(resource = %resource, error = %err, "request failed");
    }
}

fn delayed_backoff(retry: &RetryConfig) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: retry.initial_delay(),
        multiplier: retry.multiplier,
        max_interval: retry.max_delay(),
        randomization_factor: 0.0,
        max_elapsed_time: None, // Bounded by max_delayed_retries instead
        ..Default::default()
    };
    backoff.reset();
    backoff
}

/// Client for the resource API.
///
/// Cheap to clone; clones share the transport, store and notifier.
#[derive(Clone)]
pub struct ResourceClient {
    transport: Arc<dyn Transport>,
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    retry: RetryConfig,
}

impl ResourceClient {
    /// Create a client talking HTTP to `config.base_url`, with a fresh store.
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(
            Arc::new(transport),
            Store::with_capacity(config.broadcast_capacity),
        )
        .with_retry(config.retry.clone()))
    }

    /// Create a client over any transport.
    pub fn with_transport(transport: Arc<dyn Transport>, store: Arc<Store>) -> Self {
        Self {
            transport,
            store,
            notifier: Arc::new(TracingNotifier),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Compose a request for `resource` from option fragments and run it.
    pub async fn fetch(
        &self,
        resource: ResourceName,
        options: impl IntoIterator<Item = RequestOptions>,
    ) -> Result<FetchOutcome, ApiError> {
        let descriptor = make_request(resource, options)?;
        self.execute(&descriptor).await
    }

    /// Run a composed request, retrying while the server answers 202.
    pub async fn execute(&self, descriptor: &RequestDescriptor) -> Result<FetchOutcome, ApiError> {
        let request = descriptor.transport_request();
        let mut backoff = delayed_backoff(&self.retry);
        let mut retries = 0;

        loop {
            let response = self.transport.fetch(&request).await?;
            let outcome = classify(response.status, response.json, &descriptor.expected_statuses);

            if !matches!(outcome, StatusOutcome::Delayed) {
                return self.settle(descriptor, outcome);
            }

            if retries >= self.retry.max_delayed_retries {
                warn!(
                    resource = %descriptor.resource,
                    path = %descriptor.path,
                    retries,
                    "response still delayed, giving up"
                );
                return Ok(FetchOutcome::Delayed);
            }

            let delay = backoff.next_backoff().unwrap_or_else(|| self.retry.max_delay());
            retries += 1;
            debug!(
                resource = %descriptor.resource,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                "response delayed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn settle(
        &self,
        descriptor: &RequestDescriptor,
        outcome: StatusOutcome,
    ) -> Result<FetchOutcome, ApiError> {
        let resource = descriptor.resource;
        match outcome {
            StatusOutcome::Success(json) => {
                let normalized = normalize(resource, &json, &self.store.snapshot())?;
                self.store.dispatch(normalized.update);
                Ok(FetchOutcome::Loaded {
                    records: normalized.primary,
                    total: normalized.total,
                })
            }
            StatusOutcome::Delayed => Ok(FetchOutcome::Delayed),
            StatusOutcome::Deleted => {
                let ids: Vec<RecordId> = descriptor.args.iter().map(|a| RecordId::parse(a)).collect();
                if !ids.is_empty() {
                    debug!(resource = %resource, count = ids.len(), "records deleted upstream");
                    self.store.dispatch(DataUpdate::deleted(resource, ids));
                }
                Ok(FetchOutcome::Deleted)
            }
            StatusOutcome::Invalid(section) => {
                let invalid = id_sections("invalid", &section)?;
                self.store.dispatch(DataUpdate {
                    invalid,
                    ..Default::default()
                });
                Ok(FetchOutcome::Invalid)
            }
            StatusOutcome::NotFound => Ok(FetchOutcome::NotFound),
            StatusOutcome::Application(app_error) => self.application_error(descriptor, app_error),
            StatusOutcome::ServerFault { status, message } => {
                let err = ApiError::Server { status, message };
                if !descriptor.raise_errors {
                    self.notifier.notify(resource, &err);
                }
                Err(err)
            }
        }
    }

    fn application_error(
        &self,
        descriptor: &RequestDescriptor,
        app_error: ApplicationError,
    ) -> Result<FetchOutcome, ApiError> {
        if let Some(code) = app_error.code.as_deref()
            && let Some(handler) = descriptor.error_handlers.get(code)
        {
            debug!(resource = %descriptor.resource, code, "application error handled");
            handler(&app_error);
            return Ok(FetchOutcome::Handled(app_error));
        }

        if descriptor.raise_errors {
            return Err(ApiError::Application(app_error));
        }

        self.notifier
            .notify(descriptor.resource, &ApiError::Application(app_error.clone()));
        Ok(FetchOutcome::Failed(app_error))
    }

    /// Fetch `count` items of `resource` starting at `offset`.
    ///
    /// Returns the envelope's `total`, if the server reported one, and the
    /// ids in window order.
    pub async fn fetch_window(
        &self,
        resource: ResourceName,
        offset: usize,
        count: usize,
        options: impl IntoIterator<Item = RequestOptions>,
    ) -> Result<(Option<usize>, Vec<RecordId>), ApiError> {
        let mut fragments = vec![with_parameters([("offset", offset), ("count", count)])];
        fragments.extend(options);

        match self.fetch(resource, fragments).await? {
            FetchOutcome::Loaded { records, total } => {
                let ids: Vec<RecordId> = records.iter().map(Identifiable::id).collect();
                Ok((total.and_then(|t| usize::try_from(t).ok()), ids))
            }
            other => Err(ApiError::Other(format!(
                "window {}+{} of {} not loaded: {:?}",
                offset, count, resource, other
            ))),
        }
    }
}
