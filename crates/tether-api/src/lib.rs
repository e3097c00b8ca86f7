//! Client-side resource synchronization for a code review server's REST API.
//!
//! Requests are described with composable [`RequestOptions`], sent through a
//! [`Transport`], classified by status, normalized into typed records, and
//! reduced into an immutable [`CacheState`] held by a [`Store`].
//!
//! ## Features
//!
//! - **Requests**: option combinators folded into a [`RequestDescriptor`]
//! - **Cache**: normalized records with secondary lookup maps, copy-on-write
//! - **Client**: 202 retry with exponential backoff, error routing
//! - **Subscriptions**: reference-counted, deduplicated data fetches
//! - **Pagination**: sparse per-scope windows stitched from ranged fetches

pub mod cache;
mod client;
mod config;
mod error;
mod ids;
pub mod normalize;
pub mod pagination;
pub mod records;
pub mod request;
mod resources;
pub mod status;
pub mod subscription;
mod transport;

pub use cache::{CacheState, DataUpdate, Store};
pub use client::{FetchOutcome, Notifier, ResourceClient, TracingNotifier};
pub use config::{ClientConfig, RetryConfig};
pub use error::{ApiError, ApplicationError, NormalizeError, RequestError};
pub use ids::{Identifiable, RecordId};
pub use normalize::{Normalized, normalize};
pub use pagination::{Page, PaginationCache, PaginationWindow, RangeFetch};
pub use request::{Method, RequestDescriptor, RequestOptions, make_request};
pub use resources::{Props, Record, Resource, ResourceDefinition, ResourceName};
pub use status::{StatusOutcome, classify};
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionManager, SubscriptionStatus};
pub use transport::{HttpTransport, Transport, TransportRequest, TransportResponse};
