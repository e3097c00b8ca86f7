//! Paginated windows over ordered collections.
//!
//! Each pagination scope (an opaque string such as `repositories/1/commits`)
//! has a [`PaginationWindow`]: the collection's total size and a sparse map
//! from absolute offset to record id, filled in as ranges are fetched.
//! [`PaginationCache::fetch_range`] serves whatever part of a range is
//! already known immediately and fetches the authoritative range in the
//! background.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tracing::{debug, trace};

use crate::cache::{CacheState, Store};
use crate::client::ResourceClient;
use crate::error::ApiError;
use crate::ids::RecordId;
use crate::request::RequestOptions;
use crate::resources::Resource;

/// Known part of one ordered collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationWindow {
    total: usize,
    item_ids: BTreeMap<usize, RecordId>,
}

impl PaginationWindow {
    /// Last known size of the collection.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn id_at(&self, offset: usize) -> Option<&RecordId> {
        self.item_ids.get(&offset)
    }

    /// Known ids in `[offset, offset + count)`, in order, skipping unknown
    /// offsets and never reading past `total`.
    pub fn cached_ids(&self, offset: usize, count: usize) -> Vec<RecordId> {
        let end = offset.saturating_add(count).min(self.total);
        if offset >= end {
            return Vec::new();
        }
        self.item_ids
            .range(offset..end)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Number of offsets with a known id.
    pub fn known(&self) -> usize {
        self.item_ids.len()
    }

    /// Record the result of fetching `[offset, offset + count)` and return
    /// the resulting total.
    ///
    /// Offsets in the requested range not covered by `ids` are cleared, and
    /// ids at or beyond the new total are purged. Without a reported total, a
    /// short page marks the end of the collection; a full page only ever
    /// grows the known total.
    pub fn apply(
        &mut self,
        offset: usize,
        count: usize,
        total: Option<usize>,
        ids: &[RecordId],
    ) -> usize {
        let end = offset.saturating_add(count.max(ids.len()));
        let mut tail = self.item_ids.split_off(&offset);
        let mut rest = tail.split_off(&end);
        self.item_ids.append(&mut rest);
        self.item_ids.extend((offset..end).zip(ids.iter().cloned()));

        let reached = offset.saturating_add(ids.len());
        let total = match total {
            Some(total) => total,
            None if ids.len() < count => reached,
            None => self.total.max(reached),
        };

        if total < self.total {
            trace!(old = self.total, new = total, "pagination total shrank");
        }
        self.total = total;
        let purged = self.item_ids.split_off(&total);
        if !purged.is_empty() {
            trace!(purged = purged.len(), total, "purged ids beyond total");
        }
        total
    }
}

/// A slice of a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub total: usize,
    pub items: Vec<T>,
}

/// Result of [`PaginationCache::fetch_range`].
pub struct RangeFetch<T> {
    /// What the cache already knew. Items are omitted, never padded.
    pub cached: Page<T>,
    /// The authoritative range. The fetch runs on its own task and updates
    /// the window whether or not this future is awaited.
    pub pending: BoxFuture<'static, Result<Page<T>, ApiError>>,
}

/// Pagination windows for every scope, resolved against a [`Store`].
///
/// Cheap to clone; clones share windows.
#[derive(Clone)]
pub struct PaginationCache {
    store: Arc<Store>,
    windows: Arc<DashMap<String, PaginationWindow>>,
}

impl PaginationCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            windows: Arc::default(),
        }
    }

    /// The scope's window, or an empty one.
    pub fn window(&self, scope: &str) -> PaginationWindow {
        self.windows
            .get(scope)
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    /// Forget what is known about a scope.
    pub fn invalidate(&self, scope: &str) {
        if self.windows.remove(scope).is_some() {
            debug!(scope, "pagination window invalidated");
        }
    }

    /// Serve `[offset, offset + count)` of `scope`.
    ///
    /// `retrieve` resolves ids against a cache snapshot; `fetch` loads the
    /// exact range from the server, returning the total when the server
    /// reports one, and the ids.
    /// Must be called from within a tokio runtime.
    pub fn fetch_range<T, R, F, Fut>(
        &self,
        scope: &str,
        offset: usize,
        count: usize,
        retrieve: R,
        fetch: F,
    ) -> RangeFetch<T>
    where
        T: Send + 'static,
        R: Fn(&CacheState, &RecordId) -> Option<T> + Send + 'static,
        F: FnOnce(usize, usize) -> Fut,
        Fut: Future<Output = Result<(Option<usize>, Vec<RecordId>), ApiError>> + Send + 'static,
    {
        let (total, known) = self
            .windows
            .get(scope)
            .map(|w| (w.total(), w.cached_ids(offset, count)))
            .unwrap_or_default();
        let snapshot = self.store.snapshot();
        let cached = Page {
            total,
            items: known
                .iter()
                .filter_map(|id| retrieve(&snapshot, id))
                .collect(),
        };
        trace!(scope, offset, count, cached = cached.items.len(), "serving cached range");

        let request = fetch(offset, count);
        let windows = Arc::clone(&self.windows);
        let store = Arc::clone(&self.store);
        let scope = scope.to_string();

        let task = tokio::spawn(async move {
            let (reported, ids) = request.await?;
            let total = windows
                .entry(scope.clone())
                .or_default()
                .apply(offset, count, reported, &ids);
            debug!(scope = %scope, offset, count, total, "pagination window updated");

            let snapshot = store.snapshot();
            Ok(Page {
                total,
                items: ids.iter().filter_map(|id| retrieve(&snapshot, id)).collect(),
            })
        });

        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ApiError::Other(format!("range fetch task failed: {}", e))),
            }
        }
        .boxed();

        RangeFetch { cached, pending }
    }

    /// [`fetch_range`](Self::fetch_range) for typed records loaded through `client`.
    pub fn fetch_records<T: Resource>(
        &self,
        client: &ResourceClient,
        scope: &str,
        offset: usize,
        count: usize,
        options: Vec<RequestOptions>,
    ) -> RangeFetch<Arc<T>> {
        let client = client.clone();
        self.fetch_range(
            scope,
            offset,
            count,
            |state: &CacheState, id: &RecordId| state.get::<T>(id),
            move |offset, count| async move {
                client.fetch_window(T::NAME, offset, count, options).await
            },
        )
    }
}

impl std::fmt::Debug for PaginationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginationCache")
            .field("scopes", &self.windows.len())
            .finish_non_exhaustive()
    }
}
