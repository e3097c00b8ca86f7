//! Deduplicated, reference-counted data subscriptions.
//!
//! A subscription binds a caller-owned lifetime to a (fetch action,
//! arguments) pair. Subscribers asking for the same pair share one fetch:
//! the first subscriber issues it and later ones only bump a reference count.
//! Dropping the returned [`SubscriptionHandle`] releases the reference.
//!
//! Entries whose count drops to zero stay registered (their data is already
//! in the store); subscribing to one again re-issues the fetch.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::client::FetchOutcome;
use crate::error::ApiError;
use crate::ids::{Identifiable, RecordId};
use crate::resources::{Record, ResourceName};

// =============================================================================
// Dependency keys
// =============================================================================

/// One primitive component of a dependency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<RecordId> for KeyPart {
    fn from(id: RecordId) -> Self {
        match id {
            RecordId::Int(n) => KeyPart::Int(n),
            RecordId::Str(s) => KeyPart::Str(s),
        }
    }
}

/// Something that can appear in a subscription's argument tuple.
///
/// Records reduce to their id; collections and tuples flatten.
pub trait Dependency {
    fn push_keys(&self, out: &mut Vec<KeyPart>);

    fn dependency_key(&self) -> Vec<KeyPart> {
        let mut out = Vec::new();
        self.push_keys(&mut out);
        out
    }
}

impl<T: Dependency + ?Sized> Dependency for &T {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        (**self).push_keys(out);
    }
}

impl Dependency for () {
    fn push_keys(&self, _out: &mut Vec<KeyPart>) {}
}

impl Dependency for bool {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(KeyPart::Bool(*self));
    }
}

macro_rules! int_dependency {
    ($($ty:ty),*) => {
        $(
            impl Dependency for $ty {
                fn push_keys(&self, out: &mut Vec<KeyPart>) {
                    out.push(KeyPart::Int(i64::from(*self)));
                }
            }
        )*
    };
}

int_dependency!(i32, i64, u32);

impl Dependency for u64 {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(match i64::try_from(*self) {
            Ok(n) => KeyPart::Int(n),
            Err(_) => KeyPart::Str(self.to_string()),
        });
    }
}

impl Dependency for usize {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        (*self as u64).push_keys(out);
    }
}

impl Dependency for str {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(KeyPart::Str(self.to_string()));
    }
}

impl Dependency for String {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        self.as_str().push_keys(out);
    }
}

impl Dependency for ResourceName {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        self.as_str().push_keys(out);
    }
}

impl Dependency for RecordId {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(KeyPart::from(self.clone()));
    }
}

impl Dependency for Record {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(KeyPart::from(self.id()));
    }
}

impl<T: Identifiable> Dependency for Arc<T> {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        out.push(KeyPart::from(self.id()));
    }
}

impl<T: Dependency> Dependency for Option<T> {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        match self {
            Some(value) => value.push_keys(out),
            None => out.push(KeyPart::Null),
        }
    }
}

impl<T: Dependency> Dependency for [T] {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        for item in self {
            item.push_keys(out);
        }
    }
}

impl<T: Dependency> Dependency for Vec<T> {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        self.as_slice().push_keys(out);
    }
}

impl Dependency for serde_json::Value {
    fn push_keys(&self, out: &mut Vec<KeyPart>) {
        use serde_json::Value;
        match self {
            Value::Null => out.push(KeyPart::Null),
            Value::Bool(b) => out.push(KeyPart::Bool(*b)),
            Value::Number(n) => out.push(match n.as_i64() {
                Some(i) => KeyPart::Int(i),
                None => KeyPart::Str(n.to_string()),
            }),
            Value::String(s) => out.push(KeyPart::Str(s.clone())),
            Value::Array(items) => items.as_slice().push_keys(out),
            Value::Object(map) => {
                for (key, value) in map {
                    out.push(KeyPart::Str(key.clone()));
                    value.push_keys(out);
                }
            }
        }
    }
}

macro_rules! tuple_dependency {
    ($($name:ident),+) => {
        impl<$($name: Dependency),+> Dependency for ($($name,)+) {
            #[allow(non_snake_case)]
            fn push_keys(&self, out: &mut Vec<KeyPart>) {
                let ($($name,)+) = self;
                $($name.push_keys(out);)+
            }
        }
    };
}

tuple_dependency!(A);
tuple_dependency!(A, B);
tuple_dependency!(A, B, C);
tuple_dependency!(A, B, C, D);

// =============================================================================
// Registry
// =============================================================================

/// Identity of a subscription: action name plus flattened arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub action: String,
    pub dependencies: Vec<KeyPart>,
}

impl SubscriptionKey {
    pub fn new(action: impl Into<String>, args: &(impl Dependency + ?Sized)) -> Self {
        Self {
            action: action.into(),
            dependencies: args.dependency_key(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.action, self.dependencies)
    }
}

/// Progress of a subscription's most recent fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionStatus {
    Pending,
    Settled(FetchOutcome),
    Failed(String),
}

/// Boxed fetch issued on behalf of a subscription.
pub type FetchFuture = BoxFuture<'static, Result<FetchOutcome, ApiError>>;

struct SubscriptionEntry {
    refs: usize,
    in_flight: bool,
    status: watch::Sender<SubscriptionStatus>,
}

/// Registry of subscriptions.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<DashMap<SubscriptionKey, SubscriptionEntry>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `action` with `args`.
    ///
    /// `fetch` is called (and its future spawned) only if no active or
    /// in-flight subscription for the same key exists. Must be called from
    /// within a tokio runtime.
    pub fn subscribe<F, Fut>(
        &self,
        action: &str,
        args: &(impl Dependency + ?Sized),
        fetch: F,
    ) -> SubscriptionHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchOutcome, ApiError>> + Send + 'static,
    {
        self.subscribe_key(SubscriptionKey::new(action, args), fetch)
    }

    /// [`subscribe`](Self::subscribe) with a precomputed key.
    pub fn subscribe_key<F, Fut>(&self, key: SubscriptionKey, fetch: F) -> SubscriptionHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchOutcome, ApiError>> + Send + 'static,
    {
        let (issue, status) = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.refs += 1;
                let issue = entry.refs == 1 && !entry.in_flight;
                if issue {
                    entry.in_flight = true;
                    entry.status.send_replace(SubscriptionStatus::Pending);
                }
                trace!(key = %key, refs = entry.refs, reissue = issue, "subscription joined");
                (issue, entry.status.subscribe())
            }
            MapEntry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(SubscriptionStatus::Pending);
                vacant.insert(SubscriptionEntry {
                    refs: 1,
                    in_flight: true,
                    status: tx,
                });
                trace!(key = %key, "subscription registered");
                (true, rx)
            }
        };

        if issue {
            debug!(key = %key, "issuing subscription fetch");
            self.spawn_fetch(key.clone(), fetch().boxed());
        }

        SubscriptionHandle {
            key,
            entries: Arc::clone(&self.entries),
            status,
        }
    }

    fn spawn_fetch(&self, key: SubscriptionKey, fetch: FetchFuture) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let status = match fetch.await {
                Ok(outcome) => SubscriptionStatus::Settled(outcome),
                Err(e) => {
                    debug!(key = %key, error = %e, "subscription fetch failed");
                    SubscriptionStatus::Failed(e.to_string())
                }
            };
            if let Some(mut entry) = entries.get_mut(&key) {
                entry.in_flight = false;
                entry.status.send_replace(status);
            }
        });
    }

    /// Current reference count for a key; zero if unknown or inactive.
    pub fn ref_count(&self, key: &SubscriptionKey) -> usize {
        self.entries.get(key).map_or(0, |e| e.refs)
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.ref_count(key) > 0
    }

    /// Number of registered subscriptions, active or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget inactive subscriptions with no fetch in flight.
    ///
    /// Returns how many were removed. Cached data is unaffected.
    pub fn prune_inactive(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.refs > 0 || e.in_flight);
        let pruned = before.saturating_sub(self.entries.len());
        if pruned > 0 {
            debug!(pruned, "pruned inactive subscriptions");
        }
        pruned
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// A live reference to a subscription. Dropping it releases the reference.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    entries: Arc<DashMap<SubscriptionKey, SubscriptionEntry>>,
    status: watch::Receiver<SubscriptionStatus>,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Latest status.
    pub fn status(&self) -> SubscriptionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the current fetch settles.
    pub async fn settled(&mut self) -> SubscriptionStatus {
        match self
            .status
            .wait_for(|s| !matches!(s, SubscriptionStatus::Pending))
            .await
        {
            Ok(status) => status.clone(),
            Err(_) => SubscriptionStatus::Failed("subscription closed".to_string()),
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entries.get_mut(&self.key) {
            entry.refs = entry.refs.saturating_sub(1);
            if entry.refs == 0 {
                trace!(key = %self.key, "subscription inactive");
            }
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

/// A caller-owned subscription slot.
///
/// Re-setting it with the same key keeps the current subscription; a changed
/// key releases the old subscription and registers the new one.
#[derive(Debug)]
pub struct Subscription {
    manager: SubscriptionManager,
    current: Option<SubscriptionHandle>,
}

impl Subscription {
    pub fn new(manager: SubscriptionManager) -> Self {
        Self {
            manager,
            current: None,
        }
    }

    pub fn set<F, Fut>(
        &mut self,
        action: &str,
        args: &(impl Dependency + ?Sized),
        fetch: F,
    ) -> &mut SubscriptionHandle
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<FetchOutcome, ApiError>> + Send + 'static,
    {
        let key = SubscriptionKey::new(action, args);
        if self.current.as_ref().is_some_and(|h| h.key != key) {
            self.current = None;
        }
        self.current
            .get_or_insert_with(|| self.manager.subscribe_key(key, fetch))
    }

    pub fn handle(&self) -> Option<&SubscriptionHandle> {
        self.current.as_ref()
    }

    /// Release the current subscription, if any.
    pub fn clear(&mut self) {
        self.current = None;
    }
}
