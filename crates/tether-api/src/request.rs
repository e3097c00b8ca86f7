//! Request option combinators and the request composer.
//!
//! Call sites describe a request as a list of small [`RequestOptions`]
//! fragments produced by the combinator functions in this module (`include`,
//! `with_parameters`, `method`, ...). [`make_request`] folds them together
//! with the resource type's defaults into one [`RequestDescriptor`].
//!
//! ```ignore
//! let descriptor = make_request(
//!     ResourceName::Branches,
//!     [
//!         with_context(format!("repositories/{}", repository)),
//!         with_parameters([("name", "master")]),
//!         include([ResourceName::Users]),
//!     ],
//! )?;
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ApplicationError, RequestError};
use crate::resources::ResourceName;
use crate::transport::TransportRequest;

/// Statuses treated as normal outcomes unless a fragment overrides them.
pub const DEFAULT_EXPECTED_STATUSES: [u16; 4] = [200, 202, 204, 404];

/// Callback invoked for an application error with a matching code.
pub type ErrorHandler = Arc<dyn Fn(&ApplicationError) + Send + Sync>;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sparse fieldset for one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Only these fields.
    Include(Vec<String>),
    /// Every field except these.
    Exclude(Vec<String>),
}

impl FieldSelection {
    /// Serialize as the `fields[name]` parameter value.
    pub fn to_param(&self) -> String {
        match self {
            FieldSelection::Include(fields) => fields.join(","),
            FieldSelection::Exclude(fields) => format!("-{}", fields.join(",")),
        }
    }
}

/// A sparse fragment of a request description.
///
/// Fragments are combined by [`make_request`]; see [`RequestOptions::merge`]
/// for the per-option rules.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub args: Option<Vec<String>>,
    pub params: Option<BTreeMap<String, String>>,
    pub context: Option<String>,
    pub include: Option<Vec<ResourceName>>,
    pub fields: Option<BTreeMap<ResourceName, FieldSelection>>,
    pub payload: Option<Value>,
    pub method: Option<Method>,
    pub expected_statuses: Option<Vec<u16>>,
    pub error_handlers: Option<BTreeMap<String, ErrorHandler>>,
    pub disable_defaults: bool,
    pub raise_errors: bool,
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("args", &self.args)
            .field("params", &self.params)
            .field("context", &self.context)
            .field("include", &self.include)
            .field("fields", &self.fields)
            .field("payload", &self.payload)
            .field("method", &self.method)
            .field("expected_statuses", &self.expected_statuses)
            .field(
                "error_handlers",
                &self.error_handlers.as_ref().map(|h| h.keys().collect::<Vec<_>>()),
            )
            .field("disable_defaults", &self.disable_defaults)
            .field("raise_errors", &self.raise_errors)
            .finish()
    }
}

/// Set a scalar option, failing if both sides carry it.
fn exclusive<T>(
    resource: ResourceName,
    option: &'static str,
    current: Option<T>,
    incoming: Option<T>,
) -> Result<Option<T>, RequestError> {
    match (current, incoming) {
        (Some(_), Some(_)) => Err(RequestError::DuplicateOption { resource, option }),
        (current, None) => Ok(current),
        (None, incoming) => Ok(incoming),
    }
}

/// Merge two optional collections with `combine`, keeping whichever exists.
fn combined<T>(current: Option<T>, incoming: Option<T>, combine: impl FnOnce(T, T) -> T) -> Option<T> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(combine(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

impl RequestOptions {
    /// Fold `other` into `self`.
    ///
    /// - `context` joins with `/`
    /// - `params`, `fields` and `error_handlers` merge by key, later wins
    /// - `include` concatenates (deduplicated when the descriptor is built)
    /// - `disable_defaults` is sticky
    /// - every other option may be set by at most one fragment
    pub fn merge(self, other: RequestOptions, resource: ResourceName) -> Result<Self, RequestError> {
        Ok(RequestOptions {
            args: exclusive(resource, "args", self.args, other.args)?,
            params: combined(self.params, other.params, |mut a, b| {
                a.extend(b);
                a
            }),
            context: combined(self.context, other.context, |a, b| {
                format!("{}/{}", a.trim_end_matches('/'), b.trim_start_matches('/'))
            }),
            include: combined(self.include, other.include, |mut a, b| {
                a.extend(b);
                a
            }),
            fields: combined(self.fields, other.fields, |mut a, b| {
                a.extend(b);
                a
            }),
            payload: exclusive(resource, "payload", self.payload, other.payload)?,
            method: exclusive(resource, "method", self.method, other.method)?,
            expected_statuses: exclusive(
                resource,
                "expect_statuses",
                self.expected_statuses,
                other.expected_statuses,
            )?,
            error_handlers: combined(self.error_handlers, other.error_handlers, |mut a, b| {
                a.extend(b);
                a
            }),
            disable_defaults: self.disable_defaults || other.disable_defaults,
            raise_errors: exclusive(
                resource,
                "raise_errors",
                self.raise_errors.then_some(()),
                other.raise_errors.then_some(()),
            )?
            .is_some(),
        })
    }
}

// =============================================================================
// Combinators
// =============================================================================

/// Address a single record by id (or other path argument).
pub fn with_argument(arg: impl fmt::Display) -> RequestOptions {
    RequestOptions {
        args: Some(vec![arg.to_string()]),
        ..Default::default()
    }
}

/// Address several records at once.
pub fn with_arguments<I, A>(args: I) -> RequestOptions
where
    I: IntoIterator<Item = A>,
    A: fmt::Display,
{
    RequestOptions {
        args: Some(args.into_iter().map(|a| a.to_string()).collect()),
        ..Default::default()
    }
}

/// Add query parameters.
pub fn with_parameters<I, K, V>(params: I) -> RequestOptions
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    RequestOptions {
        params: Some(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Nest the request under a parent path, e.g. `repositories/1`.
pub fn with_context(context: impl Into<String>) -> RequestOptions {
    RequestOptions {
        context: Some(context.into()),
        ..Default::default()
    }
}

/// Ask the server to include related records of these types.
pub fn include(resources: impl IntoIterator<Item = ResourceName>) -> RequestOptions {
    RequestOptions {
        include: Some(resources.into_iter().collect()),
        ..Default::default()
    }
}

/// Fetch only these fields of `resource`.
pub fn include_fields<I, S>(resource: ResourceName, fields: I) -> RequestOptions
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    field_selection(
        resource,
        FieldSelection::Include(fields.into_iter().map(Into::into).collect()),
    )
}

/// Fetch all fields of `resource` except these.
pub fn exclude_fields<I, S>(resource: ResourceName, fields: I) -> RequestOptions
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    field_selection(
        resource,
        FieldSelection::Exclude(fields.into_iter().map(Into::into).collect()),
    )
}

fn field_selection(resource: ResourceName, selection: FieldSelection) -> RequestOptions {
    RequestOptions {
        fields: Some(BTreeMap::from([(resource, selection)])),
        ..Default::default()
    }
}

/// Request body.
pub fn payload(body: Value) -> RequestOptions {
    RequestOptions {
        payload: Some(body),
        ..Default::default()
    }
}

/// HTTP method (defaults to GET).
pub fn method(method: Method) -> RequestOptions {
    RequestOptions {
        method: Some(method),
        ..Default::default()
    }
}

/// Replace the set of statuses treated as normal outcomes.
pub fn expect_statuses(statuses: impl IntoIterator<Item = u16>) -> RequestOptions {
    RequestOptions {
        expected_statuses: Some(statuses.into_iter().collect()),
        ..Default::default()
    }
}

/// Handle application errors with this `code` locally.
pub fn handle_error<F>(code: impl Into<String>, handler: F) -> RequestOptions
where
    F: Fn(&ApplicationError) + Send + Sync + 'static,
{
    let handler: ErrorHandler = Arc::new(handler);
    RequestOptions {
        error_handlers: Some(BTreeMap::from([(code.into(), handler)])),
        ..Default::default()
    }
}

/// Skip the resource type's default parameters, includes and field exclusions.
pub fn disable_defaults() -> RequestOptions {
    RequestOptions {
        disable_defaults: true,
        ..Default::default()
    }
}

/// Return unhandled application errors as `Err` instead of notifying.
pub fn raise_errors() -> RequestOptions {
    RequestOptions {
        raise_errors: true,
        ..Default::default()
    }
}

// =============================================================================
// Composition
// =============================================================================

/// A fully composed request.
#[derive(Clone)]
pub struct RequestDescriptor {
    pub resource: ResourceName,
    /// `{context/}{resource}{/args}`, without a leading slash.
    pub path: String,
    pub args: Vec<String>,
    pub params: BTreeMap<String, String>,
    pub method: Method,
    pub body: Option<Value>,
    pub expected_statuses: Vec<u16>,
    pub error_handlers: BTreeMap<String, ErrorHandler>,
    pub raise_errors: bool,
}

impl fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("resource", &self.resource)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("params", &self.params)
            .field("body", &self.body)
            .field("expected_statuses", &self.expected_statuses)
            .field("error_handlers", &self.error_handlers.keys().collect::<Vec<_>>())
            .field("raise_errors", &self.raise_errors)
            .finish()
    }
}

impl RequestDescriptor {
    /// Parameters as `k=v` pairs joined with `&`, in key order.
    pub fn query_string(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Whether `status` is one the caller treats as a normal outcome.
    pub fn expects(&self, status: u16) -> bool {
        self.expected_statuses.contains(&status)
    }

    /// The input handed to the transport adapter.
    pub fn transport_request(&self) -> TransportRequest {
        TransportRequest {
            path: self.path.clone(),
            params: self.params.clone(),
            method: self.method,
            body: self.body.clone(),
        }
    }
}

/// Fragments implied by a resource type's definition.
fn default_fragments(resource: ResourceName) -> Vec<RequestOptions> {
    let definition = resource.definition();
    let mut defaults = Vec::with_capacity(2 + definition.default_exclude_fields.len());
    if !definition.default_params.is_empty() {
        defaults.push(with_parameters(definition.default_params.iter().copied()));
    }
    if !definition.default_include.is_empty() {
        defaults.push(include(definition.default_include.iter().copied()));
    }
    for (name, fields) in definition.default_exclude_fields {
        defaults.push(exclude_fields(*name, fields.iter().copied()));
    }
    defaults
}

/// Compose option fragments into a request for `resource`.
///
/// Defaults come first so caller fragments override them where the merge
/// rules allow; the resource's completion hook runs last so its invariants
/// cannot be bypassed.
pub fn make_request(
    resource: ResourceName,
    options: impl IntoIterator<Item = RequestOptions>,
) -> Result<RequestDescriptor, RequestError> {
    let options: Vec<RequestOptions> = options.into_iter().collect();
    let definition = resource.definition();

    let fragments = if options.iter().any(|o| o.disable_defaults) {
        options
    } else {
        let mut all = default_fragments(resource);
        all.extend(options);
        all
    };

    let mut acc = fragments
        .into_iter()
        .try_fold(RequestOptions::default(), |acc, fragment| {
            acc.merge(fragment, resource)
        })?;

    if let Some(complete) = definition.complete_request {
        let payload = acc.payload.clone();
        complete(&mut acc, payload.as_ref())?;
    }

    let args = acc.args.unwrap_or_default();
    let mut path = String::new();
    if let Some(context) = acc.context.as_deref().map(|c| c.trim_matches('/'))
        && !context.is_empty()
    {
        path.push_str(context);
        path.push('/');
    }
    path.push_str(resource.as_str());
    if !args.is_empty() {
        path.push('/');
        path.push_str(&args.join(","));
    }

    let mut params = acc.params.unwrap_or_default();
    params
        .entry("output_format".to_string())
        .or_insert_with(|| "static".to_string());

    let include: BTreeSet<&'static str> = acc
        .include
        .unwrap_or_default()
        .into_iter()
        .map(ResourceName::as_str)
        .collect();
    if !include.is_empty() {
        params.insert(
            "include".to_string(),
            include.into_iter().collect::<Vec<_>>().join(","),
        );
    }

    for (name, selection) in acc.fields.unwrap_or_default() {
        params.insert(format!("fields[{}]", name), selection.to_param());
    }

    Ok(RequestDescriptor {
        resource,
        path,
        args,
        params,
        method: acc.method.unwrap_or_default(),
        body: acc.payload,
        expected_statuses: acc
            .expected_statuses
            .unwrap_or_else(|| DEFAULT_EXPECTED_STATUSES.to_vec()),
        error_handlers: acc.error_handlers.unwrap_or_default(),
        raise_errors: acc.raise_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_defaults_applied() {
        let descriptor = make_request(ResourceName::Reviews, [with_argument(12)]).unwrap();
        assert_eq!(descriptor.path, "reviews/12");
        assert_eq!(descriptor.method, Method::Get);
        assert_eq!(
            descriptor.query_string(),
            "fields[changesets]=-files&include=users&output_format=static"
        );
        assert_eq!(descriptor.expected_statuses, vec![200, 202, 204, 404]);
    }

    #[test]
    fn test_disable_defaults() {
        let descriptor =
            make_request(ResourceName::Reviews, [disable_defaults(), with_argument(12)]).unwrap();
        assert_eq!(descriptor.query_string(), "output_format=static");
    }

    #[test]
    fn test_context_and_multiple_arguments() {
        let descriptor = make_request(
            ResourceName::Commits,
            [
                with_context("repositories/1"),
                with_context("/branches/3/"),
                with_arguments([1, 2, 3]),
            ],
        )
        .unwrap();
        assert_eq!(descriptor.path, "repositories/1/branches/3/commits/1,2,3");
        assert_eq!(descriptor.args, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_include_sorted_and_deduplicated() {
        let descriptor = make_request(
            ResourceName::Branches,
            [
                include([ResourceName::Users, ResourceName::Commits]),
                include([ResourceName::Repositories, ResourceName::Users]),
            ],
        )
        .unwrap();
        assert_eq!(
            descriptor.params.get("include").map(String::as_str),
            Some("commits,repositories,users")
        );
    }

    #[test]
    fn test_params_later_wins() {
        let descriptor = make_request(
            ResourceName::Users,
            [
                with_parameters([("name", "alice"), ("status", "current")]),
                with_parameters([("name", "bob")]),
            ],
        )
        .unwrap();
        assert_eq!(descriptor.params["name"], "bob");
        assert_eq!(descriptor.params["status"], "current");
    }

    #[test]
    fn test_caller_fields_override_default_exclusion() {
        let descriptor = make_request(
            ResourceName::Commits,
            [include_fields(ResourceName::Commits, ["sha1", "summary"])],
        )
        .unwrap();
        assert_eq!(descriptor.params["fields[commits]"], "sha1,summary");
    }

    #[test]
    fn test_duplicate_method_fails() {
        let result = make_request(
            ResourceName::Reviews,
            [method(Method::Post), method(Method::Put)],
        );
        assert_eq!(
            result.unwrap_err(),
            RequestError::DuplicateOption {
                resource: ResourceName::Reviews,
                option: "method"
            }
        );
    }

    #[test]
    fn test_duplicate_arguments_fail() {
        let result = make_request(ResourceName::Users, [with_argument(1), with_argument(2)]);
        assert!(matches!(
            result,
            Err(RequestError::DuplicateOption { option: "args", .. })
        ));
    }

    #[test]
    fn test_expect_statuses_override() {
        let descriptor =
            make_request(ResourceName::Users, [expect_statuses([200, 204])]).unwrap();
        assert!(descriptor.expects(204));
        assert!(!descriptor.expects(404));
    }

    #[test]
    fn test_error_handlers_merge_by_code() {
        let descriptor = make_request(
            ResourceName::Branches,
            [
                handle_error("BAD_BRANCH_NAME", |_| {}),
                handle_error("BRANCH_EXISTS", |_| {}),
            ],
        )
        .unwrap();
        let codes: Vec<_> = descriptor.error_handlers.keys().cloned().collect();
        assert_eq!(codes, vec!["BAD_BRANCH_NAME", "BRANCH_EXISTS"]);
    }

    #[test]
    fn test_changeset_hook_forces_compact() {
        let descriptor = make_request(
            ResourceName::Changesets,
            [with_parameters([("compact", "no"), ("from", "1")])],
        )
        .unwrap();
        assert_eq!(descriptor.params["compact"], "yes");
        assert_eq!(descriptor.params["from"], "1");
    }

    #[test]
    fn test_filechanges_hook_takes_changeset_from_payload() {
        let descriptor = make_request(
            ResourceName::FileChanges,
            [method(Method::Post), payload(json!({"changeset": 77}))],
        )
        .unwrap();
        assert_eq!(descriptor.params["changeset"], "77");
        assert_eq!(descriptor.body, Some(json!({"changeset": 77})));
    }

    #[test]
    fn test_filechanges_hook_requires_changeset() {
        let result = make_request(ResourceName::FileChanges, [with_argument(3)]);
        assert_eq!(
            result.unwrap_err(),
            RequestError::MissingParameter {
                resource: ResourceName::FileChanges,
                parameter: "changeset"
            }
        );
    }

    #[test]
    fn test_transport_request() {
        let descriptor = make_request(
            ResourceName::Reviews,
            [disable_defaults(), method(Method::Put), payload(json!({"summary": "x"}))],
        )
        .unwrap();
        let request = descriptor.transport_request();
        assert_eq!(request.path, "reviews");
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.params.get("output_format").unwrap(), "static");
    }

    fn arb_fragment() -> impl Strategy<Value = RequestOptions> {
        let names = prop::sample::select(ResourceName::ALL.to_vec());
        prop_oneof![
            prop::collection::vec(names.clone(), 1..4).prop_map(include),
            prop::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 1..4)
                .prop_map(with_parameters),
            "[a-z]{1,8}".prop_map(with_context),
            (names.clone(), prop::collection::vec("[a-z_]{1,8}", 1..3))
                .prop_map(|(name, fields)| exclude_fields(name, fields)),
            (names, prop::collection::vec("[a-z_]{1,8}", 1..3))
                .prop_map(|(name, fields)| include_fields(name, fields)),
        ]
    }

    proptest! {
        #[test]
        fn composition_is_deterministic(
            fragments in prop::collection::vec(arb_fragment(), 0..8)
        ) {
            let a = make_request(ResourceName::Branches, fragments.clone()).unwrap();
            let b = make_request(ResourceName::Branches, fragments).unwrap();
            prop_assert_eq!(&a.path, &b.path);
            prop_assert_eq!(a.query_string(), b.query_string());
            prop_assert_eq!(&a.params, &b.params);
        }

        #[test]
        fn include_param_is_sorted_and_unique(
            names in prop::collection::vec(prop::sample::select(ResourceName::ALL.to_vec()), 1..10)
        ) {
            let descriptor = make_request(
                ResourceName::Users,
                [disable_defaults(), include(names)],
            )
            .unwrap();
            let listed: Vec<&str> = descriptor.params["include"].split(',').collect();
            let mut sorted = listed.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(listed, sorted);
        }
    }
}
