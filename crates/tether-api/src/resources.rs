//! Resource registry.
//!
//! `ResourceName` is the closed set of resource types the server exposes.
//! Each has a static [`ResourceDefinition`] describing request defaults and
//! how wire objects become typed [`Record`]s.
//!
//! # Adding a resource type
//!
//! 1. Define the record struct in `records.rs`.
//! 2. Add one line to the `define_resources!` invocation below.
//! 3. Add a `ResourceDefinition` static and map it in
//!    [`ResourceName::definition`].
//! 4. If it needs secondary indexes, add them to `CacheState` in `cache.rs`.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;
use crate::ids::{Identifiable, RecordId};
use crate::records::{
    Branch, Changeset, Comment, Commit, Extension, ExtensionVersion, File, FileChange, Repository,
    Review, Tree, User,
};
use crate::request::RequestOptions;

/// Wire form of a record: a JSON object.
pub type Props = Map<String, Value>;

/// A record type bound to its resource name.
pub trait Resource: Identifiable + Sized + Send + Sync + 'static {
    const NAME: ResourceName;

    /// Borrow the typed record out of a [`Record`] of the matching variant.
    fn from_record(record: &Record) -> Option<&Arc<Self>>;

    /// Wrap a typed record.
    fn into_record(self) -> Record;
}

/// Generates `ResourceName`, `Record`, and the per-type trait impls.
macro_rules! define_resources {
    ($( $variant:ident => $wire:literal, $ty:ty; )*) => {
        /// Closed enumeration of resource types.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum ResourceName {
            $(
                #[serde(rename = $wire)]
                $variant,
            )*
        }

        impl ResourceName {
            /// Every resource type, in declaration order.
            pub const ALL: &'static [ResourceName] = &[$(ResourceName::$variant),*];

            /// The name used on the wire and in request paths.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(ResourceName::$variant => $wire,)*
                }
            }

            /// Look up a resource type by its wire name.
            pub fn from_wire(name: &str) -> Option<Self> {
                match name {
                    $($wire => Some(ResourceName::$variant),)*
                    _ => None,
                }
            }
        }

        /// An immutable domain record of any resource type.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Record {
            $($variant(Arc<$ty>),)*
        }

        impl Record {
            /// The resource type of this record.
            pub fn resource(&self) -> ResourceName {
                match self {
                    $(Record::$variant(_) => ResourceName::$variant,)*
                }
            }

            /// Convert back to wire shape.
            pub fn props(&self) -> Props {
                let value = match self {
                    $(Record::$variant(r) => serde_json::to_value(r.as_ref()),)*
                };
                match value {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                }
            }
        }

        impl Identifiable for Record {
            fn id(&self) -> RecordId {
                match self {
                    $(Record::$variant(r) => r.id.clone(),)*
                }
            }
        }

        $(
            impl Identifiable for $ty {
                fn id(&self) -> RecordId {
                    self.id.clone()
                }
            }

            impl Resource for $ty {
                const NAME: ResourceName = ResourceName::$variant;

                fn from_record(record: &Record) -> Option<&Arc<Self>> {
                    match record {
                        Record::$variant(r) => Some(r),
                        _ => None,
                    }
                }

                fn into_record(self) -> Record {
                    Record::$variant(Arc::new(self))
                }
            }
        )*
    };
}

define_resources! {
    Users => "users", User;
    Repositories => "repositories", Repository;
    Branches => "branches", Branch;
    Commits => "commits", Commit;
    Reviews => "reviews", Review;
    Changesets => "changesets", Changeset;
    FileChanges => "filechanges", FileChange;
    Files => "files", File;
    Trees => "trees", Tree;
    Comments => "comments", Comment;
    Extensions => "extensions", Extension;
    ExtensionVersions => "extensionversions", ExtensionVersion;
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Record {
    /// Borrow as a typed record.
    pub fn downcast<T: Resource>(&self) -> Option<&Arc<T>> {
        T::from_record(self)
    }
}

/// Per-resource request defaults and record construction.
pub struct ResourceDefinition {
    pub name: ResourceName,
    /// Query parameters added to every request unless defaults are disabled.
    pub default_params: &'static [(&'static str, &'static str)],
    /// Resource types eagerly included as linked records.
    pub default_include: &'static [ResourceName],
    /// Fields excluded by default, per resource type.
    pub default_exclude_fields: &'static [(ResourceName, &'static [&'static str])],
    /// Build a typed record from constructor input.
    pub construct: fn(Props) -> Result<Record, serde_json::Error>,
    /// Wire to constructor-input transform.
    pub prepare: Option<fn(Props) -> Props>,
    /// Applied last when composing a request; sees the payload, if any.
    pub complete_request: Option<fn(&mut RequestOptions, Option<&Value>) -> Result<(), RequestError>>,
}

impl ResourceDefinition {
    /// Run `prepare`, or pass through if the resource has none.
    pub fn prepare(&self, props: Props) -> Props {
        match self.prepare {
            Some(prepare) => prepare(props),
            None => props,
        }
    }
}

impl fmt::Debug for ResourceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDefinition")
            .field("name", &self.name)
            .field("default_params", &self.default_params)
            .field("default_include", &self.default_include)
            .field("default_exclude_fields", &self.default_exclude_fields)
            .finish_non_exhaustive()
    }
}

fn construct<T: Resource + DeserializeOwned>(props: Props) -> Result<Record, serde_json::Error> {
    serde_json::from_value::<T>(Value::Object(props)).map(T::into_record)
}

/// Derive `summary` from the first line of `message` when the server omitted it.
fn prepare_commit(mut props: Props) -> Props {
    if !props.contains_key("summary")
        && let Some(Value::String(message)) = props.get("message")
    {
        let summary = message.lines().next().unwrap_or_default().to_string();
        props.insert("summary".to_string(), Value::String(summary));
    }
    props
}

/// Tree entries are kept sorted by name.
fn prepare_tree(mut props: Props) -> Props {
    if let Some(Value::Array(entries)) = props.get_mut("entries") {
        entries.sort_by(|a, b| {
            let a = a.get("name").and_then(Value::as_str).unwrap_or_default();
            let b = b.get("name").and_then(Value::as_str).unwrap_or_default();
            a.cmp(b)
        });
    }
    props
}

/// Changesets are always fetched in compact form.
fn complete_changesets(
    options: &mut RequestOptions,
    _payload: Option<&Value>,
) -> Result<(), RequestError> {
    options
        .params
        .get_or_insert_with(Default::default)
        .insert("compact".to_string(), "yes".to_string());
    Ok(())
}

/// File changes are scoped to a changeset, taken from the payload if needed.
fn complete_filechanges(
    options: &mut RequestOptions,
    payload: Option<&Value>,
) -> Result<(), RequestError> {
    let params = options.params.get_or_insert_with(Default::default);
    if params.contains_key("changeset") {
        return Ok(());
    }
    let changeset = payload
        .and_then(|p| p.get("changeset"))
        .and_then(RecordId::from_json)
        .ok_or(RequestError::MissingParameter {
            resource: ResourceName::FileChanges,
            parameter: "changeset",
        })?;
    params.insert("changeset".to_string(), changeset.to_string());
    Ok(())
}

static USERS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Users,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<User>,
    prepare: None,
    complete_request: None,
};

static REPOSITORIES: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Repositories,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<Repository>,
    prepare: None,
    complete_request: None,
};

static BRANCHES: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Branches,
    default_params: &[],
    default_include: &[ResourceName::Commits],
    default_exclude_fields: &[],
    construct: construct::<Branch>,
    prepare: None,
    complete_request: None,
};

static COMMITS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Commits,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[(ResourceName::Commits, &["diff_stats"])],
    construct: construct::<Commit>,
    prepare: Some(prepare_commit),
    complete_request: None,
};

static REVIEWS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Reviews,
    default_params: &[],
    default_include: &[ResourceName::Users],
    default_exclude_fields: &[(ResourceName::Changesets, &["files"])],
    construct: construct::<Review>,
    prepare: None,
    complete_request: None,
};

static CHANGESETS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Changesets,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<Changeset>,
    prepare: None,
    complete_request: Some(complete_changesets),
};

static FILE_CHANGES: ResourceDefinition = ResourceDefinition {
    name: ResourceName::FileChanges,
    default_params: &[],
    default_include: &[ResourceName::Files],
    default_exclude_fields: &[],
    construct: construct::<FileChange>,
    prepare: None,
    complete_request: Some(complete_filechanges),
};

static FILES: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Files,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<File>,
    prepare: None,
    complete_request: None,
};

static TREES: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Trees,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<Tree>,
    prepare: Some(prepare_tree),
    complete_request: None,
};

static COMMENTS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Comments,
    default_params: &[],
    default_include: &[ResourceName::Users],
    default_exclude_fields: &[],
    construct: construct::<Comment>,
    prepare: None,
    complete_request: None,
};

static EXTENSIONS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::Extensions,
    default_params: &[],
    default_include: &[],
    default_exclude_fields: &[],
    construct: construct::<Extension>,
    prepare: None,
    complete_request: None,
};

static EXTENSION_VERSIONS: ResourceDefinition = ResourceDefinition {
    name: ResourceName::ExtensionVersions,
    default_params: &[],
    default_include: &[ResourceName::Extensions],
    default_exclude_fields: &[],
    construct: construct::<ExtensionVersion>,
    prepare: None,
    complete_request: None,
};

impl ResourceName {
    /// The static definition for this resource type.
    pub fn definition(self) -> &'static ResourceDefinition {
        match self {
            ResourceName::Users => &USERS,
            ResourceName::Repositories => &REPOSITORIES,
            ResourceName::Branches => &BRANCHES,
            ResourceName::Commits => &COMMITS,
            ResourceName::Reviews => &REVIEWS,
            ResourceName::Changesets => &CHANGESETS,
            ResourceName::FileChanges => &FILE_CHANGES,
            ResourceName::Files => &FILES,
            ResourceName::Trees => &TREES,
            ResourceName::Comments => &COMMENTS,
            ResourceName::Extensions => &EXTENSIONS,
            ResourceName::ExtensionVersions => &EXTENSION_VERSIONS,
        }
    }
}
