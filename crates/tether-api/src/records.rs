//! Typed domain records.
//!
//! Each struct mirrors the wire shape of one resource type. Every field other
//! than `id` may be absent so that records built from sparse fieldsets can be
//! represented; absent optional fields are skipped when converting back to
//! props.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::RecordId;

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A hosted Git repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A branch in a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the head commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<RecordId>,
    /// Number of commits on the branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Author or committer metadata of a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitUser {
    pub name: String,
    pub email: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A Git commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// First line of the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<CommitUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committer: Option<CommitUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_stats: Option<serde_json::Value>,
}

/// A code review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub owners: BTreeSet<RecordId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changesets: Vec<RecordId>,
}

/// The difference between two commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_commit: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_commit: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<RecordId>,
    /// Which parts of the changeset the server has finished computing.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub completion_level: BTreeSet<String>,
}

/// One file's change within a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_sha1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_mode: Option<u32>,
}

/// A path known to the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One entry in a tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub sha1: String,
}

/// A place where a tree appears: a path within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLocation {
    pub commit: RecordId,
    pub path: String,
}

/// A Git tree object, identified by its SHA-1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<TreeEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<TreeLocation>,
}

/// A review comment or issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<RecordId>,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub comment_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An installed extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A specific version of an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionVersion {
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    /// Raw manifest as sent by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
}

/// Parsed form of an extension version's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub roles: Vec<ManifestRole>,
}

/// A role declared in an extension manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRole {
    #[serde(rename = "type")]
    pub role_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ExtensionVersion {
    /// Parse the manifest, if present and well-formed.
    pub fn parsed_manifest(&self) -> Option<ExtensionManifest> {
        let raw = self.manifest.as_ref()?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Timestamps travel as (possibly fractional) seconds since the Unix epoch.
mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_f64(ts.timestamp_millis() as f64 / 1000.0),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct TimestampVisitor;

        impl<'de> Visitor<'de> for TimestampVisitor {
            type Value = Option<DateTime<Utc>>;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("seconds since the epoch (integer or float) or null")
            }

            fn visit_none<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(None)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(None)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserializer.deserialize_any(self)
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                super::from_millis(v.saturating_mul(1000)).map(Some)
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_i64(i64::try_from(v).map_err(E::custom)?)
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                super::from_millis((v * 1000.0).round() as i64).map(Some)
            }
        }

        deserializer.deserialize_option(TimestampVisitor)
    }
}

fn from_millis<E: serde::de::Error>(millis: i64) -> Result<DateTime<Utc>, E> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| E::custom(format!("timestamp out of range: {}ms", millis)))
}
