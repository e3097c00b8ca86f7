//! Response normalization.
//!
//! Decomposes a response envelope
//!
//! ```text
//! {
//!   "<resource>": [ {...}, ... ],
//!   "linked":  { "<resource>": [ {...}, ... ] | "limited", ... },
//!   "deleted": { "<resource>": [id, ...], ... },
//!   "invalid": { "<resource>": [id, ...], ... },
//!   "total":   123
//! }
//! ```
//!
//! into typed records grouped per resource type, merging partial records over
//! what is already known.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::cache::{CacheState, DataUpdate};
use crate::error::NormalizeError;
use crate::ids::{Identifiable, RecordId};
use crate::resources::{Record, ResourceName};

/// Marker used in `linked` for withheld resource types.
const LIMITED: &str = "limited";

/// Flag carried by records fetched with a sparse fieldset.
const IS_PARTIAL: &str = "is_partial";

/// A decomposed response.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Records of the requested resource type, in response order.
    pub primary: Vec<Record>,
    /// Size of the whole collection, when the server reports it.
    pub total: Option<u64>,
    /// Everything in the response, ready to dispatch.
    pub update: DataUpdate,
}

/// Normalize a successful response for `resource`.
///
/// `state` supplies the existing records partial records are merged onto.
pub fn normalize(
    resource: ResourceName,
    json: &Value,
    state: &CacheState,
) -> Result<Normalized, NormalizeError> {
    let envelope = json.as_object().ok_or(NormalizeError::NotAnObject)?;
    let mut update = DataUpdate::default();

    let primary = match envelope.get(resource.as_str()) {
        Some(value) if value.as_str() == Some(LIMITED) => {
            trace!(resource = %resource, "primary records withheld");
            update.limited.insert(resource);
            Vec::new()
        }
        Some(value) => add_records(resource, value, state, &mut update)?,
        None => Vec::new(),
    };

    if let Some(linked) = envelope.get("linked") {
        let linked = linked
            .as_object()
            .ok_or_else(|| NormalizeError::MalformedSection {
                section: "linked",
                reason: "expected an object".to_string(),
            })?;
        for (name, value) in linked {
            let Some(linked_resource) = ResourceName::from_wire(name) else {
                warn!(resource = %name, "skipping unknown linked resource type");
                continue;
            };
            if value.as_str() == Some(LIMITED) {
                trace!(resource = %linked_resource, "linked records withheld");
                update.limited.insert(linked_resource);
                continue;
            }
            add_records(linked_resource, value, state, &mut update)?;
        }
    }

    if let Some(deleted) = envelope.get("deleted") {
        update.deleted = id_sections("deleted", deleted)?;
    }
    if let Some(invalid) = envelope.get("invalid") {
        update.invalid = id_sections("invalid", invalid)?;
    }

    let total = envelope.get("total").and_then(Value::as_u64);

    debug!(
        resource = %resource,
        primary = primary.len(),
        records = update.record_count(),
        limited = update.limited.len(),
        "normalized response"
    );

    Ok(Normalized {
        primary,
        total,
        update,
    })
}

/// Construct every record in `value` and add them to `update`.
///
/// Returns the constructed records in input order.
fn add_records(
    resource: ResourceName,
    value: &Value,
    state: &CacheState,
    update: &mut DataUpdate,
) -> Result<Vec<Record>, NormalizeError> {
    let items = value
        .as_array()
        .ok_or_else(|| NormalizeError::MalformedRecord {
            resource,
            reason: "expected an array of records".to_string(),
        })?;

    let mut records = Vec::with_capacity(items.len());
    for item in items {
        let record = build_record(resource, item, state, update)?;
        update.push(record.clone());
        records.push(record);
    }
    Ok(records)
}

fn build_record(
    resource: ResourceName,
    item: &Value,
    state: &CacheState,
    update: &DataUpdate,
) -> Result<Record, NormalizeError> {
    let mut props = item
        .as_object()
        .cloned()
        .ok_or_else(|| NormalizeError::MalformedRecord {
            resource,
            reason: format!("expected an object, got {}", item),
        })?;

    let is_partial = props
        .remove(IS_PARTIAL)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let definition = resource.definition();
    let mut props = definition.prepare(props);

    if is_partial
        && let Some(id) = props.get("id").and_then(RecordId::from_json)
        && let Some(existing) = existing_record(resource, &id, state, update)
    {
        trace!(resource = %resource, id = %id, "merging partial record");
        let mut merged = existing.props();
        merged.append(&mut props);
        props = merged;
    }

    (definition.construct)(props).map_err(|source| NormalizeError::Construct { resource, source })
}

/// The most recent known version of a record: earlier in this response, else cached.
fn existing_record(
    resource: ResourceName,
    id: &RecordId,
    state: &CacheState,
    update: &DataUpdate,
) -> Option<Record> {
    update
        .records(resource)
        .iter()
        .rev()
        .find(|record| &record.id() == id)
        .or_else(|| state.record(resource, id))
        .cloned()
}

/// Parse a `deleted`/`invalid` section into id sets per resource type.
pub fn id_sections(
    section: &'static str,
    value: &Value,
) -> Result<BTreeMap<ResourceName, BTreeSet<RecordId>>, NormalizeError> {
    let malformed = |reason: String| NormalizeError::MalformedSection { section, reason };

    let object = value
        .as_object()
        .ok_or_else(|| malformed("expected an object".to_string()))?;

    let mut sections = BTreeMap::new();
    for (name, ids) in object {
        let Some(resource) = ResourceName::from_wire(name) else {
            warn!(section, resource = %name, "skipping unknown resource type");
            continue;
        };
        let ids = ids
            .as_array()
            .ok_or_else(|| malformed(format!("{} is not an array", name)))?
            .iter()
            .map(|id| {
                RecordId::from_json(id).ok_or_else(|| malformed(format!("invalid id {}", id)))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        if !ids.is_empty() {
            sections.insert(resource, ids);
        }
    }
    Ok(sections)
}
