//! Version-to-version diffs.
//!
//! Everything here is a pure function over two pinned snapshots, so it can
//! run on the notifier thread without blocking writers or readers.

use crate::changeset::{ChangeSet, PropertyChange};
use crate::collection::{linked_keys, CollectionSource};
use crate::registry::{KeyPath, KeyPathFilter, ObserverTarget};
use ripple_engine::{CommitLog, ObjectId, ObjectSchema, PropertyDescriptor, Record, Schema, Snapshot};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What happened to an observed target between two versions.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// The target still exists; the change set may be empty
    Changed(ChangeSet),
    /// The target no longer exists
    Deleted,
}

/// Diff one object between two versions.
///
/// Every property whose value differs is reported with its prior and new
/// value. When the object did not exist at `prior`, every property is
/// reported without an old value.
pub fn diff_object(prior: &Snapshot, new: &Snapshot, id: &ObjectId) -> Delta {
    let Some(new_record) = new.get(id) else {
        return Delta::Deleted;
    };
    let Some(object_schema) = new.schema().get_object(&id.table) else {
        return Delta::Changed(ChangeSet::default());
    };

    let property_diffs = match prior.get(id) {
        Some(old_record) if Arc::ptr_eq(old_record, new_record) => Vec::new(),
        Some(old_record) => object_schema
            .properties
            .iter()
            .filter_map(|descriptor| {
                let old_value = value_of(old_record, descriptor);
                let new_value = value_of(new_record, descriptor);
                (old_value != new_value).then(|| PropertyChange {
                    name: descriptor.name.clone(),
                    old_value: Some(old_value),
                    new_value: Some(new_value),
                })
            })
            .collect(),
        None => object_schema
            .properties
            .iter()
            .map(|descriptor| PropertyChange {
                name: descriptor.name.clone(),
                old_value: None,
                new_value: Some(value_of(new_record, descriptor)),
            })
            .collect(),
    };

    Delta::Changed(ChangeSet {
        property_diffs,
        ..ChangeSet::default()
    })
}

/// Diff the ordered contents of a collection between two versions.
///
/// Elements are matched by identity (a key repeated in a list is matched by
/// occurrence). Matched elements that keep their relative order are
/// retained; every other matched element counts as moved and is reported as
/// a deletion plus an insertion. A retained element whose properties changed
/// is a modification.
pub fn diff_collection(source: &CollectionSource, prior: &Snapshot, new: &Snapshot) -> Delta {
    let Some(new_ids) = source.ids(new) else {
        return Delta::Deleted;
    };
    let old_ids = source.ids(prior).unwrap_or_default();

    let old_idents = occurrences(&old_ids);
    let new_idents = occurrences(&new_ids);
    let new_position: HashMap<(&ObjectId, usize), usize> = new_idents
        .iter()
        .enumerate()
        .map(|(j, ident)| (*ident, j))
        .collect();

    let mut changes = ChangeSet::default();
    let mut matched = Vec::new();
    for (i, ident) in old_idents.iter().enumerate() {
        match new_position.get(ident) {
            Some(&j) => matched.push((i, j)),
            None => changes.deletions.push(i),
        }
    }

    let keep = longest_increasing(&matched.iter().map(|(_, j)| *j).collect::<Vec<_>>());
    let mut retained = vec![false; new_ids.len()];
    let element_schema = source
        .element_table(new.schema())
        .ok()
        .and_then(|table| new.schema().get_object(&table).cloned());

    for (k, (i, j)) in matched.into_iter().enumerate() {
        if !keep[k] {
            changes.deletions.push(i);
            continue;
        }
        retained[j] = true;

        let id = &new_ids[j];
        let changed = match (&element_schema, prior.get(id), new.get(id)) {
            (Some(schema), Some(old_record), Some(new_record)) => {
                changed_properties(schema, old_record, new_record)
            }
            _ => Vec::new(),
        };
        if !changed.is_empty() {
            changes.modifications_old.push(i);
            changes.modifications_new.push(j);
            changes.modified_properties.push(changed);
        }
    }

    changes.deletions.sort_unstable();
    changes.insertions = retained
        .iter()
        .enumerate()
        .filter(|(_, kept)| !**kept)
        .map(|(j, _)| j)
        .collect();

    Delta::Changed(changes)
}

/// Derive an object change from a commit's write log.
///
/// The log only carries new values, so no property change has an old value.
pub fn object_change_from_log(schema: &Schema, log: &CommitLog, id: &ObjectId) -> Delta {
    if log.deleted.contains(id) {
        return Delta::Deleted;
    }
    let Some(written) = log.modifications(id) else {
        return Delta::Changed(ChangeSet::default());
    };

    let mut property_diffs: Vec<(usize, PropertyChange)> = written
        .iter()
        .map(|(name, value)| {
            let index = schema
                .get_object(&id.table)
                .and_then(|s| s.property_index(name))
                .unwrap_or(usize::MAX);
            (
                index,
                PropertyChange {
                    name: name.clone(),
                    old_value: None,
                    new_value: Some(value.clone()),
                },
            )
        })
        .collect();
    property_diffs.sort_by_key(|(index, _)| *index);

    Delta::Changed(ChangeSet {
        property_diffs: property_diffs.into_iter().map(|(_, change)| change).collect(),
        ..ChangeSet::default()
    })
}

/// Diff whatever an observer is attached to.
pub(crate) fn diff_target(target: &ObserverTarget, prior: &Snapshot, new: &Snapshot) -> Delta {
    match target {
        ObserverTarget::Object(id) => diff_object(prior, new, id),
        ObserverTarget::Collection(source) => diff_collection(source, prior, new),
        ObserverTarget::Realm => Delta::Changed(ChangeSet::default()),
    }
}

/// Diff a target and fold in changes reached through `filter`'s nested key
/// paths.
pub(crate) fn diff_observed(
    target: &ObserverTarget,
    filter: Option<&KeyPathFilter>,
    prior: &Snapshot,
    new: &Snapshot,
) -> Delta {
    with_linked_changes(diff_target(target, prior, new), target, filter, prior, new)
}

/// Report the first property of each nested key path as changed when the
/// values it leads to differ between `prior` and `new`.
///
/// For an object this adds a property change; for a collection it marks the
/// retained elements concerned as modified.
pub(crate) fn with_linked_changes(
    delta: Delta,
    target: &ObserverTarget,
    filter: Option<&KeyPathFilter>,
    prior: &Snapshot,
    new: &Snapshot,
) -> Delta {
    let paths: Vec<&KeyPath> = filter.map(|f| f.linked().collect()).unwrap_or_default();
    let mut changes = match delta {
        Delta::Changed(changes) => changes,
        Delta::Deleted => return Delta::Deleted,
    };
    if paths.is_empty() {
        return Delta::Changed(changes);
    }

    match target {
        ObserverTarget::Object(id) => {
            let (Some(old_record), Some(new_record), Some(schema)) =
                (prior.get(id), new.get(id), new.schema().get_object(&id.table))
            else {
                return Delta::Changed(changes);
            };
            for path in paths {
                let Some(descriptor) = schema.properties.get(path.root) else {
                    continue;
                };
                if changes.property_diffs.iter().any(|p| p.name == descriptor.name) {
                    continue;
                }
                if follow(prior, old_record, path) != follow(new, new_record, path) {
                    changes.property_diffs.push(PropertyChange {
                        name: descriptor.name.clone(),
                        old_value: Some(value_of(old_record, descriptor)),
                        new_value: Some(value_of(new_record, descriptor)),
                    });
                }
            }
            changes
                .property_diffs
                .sort_by_key(|p| schema.property_index(&p.name).unwrap_or(usize::MAX));
        }
        ObserverTarget::Collection(source) => {
            let (Some(old_ids), Some(new_ids)) = (source.ids(prior), source.ids(new)) else {
                return Delta::Changed(changes);
            };
            let mut modified: Vec<(usize, usize, Vec<usize>)> = changes
                .modifications()
                .zip(changes.modified_properties.iter().cloned())
                .map(|((i, j), props)| (i, j, props))
                .collect();

            // Retained elements keep their relative order on both sides
            let kept_old = (0..old_ids.len()).filter(|i| !changes.deletions.contains(i));
            let kept_new = (0..new_ids.len()).filter(|j| !changes.insertions.contains(j));
            for (i, j) in kept_old.zip(kept_new) {
                let (Some(old_record), Some(new_record)) = (prior.get(&old_ids[i]), new.get(&new_ids[j]))
                else {
                    continue;
                };
                for path in &paths {
                    if follow(prior, old_record, path) == follow(new, new_record, path) {
                        continue;
                    }
                    match modified.iter_mut().find(|(_, n, _)| *n == j) {
                        Some((_, _, props)) if props.contains(&path.root) => {}
                        Some((_, _, props)) => {
                            props.push(path.root);
                            props.sort_unstable();
                        }
                        None => modified.push((i, j, vec![path.root])),
                    }
                }
            }

            modified.sort_by_key(|(_, j, _)| *j);
            changes.modifications_old = modified.iter().map(|(i, _, _)| *i).collect();
            changes.modifications_new = modified.iter().map(|(_, j, _)| *j).collect();
            changes.modified_properties = modified.into_iter().map(|(_, _, props)| props).collect();
        }
        ObserverTarget::Realm => {}
    }

    Delta::Changed(changes)
}

// Values of the leaf property on every object reached from `record`.
fn follow(snapshot: &Snapshot, record: &Arc<Record>, path: &KeyPath) -> Vec<Option<Value>> {
    let mut records = vec![Arc::clone(record)];
    for (property, table) in &path.links {
        records = records
            .iter()
            .flat_map(|r| linked_keys(r, property))
            .filter_map(|key| snapshot.get(&ObjectId::new(table.as_str(), key)).cloned())
            .collect();
    }
    records
        .iter()
        .map(|r| r.get(&path.leaf).cloned())
        .collect()
}

fn value_of(record: &Record, descriptor: &PropertyDescriptor) -> Value {
    record
        .get(&descriptor.name)
        .cloned()
        .unwrap_or_else(|| descriptor.default_value())
}

fn changed_properties(schema: &ObjectSchema, old: &Arc<Record>, new: &Arc<Record>) -> Vec<usize> {
    if Arc::ptr_eq(old, new) {
        return Vec::new();
    }
    schema
        .properties
        .iter()
        .enumerate()
        .filter(|(_, descriptor)| value_of(old, descriptor) != value_of(new, descriptor))
        .map(|(index, _)| index)
        .collect()
}

fn occurrences(ids: &[ObjectId]) -> Vec<(&ObjectId, usize)> {
    let mut seen: HashMap<&ObjectId, usize> = HashMap::new();
    ids.iter()
        .map(|id| {
            let n = seen.entry(id).or_insert(0);
            let ident = (id, *n);
            *n += 1;
            ident
        })
        .collect()
}

// Marks the members of one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];

    for i in 0..seq.len() {
        let pos = tails.partition_point(|&t| seq[t] < seq[i]);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }

    let mut keep = vec![false; seq.len()];
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        keep[i] = true;
        cursor = prev[i];
    }
    keep
}
