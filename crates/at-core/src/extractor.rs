//! Change extraction
//!
//! Compares before/after snapshots of a tracked instance and produces the
//! change event to record, or nothing when no captured property changed.

use at_common::{AuditAction, ChangeEvent, FieldChange};

use crate::context::AuditContext;
use crate::descriptor::{EntityDescriptor, PropertyTable, RelatedDescriptor};
use crate::value::has_changed;

/// Diff every captured property; only changed properties are returned
pub fn diff_properties<T>(table: &PropertyTable<T>, before: &T, after: &T) -> Vec<FieldChange> {
    table
        .read(before)
        .zip(table.read(after))
        .filter(|((_, old), (_, new))| has_changed(old, new))
        .map(|((name, old), (_, new))| FieldChange::diff(name, old.canonical(), new.canonical()))
        .collect()
}

/// Capture every property of one snapshot, skipping names in `exclude`
pub fn capture_properties<T>(
    table: &PropertyTable<T>,
    snapshot: &T,
    exclude: impl Fn(&str) -> bool,
) -> Vec<FieldChange> {
    table
        .read(snapshot)
        .filter(|(name, _)| !exclude(name))
        .map(|(name, value)| FieldChange::captured(name, value.canonical()))
        .collect()
}

/// Diff two capture-style field lists by name, as produced for the same
/// lookup before and after an update
///
/// Only names present on both sides are compared. A name missing from one
/// side belongs to a lookup that did not resolve there, so its value is
/// unknown rather than cleared.
pub fn diff_captured(before: &[FieldChange], after: &[FieldChange]) -> Vec<FieldChange> {
    before
        .iter()
        .filter_map(|old| {
            let new = after.iter().find(|f| f.name == old.name)?;
            (old.value != new.value).then(|| FieldChange::diff(&old.name, old.value.clone(), new.value.clone()))
        })
        .collect()
}

/// Event for a top-level entity change
///
/// Created and Deleted events carry no fields; the snapshot itself is
/// not recorded. Updated events are suppressed when nothing changed.
pub fn extract<T: 'static>(
    descriptor: &EntityDescriptor<T>,
    before: Option<&T>,
    after: Option<&T>,
    ctx: &AuditContext,
) -> Option<ChangeEvent> {
    match (before, after) {
        (None, Some(_)) => Some(event(AuditAction::Created, ctx)),
        (Some(_), None) => Some(event(AuditAction::Deleted, ctx)),
        (Some(old), Some(new)) => {
            let fields = diff_properties(descriptor.properties(), old, new);
            (!fields.is_empty()).then(|| event(AuditAction::Updated, ctx).with_fields(fields))
        }
        (None, None) => None,
    }
}

/// Event for a related entity change, recorded into the parent's document
///
/// `lookups_before`/`lookups_after` are the resolved lookup fields for each
/// snapshot. Properties that are the foreign key of a lookup are replaced by
/// those fields, so a raw key never appears next to its display values.
pub fn extract_related<C: 'static>(
    descriptor: &RelatedDescriptor<C>,
    before: Option<&C>,
    after: Option<&C>,
    lookups_before: &[FieldChange],
    lookups_after: &[FieldChange],
    ctx: &AuditContext,
) -> Option<ChangeEvent> {
    let is_lookup_key = |name: &str| descriptor.is_lookup_key(name);

    let (action, fields) = match (before, after) {
        (None, Some(new)) => {
            let mut fields = capture_properties(descriptor.properties(), new, is_lookup_key);
            fields.extend_from_slice(lookups_after);
            (AuditAction::Added, fields)
        }
        (Some(old), None) => {
            let mut fields = capture_properties(descriptor.properties(), old, is_lookup_key);
            fields.extend_from_slice(lookups_before);
            (AuditAction::Removed, fields)
        }
        (Some(old), Some(new)) => {
            let mut fields: Vec<FieldChange> = diff_properties(descriptor.properties(), old, new)
                .into_iter()
                .filter(|f| !is_lookup_key(&f.name))
                .collect();
            fields.extend(diff_captured(lookups_before, lookups_after));
            if fields.is_empty() {
                return None;
            }
            (AuditAction::Updated, fields)
        }
        (None, None) => return None,
    };

    Some(
        event(action, ctx)
            .with_related(descriptor.related_type())
            .with_fields(fields),
    )
}

fn event(action: AuditAction, ctx: &AuditContext) -> ChangeEvent {
    ChangeEvent::new(action, ctx.actor.clone(), ctx.timestamp)
}
