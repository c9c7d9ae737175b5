//! Lookup resolution
//!
//! Turns the foreign key of a related entity into readable fields of the
//! entity it references. References are either supplied by the caller
//! alongside the change (push) or found in a per-unit-of-work cache and,
//! failing that, loaded from a [`ReferenceSource`] (pull).
//!
//! A reference that cannot be found, or whose type cannot be resolved,
//! contributes no fields; the event is still recorded.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use at_common::FieldChange;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::descriptor::{LookupDescriptor, RelatedDescriptor, TypeResolver};
use crate::value::AuditValue;

/// A referenced entity instance held by the cache or returned by a source
pub type ReferenceInstance = Arc<dyn Any + Send + Sync>;

/// Loads referenced entities by primary key
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    /// Find the instance of `reference_type` whose primary key is `key`
    async fn find_by_key(
        &self,
        reference_type: &str,
        key: &AuditValue,
    ) -> anyhow::Result<Option<ReferenceInstance>>;
}

/// Reference instances already loaded in the current unit of work, by type
#[derive(Default)]
pub struct ReferenceCache {
    instances: RwLock<HashMap<TypeId, Vec<ReferenceInstance>>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an instance loaded by the caller
    pub fn insert<R: Any + Send + Sync>(&self, instance: R) {
        self.insert_shared(Arc::new(instance));
    }

    pub fn insert_shared(&self, instance: ReferenceInstance) {
        let type_id = (*instance).type_id();
        self.instances.write().entry(type_id).or_default().push(instance);
    }

    /// Instances of `type_id`
    pub fn of_type(&self, type_id: TypeId) -> Vec<ReferenceInstance> {
        self.instances
            .read()
            .get(&type_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.instances.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves lookup fields for related entity snapshots
#[derive(Clone, Default)]
pub struct LookupResolver {
    type_resolver: Option<Arc<dyn TypeResolver>>,
}

impl LookupResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type_resolver(type_resolver: Arc<dyn TypeResolver>) -> Self {
        Self {
            type_resolver: Some(type_resolver),
        }
    }

    fn type_resolver(&self) -> Option<&dyn TypeResolver> {
        self.type_resolver.as_deref()
    }

    /// Push strategy: match the caller-supplied references against each
    /// lookup by runtime type
    ///
    /// Of the supplied references with the lookup's type, only the one whose
    /// primary key equals the related entity's foreign key is used. A lookup
    /// with no such reference is omitted.
    pub fn resolve<C: 'static>(
        &self,
        descriptor: &RelatedDescriptor<C>,
        related: &C,
        supplied: &[&dyn Any],
    ) -> Vec<FieldChange> {
        let mut fields = Vec::new();

        for lookup in descriptor.lookups() {
            let candidates: Vec<&dyn Any> = supplied
                .iter()
                .copied()
                .filter(|r| lookup.matches(*r, self.type_resolver()))
                .collect();

            let fk = lookup.foreign_key(related);
            let chosen = candidates.iter().copied().find(|r| keys_match(lookup, *r, &fk));

            match chosen {
                Some(reference) => fields.extend(capture_display(lookup, reference)),
                None if candidates.is_empty() => debug!(
                    related_type = %descriptor.related_type(),
                    reference_type = %lookup.reference_type().name(),
                    "No supplied reference for lookup"
                ),
                None => debug!(
                    related_type = %descriptor.related_type(),
                    reference_type = %lookup.reference_type().name(),
                    key = ?fk.canonical(),
                    supplied = candidates.len(),
                    "No supplied reference matches the foreign key, lookup fields omitted"
                ),
            }
        }

        fields
    }

    /// Pull strategy: find each reference in the cache by primary key, then
    /// fall back to loading it from `source`
    pub async fn resolve_pulled<C: Send + Sync + 'static>(
        &self,
        descriptor: &RelatedDescriptor<C>,
        related: &C,
        cache: &ReferenceCache,
        source: &dyn ReferenceSource,
    ) -> anyhow::Result<Vec<FieldChange>> {
        let mut fields = Vec::new();

        for lookup in descriptor.lookups() {
            let reference_name = lookup.reference_type().name().to_string();
            let Some(type_id) = lookup.runtime_type_id(self.type_resolver()) else {
                warn!(
                    related_type = %descriptor.related_type(),
                    reference_type = %reference_name,
                    "Reference type could not be resolved, lookup fields omitted"
                );
                continue;
            };

            let fk = lookup.foreign_key(related);
            if fk.is_null() {
                continue;
            }

            let cached = cache
                .of_type(type_id)
                .into_iter()
                .find(|r| keys_match(lookup, r.as_ref(), &fk));

            let reference = match cached {
                Some(r) => Some(r),
                None => {
                    let loaded = source.find_by_key(&reference_name, &fk).await?;
                    if let Some(r) = &loaded {
                        if (**r).type_id() == type_id {
                            cache.insert_shared(r.clone());
                        }
                    }
                    loaded
                }
            };

            match reference {
                Some(r) if lookup.matches(r.as_ref(), self.type_resolver()) => {
                    fields.extend(capture_display(lookup, r.as_ref()));
                }
                Some(_) => warn!(
                    related_type = %descriptor.related_type(),
                    reference_type = %reference_name,
                    "Reference source returned an instance of the wrong type, lookup fields omitted"
                ),
                None => warn!(
                    related_type = %descriptor.related_type(),
                    reference_type = %reference_name,
                    key = ?fk.canonical(),
                    "Referenced entity not found, lookup fields omitted"
                ),
            }
        }

        Ok(fields)
    }
}

fn keys_match<C: 'static>(lookup: &LookupDescriptor<C>, reference: &dyn Any, fk: &AuditValue) -> bool {
    match lookup.primary_key(reference) {
        Some(pk) => !pk.is_null() && pk.canonical() == fk.canonical(),
        None => false,
    }
}

fn capture_display<C: 'static>(lookup: &LookupDescriptor<C>, reference: &dyn Any) -> Vec<FieldChange> {
    lookup
        .read_display(reference)
        .map(|(name, value)| FieldChange::captured(name, value.canonical()))
        .collect()
}
