//! Registry of audited types
//!
//! Built once at startup and shared read-only afterwards. Descriptors are
//! stored type-erased and recovered by `TypeId`, so the registry can hold
//! descriptors for any number of unrelated entity types.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::descriptor::{short_type_name, EntityDescriptor, ParentRef, RelatedDescriptor};
use crate::error::{AuditError, Result};

type Erased = Arc<dyn Any + Send + Sync>;

/// Immutable set of entity and related descriptors
#[derive(Default)]
pub struct AuditRegistry {
    entities: HashMap<TypeId, Erased>,
    related: HashMap<TypeId, Erased>,
    source_types: HashMap<String, TypeId>,
    related_types: HashMap<String, Vec<String>>,
}

impl AuditRegistry {
    pub fn builder() -> AuditRegistryBuilder {
        AuditRegistryBuilder::default()
    }

    /// Descriptor of an audited entity type
    pub fn entity<T: 'static>(&self) -> Result<&EntityDescriptor<T>> {
        self.entities
            .get(&TypeId::of::<T>())
            .and_then(|d| d.downcast_ref::<EntityDescriptor<T>>())
            .ok_or_else(|| AuditError::UnconfiguredEntity {
                type_name: short_type_name::<T>().to_string(),
            })
    }

    /// Descriptor of a related type
    pub fn related<C: 'static>(&self) -> Result<&RelatedDescriptor<C>> {
        self.related
            .get(&TypeId::of::<C>())
            .and_then(|d| d.downcast_ref::<RelatedDescriptor<C>>())
            .ok_or_else(|| AuditError::UnconfiguredRelated {
                type_name: short_type_name::<C>().to_string(),
            })
    }

    pub fn is_entity<T: 'static>(&self) -> bool {
        self.entities.contains_key(&TypeId::of::<T>())
    }

    pub fn is_related<C: 'static>(&self) -> bool {
        self.related.contains_key(&TypeId::of::<C>())
    }

    /// Whether `source_type` names a configured entity
    pub fn is_configured(&self, source_type: &str) -> bool {
        self.source_types.contains_key(source_type)
    }

    /// Configured source types, sorted
    pub fn source_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.source_types.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Related type names recorded into `source_type`'s documents
    pub fn related_types_of(&self, source_type: &str) -> &[String] {
        self.related_types
            .get(source_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl std::fmt::Debug for AuditRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRegistry")
            .field("source_types", &self.source_types())
            .field("related_types", &self.related_types)
            .finish()
    }
}

/// Builder collecting descriptors; the first error wins
#[derive(Default)]
pub struct AuditRegistryBuilder {
    registry: AuditRegistry,
    parents: HashMap<TypeId, String>,
    error: Option<AuditError>,
}

impl AuditRegistryBuilder {
    /// Register an audited entity type
    pub fn entity<T: Send + Sync + 'static>(mut self, descriptor: EntityDescriptor<T>) -> Self {
        let type_id = TypeId::of::<T>();
        let source_type = descriptor.source_type().to_string();

        if self.registry.entities.contains_key(&type_id) {
            return self.fail(format!("{} is registered twice", short_type_name::<T>()));
        }
        if self.registry.source_types.contains_key(&source_type) {
            return self.fail(format!("source type '{}' is used by two entity types", source_type));
        }

        debug!(source_type = %source_type, properties = descriptor.properties().len(), "Registered audited entity");
        self.parents.insert(type_id, source_type.clone());
        self.registry.source_types.insert(source_type, type_id);
        self.registry.entities.insert(type_id, Arc::new(descriptor));
        self
    }

    /// Register a related type recorded into `P`'s documents
    ///
    /// `P` must already be registered.
    pub fn related<P: 'static, C: Send + Sync + 'static>(
        mut self,
        mut descriptor: RelatedDescriptor<C>,
    ) -> Self {
        let parent_id = TypeId::of::<P>();
        let Some(parent_source_type) = self.parents.get(&parent_id).cloned() else {
            return self.fail(format!(
                "{} is related to {}, which is not registered",
                descriptor.related_type(),
                short_type_name::<P>()
            ));
        };
        if self.registry.related.contains_key(&TypeId::of::<C>()) {
            return self.fail(format!("{} is registered twice", short_type_name::<C>()));
        }

        debug!(
            related_type = %descriptor.related_type(),
            parent = %parent_source_type,
            lookups = descriptor.lookups().len(),
            "Registered related type"
        );
        self.registry
            .related_types
            .entry(parent_source_type.clone())
            .or_default()
            .push(descriptor.related_type().to_string());
        descriptor.attach_parent(ParentRef {
            type_id: parent_id,
            source_type: parent_source_type,
        });
        self.registry.related.insert(TypeId::of::<C>(), Arc::new(descriptor));
        self
    }

    pub fn build(self) -> Result<AuditRegistry> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.registry),
        }
    }

    fn fail(mut self, message: String) -> Self {
        self.error.get_or_insert(AuditError::configuration(message));
        self
    }
}
