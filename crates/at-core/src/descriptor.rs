//! Audit descriptors
//!
//! Descriptors are built once at configuration time and describe, for one
//! audited type, how to compute its source key and which properties are
//! captured. Accessors are typed closures, so capturing a property never
//! involves reflection or string-keyed field access.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{AuditError, Result};
use crate::value::{AuditValue, ToAuditValue};

pub(crate) type KeyFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
pub(crate) type ValueFn<T> = Arc<dyn Fn(&T) -> AuditValue + Send + Sync>;
pub(crate) type ReferenceValueFn = Arc<dyn Fn(&dyn Any) -> Option<AuditValue> + Send + Sync>;

/// Last path segment of a Rust type name (`my_app::model::Product` -> `Product`)
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ============================================================================
// Property Tables
// ============================================================================

/// Ordered map of captured property name to accessor
pub struct PropertyTable<T> {
    entries: IndexMap<String, ValueFn<T>>,
}

impl<T> PropertyTable<T> {
    pub fn new() -> Self {
        Self { entries: IndexMap::new() }
    }

    fn insert(&mut self, name: String, getter: ValueFn<T>) -> Result<()> {
        if self.entries.contains_key(&name) {
            return Err(AuditError::configuration(format!(
                "property '{}' is captured twice",
                name
            )));
        }
        self.entries.insert(name, getter);
        Ok(())
    }

    /// Read every captured property of `instance`, in declaration order
    pub fn read<'a>(&'a self, instance: &'a T) -> impl Iterator<Item = (&'a str, AuditValue)> + 'a {
        self.entries
            .iter()
            .map(move |(name, getter)| (name.as_str(), getter(instance)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for PropertyTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PropertyTable<T> {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone() }
    }
}

impl<T> fmt::Debug for PropertyTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

// ============================================================================
// Entity Descriptor
// ============================================================================

/// Audit configuration of one top-level entity type
pub struct EntityDescriptor<T> {
    source_type: String,
    key: KeyFn<T>,
    properties: PropertyTable<T>,
}

impl<T: 'static> EntityDescriptor<T> {
    /// Start describing `T`, stored under `source_type`
    pub fn builder<F>(source_type: impl Into<String>, key: F) -> EntityDescriptorBuilder<T>
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        EntityDescriptorBuilder {
            source_type: source_type.into(),
            key: Arc::new(key),
            properties: PropertyTable::new(),
            error: None,
        }
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn source_key(&self, instance: &T) -> String {
        (self.key)(instance)
    }

    pub fn properties(&self) -> &PropertyTable<T> {
        &self.properties
    }
}

impl<T> fmt::Debug for EntityDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("source_type", &self.source_type)
            .field("properties", &self.properties)
            .finish()
    }
}

pub struct EntityDescriptorBuilder<T> {
    source_type: String,
    key: KeyFn<T>,
    properties: PropertyTable<T>,
    error: Option<AuditError>,
}

impl<T: 'static> EntityDescriptorBuilder<T> {
    /// Capture a property under `name`
    pub fn property<V, F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        V: ToAuditValue,
        F: Fn(&T) -> V + Send + Sync + 'static,
    {
        let getter: ValueFn<T> = Arc::new(move |t: &T| getter(t).to_audit_value());
        if let Err(e) = self.properties.insert(name.into(), getter) {
            self.error.get_or_insert(e);
        }
        self
    }

    pub fn build(self) -> Result<EntityDescriptor<T>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        validate_type_name(&self.source_type)?;
        Ok(EntityDescriptor {
            source_type: self.source_type,
            key: self.key,
            properties: self.properties,
        })
    }
}

// ============================================================================
// Related Descriptor
// ============================================================================

/// The entity a related type reports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentRef {
    pub type_id: TypeId,
    pub source_type: String,
}

/// Audit configuration of a child type whose changes are recorded in its
/// parent's document
pub struct RelatedDescriptor<C> {
    related_type: String,
    parent: Option<ParentRef>,
    parent_key: KeyFn<C>,
    properties: PropertyTable<C>,
    lookups: Vec<LookupDescriptor<C>>,
}

impl<C: 'static> RelatedDescriptor<C> {
    /// Start describing `C`; `parent_key` yields the key of the owning entity
    pub fn builder<F>(related_type: impl Into<String>, parent_key: F) -> RelatedDescriptorBuilder<C>
    where
        F: Fn(&C) -> String + Send + Sync + 'static,
    {
        RelatedDescriptorBuilder {
            related_type: related_type.into(),
            parent_key: Arc::new(parent_key),
            properties: PropertyTable::new(),
            lookups: Vec::new(),
            error: None,
        }
    }

    pub fn related_type(&self) -> &str {
        &self.related_type
    }

    /// Parent entity; set when the descriptor is registered
    pub fn parent(&self) -> Option<&ParentRef> {
        self.parent.as_ref()
    }

    pub fn parent_key(&self, instance: &C) -> String {
        (self.parent_key)(instance)
    }

    pub fn properties(&self) -> &PropertyTable<C> {
        &self.properties
    }

    pub fn lookups(&self) -> &[LookupDescriptor<C>] {
        &self.lookups
    }

    /// Whether `name` is the foreign key of a configured lookup
    pub fn is_lookup_key(&self, name: &str) -> bool {
        self.lookups.iter().any(|l| l.foreign_key_name == name)
    }

    pub(crate) fn attach_parent(&mut self, parent: ParentRef) {
        self.parent = Some(parent);
    }
}

impl<C> fmt::Debug for RelatedDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelatedDescriptor")
            .field("related_type", &self.related_type)
            .field("parent", &self.parent)
            .field("properties", &self.properties)
            .field("lookups", &self.lookups)
            .finish()
    }
}

pub struct RelatedDescriptorBuilder<C> {
    related_type: String,
    parent_key: KeyFn<C>,
    properties: PropertyTable<C>,
    lookups: Vec<LookupDescriptor<C>>,
    error: Option<AuditError>,
}

impl<C: 'static> RelatedDescriptorBuilder<C> {
    pub fn property<V, F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        V: ToAuditValue,
        F: Fn(&C) -> V + Send + Sync + 'static,
    {
        let getter: ValueFn<C> = Arc::new(move |c: &C| getter(c).to_audit_value());
        if let Err(e) = self.properties.insert(name.into(), getter) {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Replace a foreign key with display properties of the referenced entity
    pub fn lookup(mut self, lookup: LookupDescriptor<C>) -> Self {
        if self
            .lookups
            .iter()
            .any(|l| l.foreign_key_name == lookup.foreign_key_name)
        {
            self.error.get_or_insert(AuditError::configuration(format!(
                "foreign key '{}' of {} has two lookups",
                lookup.foreign_key_name, self.related_type
            )));
        }
        self.lookups.push(lookup);
        self
    }

    pub fn build(self) -> Result<RelatedDescriptor<C>> {
        if let Some(e) = self.error {
            return Err(e);
        }
        validate_type_name(&self.related_type)?;
        Ok(RelatedDescriptor {
            related_type: self.related_type,
            parent: None,
            parent_key: self.parent_key,
            properties: self.properties,
            lookups: self.lookups,
        })
    }
}

// ============================================================================
// Lookup Descriptor
// ============================================================================

/// Runtime type of a referenced entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceType {
    /// Type known at configuration time
    Declared { type_id: TypeId, name: &'static str },
    /// Type named at configuration time, bound to a concrete type at runtime
    Named(String),
}

impl ReferenceType {
    pub fn name(&self) -> &str {
        match self {
            ReferenceType::Declared { name, .. } => name,
            ReferenceType::Named(name) => name,
        }
    }
}

/// Resolves late-bound reference type names to runtime types
pub trait TypeResolver: Send + Sync {
    fn resolve_type_by_name(&self, name: &str) -> Option<TypeId>;
}

/// How to turn a foreign key on a related entity into readable properties
/// of the referenced entity
pub struct LookupDescriptor<C> {
    reference: ReferenceType,
    foreign_key_name: String,
    foreign_key: ValueFn<C>,
    primary_key: ReferenceValueFn,
    display: Vec<(String, ReferenceValueFn)>,
}

impl<C: 'static> LookupDescriptor<C> {
    /// Look up `R` by `foreign_key` (the related entity's property named
    /// `foreign_key_name`) matched against `primary_key` on `R`
    pub fn builder<R, FK, PK, V1, V2>(
        foreign_key_name: impl Into<String>,
        foreign_key: FK,
        primary_key: PK,
    ) -> LookupDescriptorBuilder<C, R>
    where
        R: Any,
        V1: ToAuditValue,
        V2: ToAuditValue,
        FK: Fn(&C) -> V1 + Send + Sync + 'static,
        PK: Fn(&R) -> V2 + Send + Sync + 'static,
    {
        LookupDescriptorBuilder {
            reference: ReferenceType::Declared {
                type_id: TypeId::of::<R>(),
                name: short_type_name::<R>(),
            },
            foreign_key_name: foreign_key_name.into(),
            foreign_key: Arc::new(move |c: &C| foreign_key(c).to_audit_value()),
            primary_key: erase(primary_key),
            display: Vec::new(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn reference_type(&self) -> &ReferenceType {
        &self.reference
    }

    pub fn foreign_key_name(&self) -> &str {
        &self.foreign_key_name
    }

    pub fn foreign_key(&self, related: &C) -> AuditValue {
        (self.foreign_key)(related)
    }

    /// Primary key of a referenced instance; `None` if it is not of the reference type
    pub fn primary_key(&self, reference: &dyn Any) -> Option<AuditValue> {
        (self.primary_key)(reference)
    }

    /// Display property names, in declaration order
    pub fn display_names(&self) -> impl Iterator<Item = &str> {
        self.display.iter().map(|(name, _)| name.as_str())
    }

    /// Read display properties from a referenced instance
    pub fn read_display<'a>(
        &'a self,
        reference: &'a dyn Any,
    ) -> impl Iterator<Item = (&'a str, AuditValue)> + 'a {
        self.display.iter().map(move |(name, getter)| {
            (name.as_str(), getter(reference).unwrap_or(AuditValue::Null))
        })
    }

    /// Whether `reference` is an instance of this lookup's reference type
    pub fn matches(&self, reference: &dyn Any, resolver: Option<&dyn TypeResolver>) -> bool {
        match self.runtime_type_id(resolver) {
            Some(type_id) => reference.type_id() == type_id,
            None => false,
        }
    }

    /// Runtime type of the reference, resolving late-bound names
    pub fn runtime_type_id(&self, resolver: Option<&dyn TypeResolver>) -> Option<TypeId> {
        match &self.reference {
            ReferenceType::Declared { type_id, .. } => Some(*type_id),
            ReferenceType::Named(name) => resolver.and_then(|r| r.resolve_type_by_name(name)),
        }
    }
}

impl<C> fmt::Debug for LookupDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupDescriptor")
            .field("reference", &self.reference)
            .field("foreign_key", &self.foreign_key_name)
            .field(
                "display",
                &self.display.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub struct LookupDescriptorBuilder<C, R> {
    reference: ReferenceType,
    foreign_key_name: String,
    foreign_key: ValueFn<C>,
    primary_key: ReferenceValueFn,
    display: Vec<(String, ReferenceValueFn)>,
    _marker: std::marker::PhantomData<fn(&R)>,
}

impl<C: 'static, R: Any> LookupDescriptorBuilder<C, R> {
    /// Capture a property of the referenced entity under `name`
    pub fn display<V, F>(mut self, name: impl Into<String>, getter: F) -> Self
    where
        V: ToAuditValue,
        F: Fn(&R) -> V + Send + Sync + 'static,
    {
        self.display.push((name.into(), erase(getter)));
        self
    }

    /// Bind the reference type by name at runtime instead of by `R`
    ///
    /// Accessors still downcast to `R`; the name only decides which cached
    /// or supplied instances are considered.
    pub fn named(mut self, reference_name: impl Into<String>) -> Self {
        self.reference = ReferenceType::Named(reference_name.into());
        self
    }

    pub fn build(self) -> Result<LookupDescriptor<C>> {
        if self.display.is_empty() {
            return Err(AuditError::configuration(format!(
                "lookup on '{}' has no display properties",
                self.foreign_key_name
            )));
        }
        Ok(LookupDescriptor {
            reference: self.reference,
            foreign_key_name: self.foreign_key_name,
            foreign_key: self.foreign_key,
            primary_key: self.primary_key,
            display: self.display,
        })
    }
}

fn erase<R, V, F>(getter: F) -> ReferenceValueFn
where
    R: Any,
    V: ToAuditValue,
    F: Fn(&R) -> V + Send + Sync + 'static,
{
    Arc::new(move |any: &dyn Any| any.downcast_ref::<R>().map(|r| getter(r).to_audit_value()))
}

fn validate_type_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AuditError::configuration("type name must not be empty"));
    }
    if name.chars().count() > at_common::MAX_SOURCE_TYPE_LEN {
        return Err(AuditError::configuration(format!(
            "type name '{}' exceeds {} characters",
            name,
            at_common::MAX_SOURCE_TYPE_LEN
        )));
    }
    Ok(())
}
