//! Runtime type tags and the process-global type registry.
//!
//! Packets are type-erased; endpoints declare what they carry. A tag is the
//! `TypeId` of the payload plus a human name. Registering a type only
//! improves the name used in diagnostics, unregistered types fall back to
//! `std::any::type_name`.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{OnceLock, PoisonError, RwLock};

/// Identity of a payload type at runtime.
///
/// Equality and hashing are by `TypeId` only; the name is carried for
/// error messages and may differ between registration sites.
#[derive(Clone, Copy)]
pub struct TypeTag {
    id: TypeId,
    name: &'static str,
}

impl TypeTag {
    /// Tag for a concrete payload type.
    pub fn of<T: Send + Sync + 'static>() -> TypeTag {
        let id = TypeId::of::<T>();
        TypeTag {
            id,
            name: registered_name(id).unwrap_or_else(std::any::type_name::<T>),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeTag {}

impl std::hash::Hash for TypeTag {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// What a stream endpoint declares about the packets crossing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeclaredType {
    /// The endpoint accepts any packet type.
    Any,
    /// The endpoint accepts exactly this type.
    Tag(TypeTag),
}

impl DeclaredType {
    pub fn of<T: Send + Sync + 'static>() -> DeclaredType {
        DeclaredType::Tag(TypeTag::of::<T>())
    }

    /// Producer/consumer compatibility: exact tag match, or either side Any.
    pub fn compatible_with(&self, other: &DeclaredType) -> bool {
        match (self, other) {
            (DeclaredType::Any, _) | (_, DeclaredType::Any) => true,
            (DeclaredType::Tag(a), DeclaredType::Tag(b)) => a == b,
        }
    }

    /// Whether a concrete payload tag satisfies this declaration.
    pub fn accepts(&self, tag: &TypeTag) -> bool {
        match self {
            DeclaredType::Any => true,
            DeclaredType::Tag(declared) => declared == tag,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeclaredType::Any => "Any",
            DeclaredType::Tag(tag) => tag.name(),
        }
    }
}

impl fmt::Display for DeclaredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn registry() -> &'static RwLock<HashMap<TypeId, &'static str>> {
    static REGISTRY: OnceLock<RwLock<HashMap<TypeId, &'static str>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a friendly name for a payload type.
///
/// Idempotent; the last registration wins. Called from plain init code,
/// typically next to the calculator registrations.
pub fn register_type<T: Send + Sync + 'static>(name: &'static str) {
    let mut map = registry().write().unwrap_or_else(PoisonError::into_inner);
    map.insert(TypeId::of::<T>(), name);
}

pub(crate) fn registered_name(id: TypeId) -> Option<&'static str> {
    let map = registry().read().unwrap_or_else(PoisonError::into_inner);
    map.get(&id).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Frame;

    #[test]
    fn tags_compare_by_type_identity() {
        assert_eq!(TypeTag::of::<u32>(), TypeTag::of::<u32>());
        assert_ne!(TypeTag::of::<u32>(), TypeTag::of::<i64>());
    }

    #[test]
    fn registered_name_wins_over_type_name() {
        register_type::<Frame>("Frame");
        assert_eq!(TypeTag::of::<Frame>().name(), "Frame");
        assert!(TypeTag::of::<u64>().name().contains("u64"));
    }

    #[test]
    fn any_is_compatible_with_everything() {
        let any = DeclaredType::Any;
        let ints = DeclaredType::of::<i64>();
        let text = DeclaredType::of::<String>();
        assert!(any.compatible_with(&ints));
        assert!(ints.compatible_with(&any));
        assert!(ints.compatible_with(&ints));
        assert!(!ints.compatible_with(&text));
    }

    #[test]
    fn accepts_checks_concrete_tag() {
        let ints = DeclaredType::of::<i64>();
        assert!(ints.accepts(&TypeTag::of::<i64>()));
        assert!(!ints.accepts(&TypeTag::of::<u64>()));
        assert!(DeclaredType::Any.accepts(&TypeTag::of::<u64>()));
    }
}
