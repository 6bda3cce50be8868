//! Typed cache keys and the lookups built from them.

use std::any::{TypeId, type_name};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// A strongly-typed cache category.
///
/// The value type `T` is part of the key identity, so two keys with the same name but a different
/// value type never share cache slots.
///
/// Creating a key is cheap but not free, so keys are meant to be created once and reused:
///
/// ```
/// use std::sync::LazyLock;
/// use callonce::Key;
///
/// static USER: LazyLock<Key<String>> = LazyLock::new(|| Key::new("user"));
/// ```
pub struct Key<T> {
    name: Cow<'static, str>,
    type_id: TypeId,
    type_name: &'static str,
    _value: PhantomData<fn() -> T>,
}

impl<T: 'static> Key<T> {
    /// Creates a new key for values of type `T`.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            _value: PhantomData,
        }
    }
}

impl<T> Key<T> {
    /// The human readable name of this key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a [`Lookup`] for the given `identifier` within this key.
    pub fn lookup<'a>(&'a self, identifier: impl Into<Cow<'a, str>>) -> Lookup<'a, T> {
        Lookup {
            key: self,
            identifier: identifier.into(),
        }
    }
}

// The manual impls below avoid the `T: Trait` bounds a derive would add.

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            type_id: self.type_id,
            type_name: self.type_name,
            _value: PhantomData,
        }
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.name == other.name
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.type_id.hash(state);
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("type", &self.type_name)
            .finish()
    }
}

/// A concrete cache slot: a [`Key`] together with an instance identifier.
pub struct Lookup<'a, T> {
    key: &'a Key<T>,
    identifier: Cow<'a, str>,
}

/// Creates a [`Lookup`] pairing `key` with `identifier`.
///
/// This is a shorthand for [`Key::lookup`].
pub fn lookup<'a, T>(key: &'a Key<T>, identifier: impl Into<Cow<'a, str>>) -> Lookup<'a, T> {
    key.lookup(identifier)
}

impl<'a, T> Lookup<'a, T> {
    /// The key of this lookup.
    pub fn key(&self) -> &'a Key<T> {
        self.key
    }

    /// The instance identifier of this lookup.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// The address of this lookup in the cache store.
    pub(crate) fn full_key(&self) -> FullKey {
        FullKey {
            name: self.key.name.clone(),
            type_id: self.key.type_id,
            type_name: self.key.type_name,
            identifier: self.identifier.clone().into_owned(),
        }
    }
}

impl<T> Clone for Lookup<'_, T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            identifier: self.identifier.clone(),
        }
    }
}

impl<T> fmt::Debug for Lookup<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookup")
            .field("key", &self.key.name)
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// The owned, type-tagged address of one slot in the cache store.
///
/// Two lookups address the same slot iff their key names, value types and identifiers match.
#[derive(Clone)]
pub(crate) struct FullKey {
    name: Cow<'static, str>,
    type_id: TypeId,
    type_name: &'static str,
    identifier: String,
}

impl PartialEq for FullKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
            && self.name == other.name
            && self.identifier == other.identifier
    }
}

impl Eq for FullKey {}

impl Hash for FullKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.type_id.hash(state);
        self.identifier.hash(state);
    }
}

impl fmt::Display for FullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.type_name, self.name, self.identifier)
    }
}

impl fmt::Debug for FullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
