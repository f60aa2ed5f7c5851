//! Typed metadata tags over pluggable storage shapes.
//!
//! A [`Tag`] is an explicit handle: every `Tag::new` allocates a fresh
//! [`TagKey`], so two tags with the same label never alias. Values are stored
//! type-erased and recovered through the tag that wrote them.
//!
//! Storage shapes:
//! - [`TagBag`]: keyed map, one value per tag (contexts, scopes).
//! - `[Tagged]` / `Vec<Tagged>`: ordered list, may hold several values per
//!   tag (executor and flow metadata). Only list sources support
//!   [`Tag::collect_from`].

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, WeftError};
use crate::schema::Schema;
use crate::types::{downcast, erase, AnyValue};

static NEXT_TAG_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagKey(u64);

impl TagKey {
    fn next() -> Self {
        Self(NEXT_TAG_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// A value bound to a tag, ready to be attached to an executor, flow or store.
#[derive(Clone)]
pub struct Tagged {
    key: TagKey,
    label: Arc<str>,
    value: AnyValue,
}

impl Tagged {
    pub fn key(&self) -> TagKey {
        self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> &AnyValue {
        &self.value
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tagged")
            .field("key", &self.key)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Anything tags can be read from.
pub trait TagSource {
    /// First value stored under `key`.
    fn lookup(&self, key: TagKey) -> Option<AnyValue>;
}

/// Anything tags can be written to.
pub trait TagSink: TagSource {
    /// Store a value, replacing any existing value for the same tag.
    fn store(&mut self, tagged: Tagged);
}

impl TagSource for [Tagged] {
    fn lookup(&self, key: TagKey) -> Option<AnyValue> {
        self.iter()
            .find(|t| t.key == key)
            .map(|t| t.value.clone())
    }
}

impl TagSource for Vec<Tagged> {
    fn lookup(&self, key: TagKey) -> Option<AnyValue> {
        self.as_slice().lookup(key)
    }
}

impl TagSink for Vec<Tagged> {
    fn store(&mut self, tagged: Tagged) {
        match self.iter_mut().find(|t| t.key == tagged.key) {
            Some(existing) => *existing = tagged,
            None => self.push(tagged),
        }
    }
}

/// Keyed tag store with one value per tag.
#[derive(Clone, Default)]
pub struct TagBag {
    entries: HashMap<TagKey, Tagged>,
}

impl TagBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tagged(tagged: impl IntoIterator<Item = Tagged>) -> Self {
        let mut bag = Self::new();
        for t in tagged {
            bag.store(t);
        }
        bag
    }

    pub fn contains(&self, key: TagKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn remove(&mut self, key: TagKey) -> Option<Tagged> {
        self.entries.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels of every stored tag, sorted.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.entries.values().map(|t| t.label.to_string()).collect();
        labels.sort();
        labels
    }
}

impl TagSource for TagBag {
    fn lookup(&self, key: TagKey) -> Option<AnyValue> {
        self.entries.get(&key).map(|t| t.value.clone())
    }
}

impl TagSink for TagBag {
    fn store(&mut self, tagged: Tagged) {
        self.entries.insert(tagged.key, tagged);
    }
}

impl fmt::Debug for TagBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagBag")
            .field("tags", &self.labels())
            .finish()
    }
}

/// Typed, optionally defaulted accessor.
pub struct Tag<T> {
    key: TagKey,
    label: Arc<str>,
    default: Option<T>,
    schema: Schema<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Tag<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            label: self.label.clone(),
            default: self.default.clone(),
            schema: self.schema.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Tag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("key", &self.key)
            .field("label", &self.label)
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

impl<T> Tag<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            key: TagKey::next(),
            label: Arc::from(label.into()),
            default: None,
            schema: Schema::any(),
            _marker: PhantomData,
        }
    }

    /// Value substituted by `read_from` (and `ExecutionContext::find`) when absent.
    pub fn with_default(mut self, default: T) -> Self {
        self.default = Some(default);
        self
    }

    /// Contract checked on every write.
    pub fn with_schema(mut self, schema: Schema<T>) -> Self {
        self.schema = schema;
        self
    }

    pub fn key(&self) -> TagKey {
        self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn default_value(&self) -> Option<&T> {
        self.default.as_ref()
    }

    /// Bind a value to this tag after validating it.
    pub fn entry(&self, value: T) -> Result<Tagged> {
        self.schema.validate(&format!("tag '{}'", self.label), &value)?;
        Ok(Tagged {
            key: self.key,
            label: self.label.clone(),
            value: erase(value),
        })
    }

    /// Read the value or fail; never substitutes the default.
    pub fn extract_from<S: TagSource + ?Sized>(&self, source: &S) -> Result<T> {
        match source.lookup(self.key) {
            Some(value) => self.decode(value),
            None => Err(WeftError::TagNotFound {
                tag: self.label.to_string(),
            }),
        }
    }

    /// Read the value, falling back to the default; `None` when neither exists.
    pub fn read_from<S: TagSource + ?Sized>(&self, source: &S) -> Option<T> {
        match source.lookup(self.key) {
            Some(value) => self.decode(value).ok(),
            None => self.default.clone(),
        }
    }

    /// Read without default substitution.
    pub fn lookup_in<S: TagSource + ?Sized>(&self, source: &S) -> Option<T> {
        source.lookup(self.key).and_then(|v| self.decode(v).ok())
    }

    /// Every value for this tag, in list order.
    pub fn collect_from(&self, source: &[Tagged]) -> Vec<T> {
        source
            .iter()
            .filter(|t| t.key == self.key)
            .filter_map(|t| self.decode(t.value.clone()).ok())
            .collect()
    }

    /// Validate and write.
    pub fn inject_to<S: TagSink + ?Sized>(&self, sink: &mut S, value: T) -> Result<()> {
        let tagged = self.entry(value)?;
        sink.store(tagged);
        Ok(())
    }

    fn decode(&self, value: AnyValue) -> Result<T> {
        downcast::<T>(value, &self.label).map(|v| (*v).clone())
    }
}
