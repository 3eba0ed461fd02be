use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A type-erased, reference-counted value.
///
/// Used for state `data` entries, prerequisite results and accumulator
/// entries. Clone is cheap: an atomic increment, never a data copy.
#[derive(Clone)]
pub struct StateValue {
    inner: Arc<dyn Any + Send + Sync>,
}

impl StateValue {
    /// Wrap any `Send + Sync` value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    /// Try to downcast to a concrete type reference.
    ///
    /// Returns `None` if the stored type doesn't match `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Check if the stored value is of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// `TypeId` of the stored value.
    pub fn type_id(&self) -> TypeId {
        (*self.inner).type_id()
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateValue")
            .field("type_id", &(*self.inner).type_id())
            .finish()
    }
}

/// Handle for an event subscription, returned by `Router::on()`.
///
/// Pass it to `Router::off()` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// Scratch map threaded through the enter/update steps of one transition.
///
/// Parents write derived values, descendants read them. A fresh, empty
/// accumulator is used when the caller does not supply one.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    entries: HashMap<String, StateValue>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a typed value, replacing any previous value under `key`.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.entries.insert(key.to_string(), StateValue::new(value));
    }

    /// Typed read. `None` if missing or of another type.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.entries.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_value(&self, key: &str) -> Option<&StateValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
