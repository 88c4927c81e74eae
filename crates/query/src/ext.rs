use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

type Slot = Arc<dyn Any + Send + Sync>;

/// Open extension bag that plugins attach their own fields to.
///
/// Keyed by type, so each plugin namespaces its data simply by defining its
/// own type. Starts as a shared empty sentinel and only allocates on the
/// first insert.
///
/// ```
/// use stash_query::Extensions;
///
/// struct RetryCount(u32);
///
/// let mut ext = Extensions::default();
/// assert!(ext.is_empty());
/// ext.insert(RetryCount(2));
/// assert_eq!(ext.get::<RetryCount>().map(|r| r.0), Some(2));
/// ```
#[derive(Clone, Default)]
pub struct Extensions {
    slots: Option<Arc<HashMap<TypeId, Slot>>>,
}

impl Extensions {
    pub fn is_empty(&self) -> bool {
        self.slots.as_ref().is_none_or(|slots| slots.is_empty())
    }

    /// Insert `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<Arc<T>> {
        let slots = Arc::make_mut(self.slots.get_or_insert_with(Default::default));
        slots.insert(TypeId::of::<T>(), Arc::new(value)).and_then(|old| old.downcast::<T>().ok())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.slots.as_ref()?.get(&TypeId::of::<T>())?;
        Arc::clone(slot).downcast::<T>().ok()
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.slots.as_ref().is_some_and(|slots| slots.contains_key(&TypeId::of::<T>()))
    }

    pub fn len(&self) -> usize {
        self.slots.as_ref().map_or(0, |slots| slots.len())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions").field("len", &self.len()).finish()
    }
}
