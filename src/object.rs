//! Shared-ownership object handles.
//!
//! Every runtime entity (data sources, GAMs, states, schedulers, containers)
//! implements `Object` and is held through a `Reference`. The object is
//! dropped exactly once, when the last handle goes away.

use crate::container::ReferenceContainer;
use crate::datasource::DataSource;
use crate::scheduler::GamScheduler;
use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Upcast helper so trait objects can be downcast to their concrete type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Polymorphic runtime object.
///
/// The capability accessors replace dynamic casts: an object that is a
/// container, a data source or a scheduler says so by overriding the
/// matching method.
pub trait Object: AsAny {
    fn name(&self) -> &str;

    fn class_name(&self) -> &'static str;

    fn as_container(&self) -> Option<&ReferenceContainer> {
        None
    }

    fn into_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        None
    }

    fn into_scheduler(self: Arc<Self>) -> Option<Arc<dyn GamScheduler>> {
        None
    }
}

/// Shared handle to any `Object`. The default value is invalid.
#[derive(Clone, Default)]
pub struct Reference {
    inner: Option<Arc<dyn Object>>,
}

impl Reference {
    pub fn new<T: Object>(object: T) -> Self {
        Self {
            inner: Some(Arc::new(object)),
        }
    }

    pub fn from_arc(object: Arc<dyn Object>) -> Self {
        Self { inner: Some(object) }
    }

    pub fn is_valid(&self) -> bool {
        self.inner.is_some()
    }

    pub fn get(&self) -> Option<&dyn Object> {
        self.inner.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.get().map(|o| o.name())
    }

    pub fn class_name(&self) -> Option<&'static str> {
        self.get().map(|o| o.class_name())
    }

    /// Live handles to the object, 0 when invalid.
    pub fn number_of_references(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Release this handle, leaving it invalid.
    pub fn remove_reference(&mut self) {
        self.inner = None;
    }

    /// Identity comparison. Two invalid references are equal.
    pub fn ptr_eq(&self, other: &Reference) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
            (None, None) => true,
            _ => false,
        }
    }

    /// Address of the referenced object, used as an identity key.
    pub(crate) fn address(&self) -> Option<usize> {
        self.inner
            .as_ref()
            .map(|a| Arc::as_ptr(a) as *const () as usize)
    }

    pub fn as_container(&self) -> Option<&ReferenceContainer> {
        self.get().and_then(|o| o.as_container())
    }

    pub fn is_container(&self) -> bool {
        self.as_container().is_some()
    }

    pub fn downcast<T: Object>(&self) -> Option<ReferenceT<T>> {
        let any = Arc::clone(self.inner.as_ref()?).into_any_arc();
        any.downcast::<T>().ok().map(|inner| ReferenceT { inner })
    }

    pub fn data_source(&self) -> Option<Arc<dyn DataSource>> {
        Arc::clone(self.inner.as_ref()?).into_data_source()
    }

    pub fn scheduler(&self) -> Option<Arc<dyn GamScheduler>> {
        Arc::clone(self.inner.as_ref()?).into_scheduler()
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(o) => write!(f, "Reference({}: {})", o.name(), o.class_name()),
            None => f.write_str("Reference(invalid)"),
        }
    }
}

/// Typed handle. Always valid; use `Option<ReferenceT<T>>` for "maybe".
pub struct ReferenceT<T: Object> {
    inner: Arc<T>,
}

impl<T: Object> ReferenceT<T> {
    pub fn new(object: T) -> Self {
        Self {
            inner: Arc::new(object),
        }
    }

    pub fn number_of_references(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &ReferenceT<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn arc(&self) -> &Arc<T> {
        &self.inner
    }

    /// Untyped handle to the same object.
    pub fn to_reference(&self) -> Reference {
        Reference::from_arc(Arc::clone(&self.inner) as Arc<dyn Object>)
    }
}

impl<T: Object> Clone for ReferenceT<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Object> Deref for ReferenceT<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Object> From<ReferenceT<T>> for Reference {
    fn from(r: ReferenceT<T>) -> Self {
        Reference::from_arc(r.inner)
    }
}

impl<T: Object> fmt::Debug for ReferenceT<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceT({}: {})", self.inner.name(), self.inner.class_name())
    }
}
