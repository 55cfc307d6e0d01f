//! Definition trees: the author-facing form of objects, methods and attributes.
//!
//! A definition tree is plain data. Several trees (the common definitions plus any number of
//! driver-specific ones) are combined by [`crate::merge`] into one [`crate::SpecTree`]. A tree
//! may declare only part of an object or method; the pieces are filled in by the other trees.

use std::fmt;
use std::sync::Arc;

use crate::bundle::AttrBundle;
use crate::dispatch::HandlerError;
use crate::spec::{AttrSpec, MethodFlags, ObjectType};

/// Method implementation, invoked with a fully validated bundle.
///
/// `D` is the device the request targets and `S` the per-file session it arrived on.
pub type Handler<D, S> =
    Arc<dyn Fn(&D, &mut S, &AttrBundle) -> Result<(), HandlerError> + Send + Sync>;

/// Wraps a closure or function in a [`Handler`].
pub fn handler<D, S, F>(f: F) -> Handler<D, S>
where
    F: Fn(&D, &mut S, &AttrBundle) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDef {
    pub id: u16,
    pub spec: AttrSpec,
}

impl AttrDef {
    pub const fn new(id: u16, spec: AttrSpec) -> Self {
        Self { id, spec }
    }
}

pub struct MethodDef<D, S> {
    pub id: u16,
    pub flags: MethodFlags,
    pub handler: Option<Handler<D, S>>,
    pub attrs: Vec<AttrDef>,
}

impl<D, S> MethodDef<D, S> {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            flags: MethodFlags::empty(),
            handler: None,
            attrs: Vec::new(),
        }
    }

    pub fn handler(mut self, handler: Handler<D, S>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Marks the method as the one that creates the root context.
    pub fn create_root(self) -> Self {
        self.flags(MethodFlags::CREATE_ROOT)
    }

    pub fn attr(mut self, id: u16, spec: AttrSpec) -> Self {
        self.attrs.push(AttrDef::new(id, spec));
        self
    }
}

impl<D, S> Clone for MethodDef<D, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            flags: self.flags,
            handler: self.handler.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

impl<D, S> fmt::Debug for MethodDef<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("id", &format_args!("{:#06x}", self.id))
            .field("flags", &self.flags)
            .field("handler", &self.handler.is_some())
            .field("attrs", &self.attrs)
            .finish()
    }
}

pub struct ObjectDef<D, S> {
    pub id: u16,
    pub type_attrs: Option<Arc<ObjectType>>,
    pub methods: Vec<MethodDef<D, S>>,
}

impl<D, S> ObjectDef<D, S> {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            type_attrs: None,
            methods: Vec::new(),
        }
    }

    pub fn type_attrs(mut self, type_attrs: ObjectType) -> Self {
        self.type_attrs = Some(Arc::new(type_attrs));
        self
    }

    pub fn method(mut self, method: MethodDef<D, S>) -> Self {
        self.methods.push(method);
        self
    }
}

impl<D, S> Clone for ObjectDef<D, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            type_attrs: self.type_attrs.clone(),
            methods: self.methods.clone(),
        }
    }
}

impl<D, S> fmt::Debug for ObjectDef<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDef")
            .field("id", &format_args!("{:#06x}", self.id))
            .field("type_attrs", &self.type_attrs)
            .field("methods", &self.methods)
            .finish()
    }
}

/// One definition source: the common verbs, or a driver's additions and overrides.
pub struct ObjectTreeDef<D, S> {
    pub objects: Vec<ObjectDef<D, S>>,
}

impl<D, S> ObjectTreeDef<D, S> {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    pub fn object(mut self, object: ObjectDef<D, S>) -> Self {
        self.objects.push(object);
        self
    }
}

impl<D, S> Default for ObjectTreeDef<D, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, S> Clone for ObjectTreeDef<D, S> {
    fn clone(&self) -> Self {
        Self {
            objects: self.objects.clone(),
        }
    }
}

impl<D, S> fmt::Debug for ObjectTreeDef<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTreeDef")
            .field("objects", &self.objects)
            .finish()
    }
}
