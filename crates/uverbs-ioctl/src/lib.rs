//! Command specification and attribute validation for the verbs ioctl interface.
//!
//! Definition trees declare objects, their methods and the attributes each method accepts.
//! [`merge`] combines an ordered list of them into an immutable [`SpecTree`], which then parses
//! untrusted attribute records into an [`AttrBundle`] and hands it to the method's handler.

mod bitmap;
mod bundle;
mod def;
mod dispatch;
mod merge;
mod parse;
mod registry;
mod spec;
mod tree;

pub mod errno;
pub mod id;
pub mod wire;

pub use crate::bitmap::AttrBitmap;
pub use crate::bundle::{AccessError, AttrBundle, AttrSlot, ObjAttr, PtrAttr, PtrDirection};
pub use crate::def::{handler, AttrDef, Handler, MethodDef, ObjectDef, ObjectTreeDef};
pub use crate::dispatch::{DispatchError, DispatchOptions, HandlerError, UverbsSession};
pub use crate::id::{driver_id, ID_DRIVER_NS, ID_NS_MASK, ID_NS_SHIFT};
pub use crate::merge::{merge, MergeError};
pub use crate::parse::{parse, ParseError, ParseOptions, ParsedAttrs};
pub use crate::registry::{HandleTable, ObjectHandle, ObjectRegistry, RegistryError};
pub use crate::spec::{
    AccessMode, AttrKind, AttrSpec, AttrSpecFlags, DefinitionError, EnumSpec, MethodFlags,
    ObjectClass, ObjectRefSpec, ObjectType, PtrSpec,
};
pub use crate::tree::{AttrBucket, MethodSpec, ObjectSpec, SpecTree};
pub use crate::wire::{IoctlHeader, UserAttrs, WireAttr, WireAttrFlags, INLINE_DATA_LEN};
