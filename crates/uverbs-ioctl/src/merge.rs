//! Merging definition trees into a [`SpecTree`].
//!
//! Trees are applied in order; later trees specialise earlier ones:
//! - objects and methods with the same id are merged,
//! - a later non-empty `type_attrs` or handler replaces an earlier one,
//! - the same attribute id declared twice in one method with different specs is a conflict,
//! - an object that ends up with no methods is invalid.
//!
//! There is no way for a later tree to clear a handler or `type_attrs`; it can only replace them.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::def::{Handler, ObjectTreeDef};
use crate::spec::{AttrSpec, DefinitionError, MethodFlags, ObjectType};
use crate::tree::{FlatMethod, FlatObject, SpecTree};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error(
        "conflicting definitions of attribute {attr:#06x} in method {method:#06x} of object {object:#06x}"
    )]
    Conflict { object: u16, method: u16, attr: u16 },

    #[error("object {object:#06x} has no methods")]
    InvalidObject { object: u16 },

    #[error("attribute {attr:#06x} in method {method:#06x} of object {object:#06x}: {source}")]
    InvalidAttribute {
        object: u16,
        method: u16,
        attr: u16,
        #[source]
        source: DefinitionError,
    },
}

impl MergeError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Conflict { .. } | Self::InvalidObject { .. } => -crate::errno::ENOENT,
            Self::InvalidAttribute { .. } => -crate::errno::EINVAL,
        }
    }
}

struct MergedMethod<D, S> {
    flags: MethodFlags,
    handler: Option<Handler<D, S>>,
    attrs: BTreeMap<u16, AttrSpec>,
}

struct MergedObject<D, S> {
    type_attrs: Option<Arc<ObjectType>>,
    methods: BTreeMap<u16, MergedMethod<D, S>>,
}

/// Merges `trees` in order into one spec tree.
///
/// For a fixed input order the result is fully determined; reordering the trees only changes
/// which `type_attrs` and handlers win.
pub fn merge<D, S>(trees: &[&ObjectTreeDef<D, S>]) -> Result<SpecTree<D, S>, MergeError> {
    let mut objects: BTreeMap<u16, MergedObject<D, S>> = BTreeMap::new();

    for (tree_idx, tree) in trees.iter().enumerate() {
        for object_def in &tree.objects {
            let object = objects
                .entry(object_def.id)
                .or_insert_with(|| MergedObject {
                    type_attrs: None,
                    methods: BTreeMap::new(),
                });

            if let Some(type_attrs) = &object_def.type_attrs {
                if object.type_attrs.is_some() {
                    debug!(
                        tree = tree_idx,
                        object = object_def.id,
                        type_name = type_attrs.name,
                        "overriding object type_attrs"
                    );
                }
                object.type_attrs = Some(Arc::clone(type_attrs));
            }

            for method_def in &object_def.methods {
                let method = object
                    .methods
                    .entry(method_def.id)
                    .or_insert_with(|| MergedMethod {
                        flags: MethodFlags::empty(),
                        handler: None,
                        attrs: BTreeMap::new(),
                    });

                method.flags |= method_def.flags;
                if let Some(handler) = &method_def.handler {
                    if method.handler.is_some() {
                        debug!(
                            tree = tree_idx,
                            object = object_def.id,
                            method = method_def.id,
                            "overriding method handler"
                        );
                    }
                    method.handler = Some(Arc::clone(handler));
                }

                for attr_def in &method_def.attrs {
                    attr_def
                        .spec
                        .validate()
                        .map_err(|source| MergeError::InvalidAttribute {
                            object: object_def.id,
                            method: method_def.id,
                            attr: attr_def.id,
                            source,
                        })?;

                    match method.attrs.entry(attr_def.id) {
                        Entry::Vacant(slot) => {
                            slot.insert(attr_def.spec.clone());
                        }
                        Entry::Occupied(existing) => {
                            if *existing.get() != attr_def.spec {
                                return Err(MergeError::Conflict {
                                    object: object_def.id,
                                    method: method_def.id,
                                    attr: attr_def.id,
                                });
                            }
                        }
                    }
                }
            }
        }
    }

    let mut flat = Vec::with_capacity(objects.len());
    let mut num_methods = 0usize;
    let mut num_attrs = 0usize;
    for (id, object) in objects {
        if object.methods.is_empty() {
            return Err(MergeError::InvalidObject { object: id });
        }
        num_methods += object.methods.len();

        let methods = object
            .methods
            .into_iter()
            .map(|(method_id, method)| {
                num_attrs += method.attrs.len();
                FlatMethod {
                    id: method_id,
                    flags: method.flags,
                    handler: method.handler,
                    attrs: method.attrs.into_iter().collect(),
                }
            })
            .collect();

        flat.push(FlatObject {
            id,
            type_attrs: object.type_attrs,
            methods,
        });
    }

    debug!(
        trees = trees.len(),
        objects = flat.len(),
        methods = num_methods,
        attrs = num_attrs,
        "merged spec tree"
    );

    Ok(SpecTree::from_flat(flat))
}

impl<D, S> SpecTree<D, S> {
    /// Shorthand for [`merge`].
    pub fn merge(trees: &[&ObjectTreeDef<D, S>]) -> Result<Self, MergeError> {
        merge(trees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{handler, MethodDef, ObjectDef};
    use crate::spec::{AttrKind, AttrSpecFlags, PtrSpec};

    type Tree = ObjectTreeDef<(), ()>;

    fn noop() -> Handler<(), ()> {
        handler(|_, _, _| Ok(()))
    }

    #[test]
    fn partial_fragments_combine_into_one_method() {
        let base: Tree = ObjectTreeDef::new().object(
            ObjectDef::new(1).method(MethodDef::new(2).attr(0, AttrSpec::ptr_in(8).mandatory())),
        );
        let driver: Tree = ObjectTreeDef::new().object(
            ObjectDef::new(1)
                .type_attrs(ObjectType::idr("pd"))
                .method(MethodDef::new(2).handler(noop()).attr(0x1000, AttrSpec::ptr_out(4))),
        );

        let tree = merge(&[&base, &driver]).unwrap();
        let method = tree.method(1, 2).unwrap();
        assert!(method.handler().is_some());
        assert_eq!(method.num_attrs(), 2);
        assert_eq!(method.attr_buckets().len(), 2);
        assert!(method.attr_buckets()[0].mandatory().test(0));
        assert!(tree.method_attr(method, 0x1000).is_some());
        assert_eq!(tree.type_attrs(1).unwrap().name, "pd");
    }

    #[test]
    fn identical_duplicate_attribute_is_accepted() {
        let a: Tree = ObjectTreeDef::new().object(
            ObjectDef::new(1).method(MethodDef::new(3).attr(7, AttrSpec::ptr_in_sz(4, 8))),
        );
        let b = a.clone();
        assert!(merge(&[&a, &b]).is_ok());
    }

    #[test]
    fn differing_duplicate_attribute_conflicts() {
        let a: Tree = ObjectTreeDef::new().object(
            ObjectDef::new(1).method(MethodDef::new(3).attr(7, AttrSpec::ptr_in_sz(4, 8))),
        );
        let b: Tree = ObjectTreeDef::new().object(
            ObjectDef::new(1).method(MethodDef::new(3).attr(7, AttrSpec::ptr_in_sz(2, 8))),
        );
        assert_eq!(
            merge(&[&a, &b]).unwrap_err(),
            MergeError::Conflict {
                object: 1,
                method: 3,
                attr: 7
            }
        );
    }

    #[test]
    fn object_without_methods_is_invalid() {
        let a: Tree = ObjectTreeDef::new()
            .object(ObjectDef::new(1).method(MethodDef::new(0)))
            .object(ObjectDef::new(2).type_attrs(ObjectType::idr("cq")));
        let err = merge(&[&a]).unwrap_err();
        assert_eq!(err, MergeError::InvalidObject { object: 2 });
        assert_eq!(err.to_errno(), -crate::errno::ENOENT);
    }

    #[test]
    fn literal_spec_violations_fail_the_merge() {
        let bad = AttrSpec {
            flags: AttrSpecFlags::empty(),
            kind: AttrKind::PtrIn(PtrSpec { len: 4, min_len: 8 }),
        };
        let a: Tree =
            ObjectTreeDef::new().object(ObjectDef::new(1).method(MethodDef::new(0).attr(5, bad)));
        let err = merge(&[&a]).unwrap_err();
        assert!(matches!(
            err,
            MergeError::InvalidAttribute {
                object: 1,
                method: 0,
                attr: 5,
                source: DefinitionError::MinLenExceedsLen { .. }
            }
        ));
        assert_eq!(err.to_errno(), -crate::errno::EINVAL);
    }

    #[test]
    fn method_flags_accumulate_across_trees() {
        let a: Tree = ObjectTreeDef::new().object(ObjectDef::new(0).method(MethodDef::new(0)));
        let b: Tree =
            ObjectTreeDef::new().object(ObjectDef::new(0).method(MethodDef::new(0).create_root()));
        let tree = merge(&[&a, &b]).unwrap();
        assert!(tree.method(0, 0).unwrap().creates_root());
    }

    #[test]
    fn empty_input_yields_empty_tree() {
        let tree: SpecTree<(), ()> = merge(&[]).unwrap();
        assert_eq!(tree.num_objects(), 0);
        assert!(tree.method(0, 0).is_none());
    }
}
