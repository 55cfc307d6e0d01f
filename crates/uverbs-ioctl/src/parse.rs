//! Validation of wire attributes against one method's spec.

use std::fmt;
use std::ops::Deref;

use thiserror::Error;
use tracing::debug;
use uverbs_memory::UserMemoryError;

use crate::bundle::{AttrBundle, AttrSlot, ObjAttr, PtrAttr, PtrDirection};
use crate::errno;
use crate::registry::{ObjectRegistry, RegistryError};
use crate::spec::{AttrKind, AttrSpec, AttrSpecFlags, ObjectClass, ObjectRefSpec, PtrSpec};
use crate::tree::{MethodSpec, SpecTree};
use crate::wire::{UserAttrs, WireAttr};

/// Limits applied while parsing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    /// Requests with more attribute records than this are rejected before any is examined.
    pub max_attrs: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { max_attrs: 128 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown method {method:#06x} of object {object:#06x}")]
    UnknownMethod { object: u16, method: u16 },

    #[error("attribute {id:#06x} is not accepted by this method")]
    UnknownAttribute { id: u16 },

    #[error("attribute {id:#06x} has invalid length {len}")]
    SizeViolation { id: u16, len: u16 },

    #[error("attribute {id:#06x} does not name a usable object")]
    BadHandle {
        id: u16,
        #[source]
        source: Option<RegistryError>,
    },

    #[error("mandatory attribute {id:#06x} is missing")]
    MissingMandatory { id: u16 },

    #[error(transparent)]
    Fault(#[from] UserMemoryError),

    #[error("attribute {id:#06x} selects candidate {selected} of {count}")]
    EnumSelectionOutOfRange { id: u16, selected: u8, count: usize },

    #[error("attribute {id:#06x} appears more than once")]
    DuplicateAttribute { id: u16 },

    #[error("attribute {id:#06x} has non-zero reserved fields")]
    ReservedNonZero { id: u16 },

    #[error("{count} attributes exceed the limit of {max}")]
    TooManyAttributes { count: usize, max: usize },
}

impl ParseError {
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::UnknownMethod { .. } | Self::UnknownAttribute { .. } => {
                -errno::EPROTONOSUPPORT
            }
            Self::Fault(_) => -errno::EFAULT,
            Self::BadHandle {
                source: Some(RegistryError::Busy),
                ..
            } => -errno::EBUSY,
            Self::BadHandle {
                source: Some(RegistryError::Exhausted),
                ..
            } => -errno::ENOSPC,
            Self::BadHandle {
                source: Some(RegistryError::NotFound),
                ..
            } => -errno::ENOENT,
            Self::BadHandle { .. }
            | Self::SizeViolation { .. }
            | Self::MissingMandatory { .. }
            | Self::EnumSelectionOutOfRange { .. }
            | Self::DuplicateAttribute { .. }
            | Self::ReservedNonZero { .. }
            | Self::TooManyAttributes { .. } => -errno::EINVAL,
        }
    }

    fn bad_handle(id: u16) -> Self {
        Self::BadHandle { id, source: None }
    }
}

/// Parses the records of a request for `object_id`/`method_id`.
///
/// `objects` is the registry of the session's root context; without one, any object attribute
/// fails with [`ParseError::BadHandle`]. Parsing is atomic: on error every object resolved so far
/// is aborted and nothing is returned. On success the registry stays borrowed by the returned
/// [`ParsedAttrs`] until it is committed or dropped.
pub fn parse<'r, D, S>(
    tree: &SpecTree<D, S>,
    object_id: u16,
    method_id: u16,
    attrs: &UserAttrs,
    mut objects: Option<&'r mut (dyn ObjectRegistry + 'r)>,
    options: &ParseOptions,
) -> Result<ParsedAttrs<'r>, ParseError> {
    let bundle = parse_bundle(
        tree,
        object_id,
        method_id,
        attrs,
        objects.as_deref_mut(),
        options,
    )?;
    Ok(ParsedAttrs { bundle, objects })
}

/// Validated attributes together with the registry holding the objects they resolved.
///
/// Dereferences to the [`AttrBundle`]. Dropping it aborts every resolved object, the same as
/// [`ParsedAttrs::abort`]; only [`ParsedAttrs::commit`] keeps their effects.
#[must_use = "dropping parsed attributes aborts the objects they resolved"]
pub struct ParsedAttrs<'r> {
    bundle: AttrBundle,
    objects: Option<&'r mut (dyn ObjectRegistry + 'r)>,
}

impl ParsedAttrs<'_> {
    /// Publishes created objects, removes destroyed ones and releases every other hold.
    pub fn commit(mut self) {
        let bundle = std::mem::take(&mut self.bundle);
        if let Some(objects) = self.objects.as_deref_mut() {
            bundle.commit(objects);
        }
    }

    /// Discards created objects and releases every hold.
    pub fn abort(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let bundle = std::mem::take(&mut self.bundle);
        if let Some(objects) = self.objects.as_deref_mut() {
            bundle.abort(objects);
        }
    }
}

impl Deref for ParsedAttrs<'_> {
    type Target = AttrBundle;

    fn deref(&self) -> &AttrBundle {
        &self.bundle
    }
}

impl Drop for ParsedAttrs<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ParsedAttrs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedAttrs")
            .field("bundle", &self.bundle)
            .field("registry", &self.objects.is_some())
            .finish()
    }
}

/// [`parse`] without the guard, for callers that finish the bundle themselves.
pub(crate) fn parse_bundle<'r, D, S>(
    tree: &SpecTree<D, S>,
    object_id: u16,
    method_id: u16,
    attrs: &UserAttrs,
    mut objects: Option<&mut (dyn ObjectRegistry + 'r)>,
    options: &ParseOptions,
) -> Result<AttrBundle, ParseError> {
    if attrs.len() > options.max_attrs {
        return Err(ParseError::TooManyAttributes {
            count: attrs.len(),
            max: options.max_attrs,
        });
    }
    let method = tree
        .method(object_id, method_id)
        .ok_or(ParseError::UnknownMethod {
            object: object_id,
            method: method_id,
        })?;

    let mut bundle = AttrBundle::new(method.attr_buckets());
    match fill_bundle(tree, method, attrs, objects.as_deref_mut(), &mut bundle) {
        Ok(()) => Ok(bundle),
        Err(err) => {
            debug!(
                object = object_id,
                method = method_id,
                error = %err,
                "rejecting request attributes"
            );
            if let Some(objects) = objects {
                bundle.abort(objects);
            }
            Err(err)
        }
    }
}

fn fill_bundle<'r, D, S>(
    tree: &SpecTree<D, S>,
    method: &MethodSpec<D, S>,
    attrs: &UserAttrs,
    mut objects: Option<&mut (dyn ObjectRegistry + 'r)>,
    bundle: &mut AttrBundle,
) -> Result<(), ParseError> {
    for (uattr_addr, record) in attrs.iter() {
        let id = record.attr_id;
        let spec = tree
            .method_attr(method, id)
            .ok_or(ParseError::UnknownAttribute { id })?;
        if bundle.is_present(id) {
            return Err(ParseError::DuplicateAttribute { id });
        }

        let slot = match &spec.kind {
            AttrKind::PtrIn(ptr) => {
                AttrSlot::Ptr(parse_ptr(record, uattr_addr, spec, *ptr, PtrDirection::In, None)?)
            }
            AttrKind::PtrOut(ptr) => {
                AttrSlot::Ptr(parse_ptr(record, uattr_addr, spec, *ptr, PtrDirection::Out, None)?)
            }
            AttrKind::EnumIn(candidates) => {
                if record.reserved != 0 {
                    return Err(ParseError::ReservedNonZero { id });
                }
                let selected = record.elem_id;
                let candidate = candidates.ids.get(usize::from(selected)).ok_or(
                    ParseError::EnumSelectionOutOfRange {
                        id,
                        selected,
                        count: candidates.ids.len(),
                    },
                )?;
                let AttrKind::PtrIn(ptr) = &candidate.kind else {
                    return Err(ParseError::UnknownAttribute { id });
                };
                AttrSlot::Ptr(parse_ptr(
                    record,
                    uattr_addr,
                    candidate,
                    *ptr,
                    PtrDirection::In,
                    Some(selected),
                )?)
            }
            AttrKind::Idr(obj) => AttrSlot::Obj(resolve_obj(
                tree,
                record,
                uattr_addr,
                *obj,
                ObjectClass::Idr,
                objects.as_deref_mut(),
            )?),
            AttrKind::Fd(obj) => AttrSlot::Obj(resolve_obj(
                tree,
                record,
                uattr_addr,
                *obj,
                ObjectClass::Fd,
                objects.as_deref_mut(),
            )?),
        };

        bundle.insert(id, slot);
    }

    match bundle.first_missing(method.attr_buckets()) {
        Some(id) => Err(ParseError::MissingMandatory { id }),
        None => Ok(()),
    }
}

fn parse_ptr(
    record: &WireAttr,
    uattr_addr: u64,
    spec: &AttrSpec,
    ptr: PtrSpec,
    direction: PtrDirection,
    enum_id: Option<u8>,
) -> Result<PtrAttr, ParseError> {
    let id = record.attr_id;
    if record.reserved != 0 || (enum_id.is_none() && record.elem_id != 0) {
        return Err(ParseError::ReservedNonZero { id });
    }

    let len = record.len;
    if len < ptr.min_len {
        return Err(ParseError::SizeViolation { id, len });
    }
    // Excess bytes of a MIN_SZ_OR_ZERO attribute are checked for zero when they are consumed.
    if len > ptr.len && !spec.flags.contains(AttrSpecFlags::MIN_SZ_OR_ZERO) {
        return Err(ParseError::SizeViolation { id, len });
    }

    Ok(PtrAttr {
        data: record.data,
        len,
        wire_flags: record.wire_flags(),
        enum_id,
        direction,
        spec: ptr,
        spec_flags: spec.flags,
        uattr_addr,
    })
}

fn resolve_obj<'r, D, S>(
    tree: &SpecTree<D, S>,
    record: &WireAttr,
    uattr_addr: u64,
    obj: ObjectRefSpec,
    class: ObjectClass,
    objects: Option<&mut (dyn ObjectRegistry + 'r)>,
) -> Result<ObjAttr, ParseError> {
    let id = record.attr_id;
    if record.reserved != 0 || record.elem_id != 0 {
        return Err(ParseError::ReservedNonZero { id });
    }
    if record.len != 0 || record.data > i32::MAX as u64 {
        return Err(ParseError::bad_handle(id));
    }

    let type_attrs = tree
        .type_attrs(obj.obj_type)
        .filter(|ty| ty.class == class)
        .ok_or(ParseError::bad_handle(id))?;
    let objects = objects.ok_or(ParseError::bad_handle(id))?;

    let handle = objects
        .resolve(obj.obj_type, type_attrs, record.data as u32, obj.access)
        .map_err(|source| ParseError::BadHandle {
            id,
            source: Some(source),
        })?;

    Ok(ObjAttr {
        access: obj.access,
        handle,
        uattr_addr,
    })
}

impl<D, S> SpecTree<D, S> {
    /// Shorthand for [`parse`].
    pub fn parse<'r>(
        &self,
        object_id: u16,
        method_id: u16,
        attrs: &UserAttrs,
        objects: Option<&'r mut (dyn ObjectRegistry + 'r)>,
        options: &ParseOptions,
    ) -> Result<ParsedAttrs<'r>, ParseError> {
        parse(self, object_id, method_id, attrs, objects, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::def::{MethodDef, ObjectDef, ObjectTreeDef};
    use crate::registry::HandleTable;
    use crate::spec::{AccessMode, ObjectType};
    use crate::wire::WireAttrFlags;
    use uverbs_memory::{DenseUserMemory, MappedUserMemory, UserMemory, UserMemoryResult};

    const OBJ: u16 = 1;
    const METH: u16 = 0;
    const PD: u16 = 2;
    const CQ: u16 = 3;
    const BASE: u64 = 0x1000;

    fn tree() -> SpecTree<(), ()> {
        let defs = ObjectTreeDef::new()
            .object(
                ObjectDef::new(OBJ).method(
                    MethodDef::new(METH)
                        .attr(0, AttrSpec::ptr_in(4).mandatory())
                        .attr(1, AttrSpec::ptr_out(8))
                        .attr(2, AttrSpec::idr(PD, AccessMode::Read))
                        .attr(3, AttrSpec::idr(PD, AccessMode::Write))
                        .attr(4, AttrSpec::fd(CQ, AccessMode::Read))
                        .attr(5, AttrSpec::fd(CQ, AccessMode::Create))
                        .attr(6, AttrSpec::idr(CQ, AccessMode::Read))
                        .attr(7, AttrSpec::idr(PD, AccessMode::Create)),
                ),
            )
            .object(
                ObjectDef::new(PD)
                    .type_attrs(ObjectType::idr("pd"))
                    .method(MethodDef::new(0)),
            )
            .object(
                ObjectDef::new(CQ)
                    .type_attrs(ObjectType::fd("cq"))
                    .method(MethodDef::new(0)),
            );
        SpecTree::merge(&[&defs]).unwrap()
    }

    fn attrs(records: Vec<WireAttr>) -> UserAttrs {
        UserAttrs::from_records(records, BASE)
    }

    /// Address of the `data` field of record `idx`.
    fn data_addr(idx: u64) -> u64 {
        BASE + idx * WireAttr::SIZE_BYTES as u64 + WireAttr::DATA_OFFSET
    }

    /// Reads succeed everywhere in `inner`; writes to `refuse` fault.
    struct ReadOnlyWord {
        inner: DenseUserMemory,
        refuse: u64,
    }

    impl UserMemory for ReadOnlyWord {
        fn read_into(&self, addr: u64, dst: &mut [u8]) -> UserMemoryResult<()> {
            self.inner.read_into(addr, dst)
        }

        fn write_from(&mut self, addr: u64, src: &[u8]) -> UserMemoryResult<()> {
            if addr == self.refuse {
                return Err(UserMemoryError::Fault {
                    addr,
                    len: src.len(),
                });
            }
            self.inner.write_from(addr, src)
        }
    }

    #[test]
    fn valid_request_fills_the_bundle() {
        let tree = tree();
        let bundle = tree
            .parse(
                OBJ,
                METH,
                &attrs(vec![
                    WireAttr::inline(0, &[1, 2, 3, 4]).with_flags(WireAttrFlags::MANDATORY),
                    WireAttr::pointer(1, 0x2000, 8),
                ]),
                None,
                &ParseOptions::default(),
            )
            .unwrap();

        assert!(bundle.is_present(0));
        assert!(bundle.is_present(1));
        assert!(!bundle.is_present(2));
        assert_eq!(bundle.ptr_len(1).unwrap(), 8);
    }

    #[test]
    fn duplicates_and_reserved_bits_are_rejected() {
        let tree = tree();
        let opts = ParseOptions::default();

        let dup = attrs(vec![
            WireAttr::inline(0, &[0; 4]),
            WireAttr::inline(0, &[0; 4]),
        ]);
        assert_eq!(
            tree.parse(OBJ, METH, &dup, None, &opts).unwrap_err(),
            ParseError::DuplicateAttribute { id: 0 }
        );

        let reserved = attrs(vec![WireAttr::inline(0, &[0; 4]).with_elem_id(1)]);
        assert_eq!(
            tree.parse(OBJ, METH, &reserved, None, &opts).unwrap_err(),
            ParseError::ReservedNonZero { id: 0 }
        );
    }

    #[test]
    fn too_many_records_fail_before_lookup() {
        let tree = tree();
        let opts = ParseOptions { max_attrs: 1 };
        let records = attrs(vec![WireAttr::inline(0, &[0; 4]); 2]);
        assert_eq!(
            tree.parse(0x7ff, 0x7ff, &records, None, &opts).unwrap_err(),
            ParseError::TooManyAttributes { count: 2, max: 1 }
        );
    }

    #[test]
    fn object_attributes_need_a_registry() {
        let tree = tree();
        let opts = ParseOptions::default();
        let records = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(2, 0)]);

        assert_eq!(
            tree.parse(OBJ, METH, &records, None, &opts).unwrap_err(),
            ParseError::BadHandle { id: 2, source: None }
        );

        let mut table = HandleTable::new();
        let err = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap_err();
        assert_eq!(
            err,
            ParseError::BadHandle {
                id: 2,
                source: Some(RegistryError::NotFound)
            }
        );
        assert_eq!(err.to_errno(), -errno::ENOENT);
    }

    #[test]
    fn failed_parse_releases_resolved_objects() {
        let tree = tree();
        let mut table = HandleTable::new();
        let pd = table.insert(ObjectClass::Idr, PD).unwrap();

        // Attribute 0 is mandatory and missing, so the read hold on the pd must be dropped.
        let records = attrs(vec![WireAttr::object(2, pd.id)]);
        let err = tree
            .parse(OBJ, METH, &records, Some(&mut table), &ParseOptions::default())
            .unwrap_err();
        assert_eq!(err, ParseError::MissingMandatory { id: 0 });
        assert_eq!(table.use_count(ObjectClass::Idr, pd.id), Some(0));
    }

    #[test]
    fn object_records_must_carry_a_bare_id() {
        let tree = tree();
        let mut table = HandleTable::new();
        let opts = ParseOptions::default();

        let mut sized = WireAttr::object(2, 0);
        sized.len = 4;
        let too_big = WireAttr::pointer(2, u64::from(u32::MAX), 0);
        for bad in [sized, too_big] {
            let records = attrs(vec![WireAttr::inline(0, &[0; 4]), bad]);
            assert!(matches!(
                tree.parse(OBJ, METH, &records, Some(&mut table), &opts),
                Err(ParseError::BadHandle { id: 2, .. })
            ));
        }
    }

    #[test]
    fn dropped_attributes_release_their_holds() {
        let tree = tree();
        let mut table = HandleTable::new();
        let pd = table.insert(ObjectClass::Idr, PD).unwrap();
        let opts = ParseOptions::default();
        let records = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(3, pd.id)]);

        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap();
        assert_eq!(parsed.get_resource(3).unwrap(), pd);
        drop(parsed);
        assert_eq!(table.use_count(ObjectClass::Idr, pd.id), Some(0));

        // The exclusive hold can be taken again.
        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap();
        parsed.commit();
        assert_eq!(table.use_count(ObjectClass::Idr, pd.id), Some(0));

        // A dropped create leaves nothing behind; a committed one is published.
        let create = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(7, 0)]);
        drop(
            tree.parse(OBJ, METH, &create, Some(&mut table), &opts)
                .unwrap(),
        );
        assert_eq!(table.len(), 1);
        let parsed = tree
            .parse(OBJ, METH, &create, Some(&mut table), &opts)
            .unwrap();
        let created = parsed.get_resource(7).unwrap();
        parsed.commit();
        assert!(table.contains(ObjectClass::Idr, created.id));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn fd_attributes_resolve_in_the_fd_class() {
        let tree = tree();
        let mut table = HandleTable::new();
        let cq = table.insert(ObjectClass::Fd, CQ).unwrap();
        let opts = ParseOptions::default();

        let records = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(4, cq.id)]);
        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap();
        assert_eq!(parsed.get_resource(4).unwrap(), cq);
        parsed.abort();
        assert_eq!(table.use_count(ObjectClass::Fd, cq.id), Some(0));

        // An idr attribute may not name a type whose objects live in the fd class.
        let records = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(6, cq.id)]);
        assert_eq!(
            tree.parse(OBJ, METH, &records, Some(&mut table), &opts)
                .unwrap_err(),
            ParseError::BadHandle { id: 6, source: None }
        );
        assert_eq!(table.use_count(ObjectClass::Fd, cq.id), Some(0));
    }

    #[test]
    fn created_fd_id_is_written_to_its_record() {
        let tree = tree();
        let mut table = HandleTable::new();
        let mut mem = DenseUserMemory::new(BASE, 0x100).unwrap();
        mem.write_u64_le(data_addr(1), u64::MAX).unwrap();

        let records = attrs(vec![WireAttr::inline(0, &[0; 4]), WireAttr::object(5, 0)]);
        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &ParseOptions::default())
            .unwrap();
        let created = parsed.get_resource(5).unwrap();
        assert_eq!(created.class, ObjectClass::Fd);
        assert_eq!(created.obj_type, CQ);

        parsed.write_created_ids(&mut mem).unwrap();
        parsed.commit();
        assert_eq!(mem.read_u64_le(data_addr(1)).unwrap(), u64::from(created.id));
        assert!(table.contains(ObjectClass::Fd, created.id));
    }

    #[test]
    fn created_ids_are_written_all_or_nothing() {
        let tree = tree();
        let mut table = HandleTable::new();
        let opts = ParseOptions::default();
        let records = attrs(vec![
            WireAttr::inline(0, &[0; 4]),
            WireAttr::object(5, 0),
            WireAttr::object(7, 0),
        ]);

        // The last record is not mapped at all.
        let mut mem = MappedUserMemory::new();
        mem.map(BASE, 2 * WireAttr::SIZE_BYTES).unwrap();
        mem.write_u64_le(data_addr(1), 0x5a5a).unwrap();
        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap();
        assert!(parsed.write_created_ids(&mut mem).is_err());
        assert_eq!(mem.read_u64_le(data_addr(1)).unwrap(), 0x5a5a);
        parsed.abort();

        // The last record is readable but refuses the write.
        let mut mem = ReadOnlyWord {
            inner: DenseUserMemory::new(BASE, 0x100).unwrap(),
            refuse: data_addr(2),
        };
        mem.inner.write_u64_le(data_addr(1), 0x5a5a).unwrap();
        let parsed = tree
            .parse(OBJ, METH, &records, Some(&mut table), &opts)
            .unwrap();
        assert!(parsed.write_created_ids(&mut mem).is_err());
        assert_eq!(mem.read_u64_le(data_addr(1)).unwrap(), 0x5a5a);
        parsed.abort();
        assert!(table.is_empty());
    }
}
