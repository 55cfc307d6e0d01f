//! The merged, immutable spec tree.
//!
//! All specs live in three flat arenas (objects, methods, attribute slots). Objects and methods
//! refer into them through per-namespace buckets of index ranges, so resolving an id is two
//! bounds-checked array lookups rather than a search.

use std::fmt;
use std::sync::Arc;

use crate::bitmap::AttrBitmap;
use crate::def::Handler;
use crate::id::{join_id, split_id};
use crate::spec::{AttrSpec, MethodFlags, ObjectType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SlotRange {
    start: u32,
    len: u32,
}

/// Maps namespace-qualified ids to arena positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IdIndex {
    buckets: Vec<SlotRange>,
    slots: Vec<Option<u32>>,
}

impl IdIndex {
    /// `entries` must be sorted by id with no duplicates.
    fn build(entries: &[(u16, u32)]) -> Self {
        let num_buckets = entries
            .last()
            .map(|&(id, _)| split_id(id).0 + 1)
            .unwrap_or(0);

        let mut bucket_lens = vec![0usize; num_buckets];
        for &(id, _) in entries {
            let (bucket, offset) = split_id(id);
            bucket_lens[bucket] = bucket_lens[bucket].max(offset + 1);
        }

        let mut buckets = Vec::with_capacity(num_buckets);
        let mut start = 0usize;
        for &len in &bucket_lens {
            buckets.push(SlotRange {
                start: start as u32,
                len: len as u32,
            });
            start += len;
        }

        let mut slots = vec![None; start];
        for &(id, value) in entries {
            let (bucket, offset) = split_id(id);
            slots[buckets[bucket].start as usize + offset] = Some(value);
        }

        Self { buckets, slots }
    }

    fn get(&self, id: u16) -> Option<u32> {
        let (bucket, offset) = split_id(id);
        let range = self.buckets.get(bucket)?;
        if offset >= range.len as usize {
            return None;
        }
        self.slots
            .get(range.start as usize + offset)
            .copied()
            .flatten()
    }

    fn values(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().filter_map(|slot| *slot)
    }
}

/// One namespace bucket of a method's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrBucket {
    start: u32,
    len: u32,
    declared: AttrBitmap,
    mandatory: AttrBitmap,
}

impl AttrBucket {
    /// Number of offsets in the bucket, including unused ones.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offsets that carry an attribute spec.
    pub fn declared(&self) -> &AttrBitmap {
        &self.declared
    }

    pub fn mandatory(&self) -> &AttrBitmap {
        &self.mandatory
    }
}

pub struct MethodSpec<D, S> {
    id: u16,
    flags: MethodFlags,
    handler: Option<Handler<D, S>>,
    attr_buckets: Vec<AttrBucket>,
    num_attrs: usize,
}

impl<D, S> MethodSpec<D, S> {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn creates_root(&self) -> bool {
        self.flags.contains(MethodFlags::CREATE_ROOT)
    }

    pub fn handler(&self) -> Option<&Handler<D, S>> {
        self.handler.as_ref()
    }

    pub fn attr_buckets(&self) -> &[AttrBucket] {
        &self.attr_buckets
    }

    /// Number of declared attributes.
    pub fn num_attrs(&self) -> usize {
        self.num_attrs
    }
}

impl<D, S> PartialEq for MethodSpec<D, S> {
    fn eq(&self, other: &Self) -> bool {
        let same_handler = match (&self.handler, &other.handler) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.id == other.id
            && self.flags == other.flags
            && same_handler
            && self.attr_buckets == other.attr_buckets
            && self.num_attrs == other.num_attrs
    }
}

impl<D, S> fmt::Debug for MethodSpec<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSpec")
            .field("id", &format_args!("{:#06x}", self.id))
            .field("flags", &self.flags)
            .field("handler", &self.handler.is_some())
            .field("attr_buckets", &self.attr_buckets)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSpec {
    id: u16,
    type_attrs: Option<Arc<ObjectType>>,
    methods: IdIndex,
}

impl ObjectSpec {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn type_attrs(&self) -> Option<&Arc<ObjectType>> {
        self.type_attrs.as_ref()
    }
}

/// Flattened merge output, sorted by id at every level.
pub(crate) struct FlatObject<D, S> {
    pub id: u16,
    pub type_attrs: Option<Arc<ObjectType>>,
    pub methods: Vec<FlatMethod<D, S>>,
}

pub(crate) struct FlatMethod<D, S> {
    pub id: u16,
    pub flags: MethodFlags,
    pub handler: Option<Handler<D, S>>,
    pub attrs: Vec<(u16, AttrSpec)>,
}

/// Runtime form of one or more merged definition trees.
///
/// Built once by [`crate::merge`] and never mutated afterwards; wrap it in an `Arc` to share it
/// between concurrent requests.
pub struct SpecTree<D, S> {
    objects: Vec<ObjectSpec>,
    object_index: IdIndex,
    methods: Vec<MethodSpec<D, S>>,
    attrs: Vec<Option<AttrSpec>>,
}

impl<D, S> SpecTree<D, S> {
    pub(crate) fn from_flat(flat: Vec<FlatObject<D, S>>) -> Self {
        let mut objects = Vec::with_capacity(flat.len());
        let mut object_entries = Vec::with_capacity(flat.len());
        let mut methods = Vec::new();
        let mut attrs = Vec::new();

        for object in flat {
            let mut method_entries = Vec::with_capacity(object.methods.len());
            for method in object.methods {
                let attr_buckets = Self::place_attrs(&method.attrs, &mut attrs);
                method_entries.push((method.id, methods.len() as u32));
                methods.push(MethodSpec {
                    id: method.id,
                    flags: method.flags,
                    handler: method.handler,
                    attr_buckets,
                    num_attrs: method.attrs.len(),
                });
            }
            object_entries.push((object.id, objects.len() as u32));
            objects.push(ObjectSpec {
                id: object.id,
                type_attrs: object.type_attrs,
                methods: IdIndex::build(&method_entries),
            });
        }

        Self {
            objects,
            object_index: IdIndex::build(&object_entries),
            methods,
            attrs,
        }
    }

    /// Appends one method's attribute buckets to the arena. `sorted` must be sorted by id.
    fn place_attrs(sorted: &[(u16, AttrSpec)], arena: &mut Vec<Option<AttrSpec>>) -> Vec<AttrBucket> {
        let num_buckets = sorted
            .last()
            .map(|(id, _)| split_id(*id).0 + 1)
            .unwrap_or(0);

        let mut lens = vec![0usize; num_buckets];
        for (id, _) in sorted {
            let (bucket, offset) = split_id(*id);
            lens[bucket] = lens[bucket].max(offset + 1);
        }

        let mut buckets: Vec<AttrBucket> = lens
            .iter()
            .map(|&len| {
                let start = arena.len();
                arena.resize(start + len, None);
                AttrBucket {
                    start: start as u32,
                    len: len as u32,
                    declared: AttrBitmap::new(len),
                    mandatory: AttrBitmap::new(len),
                }
            })
            .collect();

        for (id, spec) in sorted {
            let (bucket, offset) = split_id(*id);
            let slot = &mut buckets[bucket];
            slot.declared.set(offset);
            if spec.is_mandatory() {
                slot.mandatory.set(offset);
            }
            arena[slot.start as usize + offset] = Some(spec.clone());
        }

        buckets
    }

    pub fn object(&self, id: u16) -> Option<&ObjectSpec> {
        let idx = self.object_index.get(id)?;
        self.objects.get(idx as usize)
    }

    pub fn objects(&self) -> impl Iterator<Item = &ObjectSpec> + '_ {
        self.objects.iter()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn method(&self, object_id: u16, method_id: u16) -> Option<&MethodSpec<D, S>> {
        let object = self.object(object_id)?;
        let idx = object.methods.get(method_id)?;
        self.methods.get(idx as usize)
    }

    pub fn methods<'a>(
        &'a self,
        object: &'a ObjectSpec,
    ) -> impl Iterator<Item = &'a MethodSpec<D, S>> + 'a {
        object
            .methods
            .values()
            .filter_map(move |idx| self.methods.get(idx as usize))
    }

    /// Type descriptor of the object `obj_type`, if any tree supplied one.
    pub fn type_attrs(&self, obj_type: u16) -> Option<&Arc<ObjectType>> {
        self.object(obj_type)?.type_attrs()
    }

    /// Spec of attribute `id` in `method`; `None` for ids outside the method's buckets and for
    /// unused slots inside them.
    pub fn method_attr(&self, method: &MethodSpec<D, S>, id: u16) -> Option<&AttrSpec> {
        let (bucket, offset) = split_id(id);
        let bucket = method.attr_buckets.get(bucket)?;
        if offset >= bucket.len() {
            return None;
        }
        self.attrs
            .get(bucket.start as usize + offset)
            .and_then(Option::as_ref)
    }

    /// All declared attributes of `method` in id order.
    pub fn method_attrs<'a>(
        &'a self,
        method: &'a MethodSpec<D, S>,
    ) -> impl Iterator<Item = (u16, &'a AttrSpec)> + 'a {
        method
            .attr_buckets
            .iter()
            .enumerate()
            .flat_map(move |(bucket_idx, bucket)| {
                (0..bucket.len()).filter_map(move |offset| {
                    let spec = self.attrs.get(bucket.start as usize + offset)?.as_ref()?;
                    Some((join_id(bucket_idx, offset), spec))
                })
            })
    }
}

impl<D, S> PartialEq for SpecTree<D, S> {
    fn eq(&self, other: &Self) -> bool {
        self.objects == other.objects
            && self.object_index == other.object_index
            && self.methods == other.methods
            && self.attrs == other.attrs
    }
}

impl<D, S> fmt::Debug for SpecTree<D, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpecTree")
            .field("objects", &self.objects)
            .field("methods", &self.methods)
            .field("attrs", &self.attrs.iter().filter(|a| a.is_some()).count())
            .finish()
    }
}
