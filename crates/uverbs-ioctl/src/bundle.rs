//! The validated attributes of one request and the accessors handlers use to consume them.
//!
//! Pointer payloads are not copied at parse time. A slot only records where the payload lives
//! (inline in the wire record, or at a user address) and every accessor that touches the payload
//! goes through [`UserMemory`], so a fault is reported to the handler as an ordinary error.

use std::fmt;

use bytemuck::Pod;
use thiserror::Error;
use uverbs_memory::{UserMemory, UserMemoryError};

use crate::bitmap::AttrBitmap;
use crate::errno;
use crate::id::{join_id, split_id};
use crate::registry::{ObjectHandle, ObjectRegistry};
use crate::spec::{AccessMode, AttrSpecFlags, PtrSpec};
use crate::tree::AttrBucket;
use crate::wire::{WireAttr, WireAttrFlags, INLINE_DATA_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    #[error("attribute {id:#06x} is not declared by this method")]
    UnknownAttribute { id: u16 },

    #[error("attribute {id:#06x} was not supplied")]
    NotFound { id: u16 },

    #[error("attribute {id:#06x} cannot be accessed with a {len} byte buffer")]
    SizeViolation { id: u16, len: usize },

    #[error(transparent)]
    Fault(#[from] UserMemoryError),

    #[error("attribute {id:#06x} does not reference an object")]
    BadHandle { id: u16 },

    #[error("attribute {id:#06x} does not support this access")]
    WrongKind { id: u16 },
}

impl AccessError {
    /// `true` only when the attribute was simply left out by the sender. Handlers treat that as
    /// "use the default" and everything else as a failed request.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound { .. } => -errno::ENOENT,
            Self::Fault(_) => -errno::EFAULT,
            Self::UnknownAttribute { .. }
            | Self::SizeViolation { .. }
            | Self::BadHandle { .. }
            | Self::WrongKind { .. } => -errno::EINVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrDirection {
    In,
    Out,
}

/// A validated pointer attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrAttr {
    /// Inline value (little-endian) or user address.
    pub(crate) data: u64,
    /// Length supplied by the sender.
    pub(crate) len: u16,
    pub(crate) wire_flags: WireAttrFlags,
    pub(crate) enum_id: Option<u8>,
    pub(crate) direction: PtrDirection,
    /// Constraints of the spec the attribute was validated against; for an enum attribute this
    /// is the selected candidate.
    pub(crate) spec: PtrSpec,
    pub(crate) spec_flags: AttrSpecFlags,
    /// User address of the sender's wire record.
    pub(crate) uattr_addr: u64,
}

impl PtrAttr {
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn direction(&self) -> PtrDirection {
        self.direction
    }

    pub fn spec(&self) -> PtrSpec {
        self.spec
    }

    /// Input payloads up to [`INLINE_DATA_LEN`] bytes travel inside the record itself.
    pub fn is_inline(&self) -> bool {
        self.direction == PtrDirection::In && self.len() <= INLINE_DATA_LEN
    }

    /// User address of the payload; `None` for inline payloads.
    pub fn address(&self) -> Option<u64> {
        (!self.is_inline()).then_some(self.data)
    }

    fn inline_bytes(&self) -> [u8; INLINE_DATA_LEN] {
        self.data.to_le_bytes()
    }

    /// Reads the first `dst.len()` payload bytes. `dst` must not be longer than the payload.
    fn read_payload(&self, mem: &dyn UserMemory, dst: &mut [u8]) -> Result<(), UserMemoryError> {
        if self.is_inline() {
            dst.copy_from_slice(&self.inline_bytes()[..dst.len()]);
            Ok(())
        } else {
            mem.read_into(self.data, dst)
        }
    }

    /// Whether payload bytes `[from, len)` all read as zero.
    fn tail_is_zero(&self, mem: &dyn UserMemory, from: usize) -> Result<bool, UserMemoryError> {
        let len = self.len();
        if from >= len {
            return Ok(true);
        }
        if self.is_inline() {
            return Ok(self.inline_bytes()[from..len].iter().all(|&b| b == 0));
        }
        let addr = self.data.checked_add(from as u64).ok_or(UserMemoryError::Fault {
            addr: self.data,
            len,
        })?;
        mem.is_zeroed(addr, len - from)
    }
}

/// A resolved object attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjAttr {
    pub(crate) access: AccessMode,
    pub(crate) handle: ObjectHandle,
    pub(crate) uattr_addr: u64,
}

impl ObjAttr {
    pub fn access(&self) -> AccessMode {
        self.access
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrSlot {
    Ptr(PtrAttr),
    Obj(ObjAttr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BundleBucket {
    declared: AttrBitmap,
    present: AttrBitmap,
    slots: Vec<Option<AttrSlot>>,
}

/// Validated attributes of one request, laid out like the method's attribute buckets.
///
/// A bundle that resolved objects holds references on them until its owner commits or aborts
/// it; outside the crate that owner is a [`ParsedAttrs`](crate::ParsedAttrs).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AttrBundle {
    buckets: Vec<BundleBucket>,
}

impl AttrBundle {
    pub(crate) fn new(layout: &[AttrBucket]) -> Self {
        let buckets = layout
            .iter()
            .map(|bucket| BundleBucket {
                declared: bucket.declared().clone(),
                present: AttrBitmap::new(bucket.len()),
                slots: vec![None; bucket.len()],
            })
            .collect();
        Self { buckets }
    }

    /// Stores `slot` for `id`. Returns `false` if `id` was already present.
    pub(crate) fn insert(&mut self, id: u16, slot: AttrSlot) -> bool {
        let (bucket, offset) = split_id(id);
        let Some(bucket) = self.buckets.get_mut(bucket) else {
            return false;
        };
        if offset >= bucket.slots.len() || bucket.present.set(offset) {
            return false;
        }
        bucket.slots[offset] = Some(slot);
        true
    }

    /// First id, in bucket then offset order, that is mandatory in `layout` but not present.
    pub(crate) fn first_missing(&self, layout: &[AttrBucket]) -> Option<u16> {
        layout
            .iter()
            .zip(&self.buckets)
            .enumerate()
            .find_map(|(idx, (spec, bundle))| {
                spec.mandatory()
                    .first_missing_from(&bundle.present)
                    .map(|offset| join_id(idx, offset))
            })
    }

    fn locate(&self, id: u16) -> Result<&AttrSlot, AccessError> {
        let (bucket, offset) = split_id(id);
        let bucket = self
            .buckets
            .get(bucket)
            .filter(|b| b.declared.test(offset))
            .ok_or(AccessError::UnknownAttribute { id })?;
        bucket
            .slots
            .get(offset)
            .and_then(Option::as_ref)
            .ok_or(AccessError::NotFound { id })
    }

    fn ptr(&self, id: u16) -> Result<&PtrAttr, AccessError> {
        match self.locate(id)? {
            AttrSlot::Ptr(ptr) => Ok(ptr),
            AttrSlot::Obj(_) => Err(AccessError::WrongKind { id }),
        }
    }

    pub fn get(&self, id: u16) -> Result<&AttrSlot, AccessError> {
        self.locate(id)
    }

    pub fn is_present(&self, id: u16) -> bool {
        self.locate(id).is_ok()
    }

    /// Payload length the sender supplied.
    pub fn ptr_len(&self, id: u16) -> Result<usize, AccessError> {
        Ok(self.ptr(id)?.len())
    }

    /// Candidate index the sender selected for an enum attribute.
    pub fn get_enum_selection(&self, id: u16) -> Result<u8, AccessError> {
        self.ptr(id)?
            .enum_id
            .ok_or(AccessError::WrongKind { id })
    }

    pub fn get_resource(&self, id: u16) -> Result<ObjectHandle, AccessError> {
        match self.locate(id)? {
            AttrSlot::Obj(obj) => Ok(obj.handle),
            AttrSlot::Ptr(_) => Err(AccessError::BadHandle { id }),
        }
    }

    /// Copies an input attribute into `dst`, zero-filling whatever the sender did not supply.
    ///
    /// For `MIN_SZ_OR_ZERO` attributes `dst` may be any size of at least `min_len`; payload
    /// bytes beyond `dst` must be zero. Otherwise `dst` must be exactly the declared length.
    /// `dst` is left untouched on error.
    pub fn copy_in(&self, mem: &dyn UserMemory, id: u16, dst: &mut [u8]) -> Result<(), AccessError> {
        let ptr = self.ptr(id)?;
        if ptr.direction != PtrDirection::In {
            return Err(AccessError::WrongKind { id });
        }

        if ptr.spec_flags.contains(AttrSpecFlags::MIN_SZ_OR_ZERO) {
            if dst.len() < usize::from(ptr.spec.min_len) {
                return Err(AccessError::SizeViolation { id, len: dst.len() });
            }
            if !ptr.tail_is_zero(mem, dst.len())? {
                return Err(AccessError::SizeViolation { id, len: dst.len() });
            }
        } else if dst.len() != usize::from(ptr.spec.len) {
            return Err(AccessError::SizeViolation { id, len: dst.len() });
        }

        let copied = ptr.len().min(dst.len());
        ptr.read_payload(mem, &mut dst[..copied])?;
        dst[copied..].fill(0);
        Ok(())
    }

    /// [`AttrBundle::copy_in`] into a zero-initialised `T`.
    pub fn copy_in_pod<T: Pod>(&self, mem: &dyn UserMemory, id: u16) -> Result<T, AccessError> {
        let mut value = T::zeroed();
        self.copy_in(mem, id, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    /// Writes `src` to an output attribute and marks the sender's record `VALID_OUTPUT`.
    ///
    /// At most `min(supplied len, declared len, src.len())` bytes are written; the count is
    /// returned.
    pub fn copy_out(
        &self,
        mem: &mut dyn UserMemory,
        id: u16,
        src: &[u8],
    ) -> Result<usize, AccessError> {
        let ptr = self.ptr(id)?;
        if ptr.direction != PtrDirection::Out {
            return Err(AccessError::WrongKind { id });
        }

        let n = ptr.len().min(usize::from(ptr.spec.len)).min(src.len());
        mem.write_from(ptr.data, &src[..n])?;

        let flags = ptr.wire_flags | WireAttrFlags::VALID_OUTPUT;
        mem.write_u16_le(
            ptr.uattr_addr.wrapping_add(WireAttr::FLAGS_OFFSET),
            flags.bits(),
        )?;
        Ok(n)
    }

    pub fn copy_out_pod<T: Pod>(
        &self,
        mem: &mut dyn UserMemory,
        id: u16,
        value: &T,
    ) -> Result<usize, AccessError> {
        self.copy_out(mem, id, bytemuck::bytes_of(value))
    }

    /// All present attributes in id order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &AttrSlot)> + '_ {
        self.buckets
            .iter()
            .enumerate()
            .flat_map(|(bucket_idx, bucket)| {
                bucket
                    .slots
                    .iter()
                    .enumerate()
                    .filter_map(move |(offset, slot)| {
                        slot.as_ref().map(|slot| (join_id(bucket_idx, offset), slot))
                    })
            })
    }

    /// Object attributes in id order.
    pub fn objects(&self) -> impl Iterator<Item = (u16, &ObjAttr)> + '_ {
        self.iter().filter_map(|(id, slot)| match slot {
            AttrSlot::Obj(obj) => Some((id, obj)),
            AttrSlot::Ptr(_) => None,
        })
    }

    /// Writes the id of every object created by this request into the `data` field of the
    /// sender's record.
    ///
    /// Either every id is written or none is: each target is read before the first write, and
    /// if a write still faults the records already updated get their old contents back.
    pub fn write_created_ids(&self, mem: &mut dyn UserMemory) -> Result<(), UserMemoryError> {
        let mut targets = Vec::new();
        for (_, obj) in self.objects() {
            if obj.access == AccessMode::Create {
                let addr = obj.uattr_addr.wrapping_add(WireAttr::DATA_OFFSET);
                let old = mem.read_u64_le(addr)?;
                targets.push((addr, old, u64::from(obj.handle.id)));
            }
        }

        for (done, &(addr, _, id)) in targets.iter().enumerate() {
            if let Err(err) = mem.write_u64_le(addr, id) {
                for &(addr, old, _) in &targets[..done] {
                    let _ = mem.write_u64_le(addr, old);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn commit(self, objects: &mut dyn ObjectRegistry) {
        for (_, obj) in self.objects() {
            objects.commit(&obj.handle, obj.access);
        }
    }

    pub(crate) fn abort(self, objects: &mut dyn ObjectRegistry) {
        for (_, obj) in self.objects() {
            objects.abort(&obj.handle, obj.access);
        }
    }
}

impl fmt::Debug for AttrBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(id, slot)| (format!("{id:#06x}"), slot)))
            .finish()
    }
}
