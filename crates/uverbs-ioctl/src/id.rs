//! Namespace-qualified ids.
//!
//! Object, method and attribute ids are all `u16`. The top four bits select a namespace bucket
//! and the low twelve bits select a slot inside it. Namespace 0 holds the common definitions;
//! driver-specific definitions start at [`ID_DRIVER_NS`].

pub const ID_NS_SHIFT: u32 = 12;
pub const ID_NS_MASK: u16 = 0xF000;

/// First namespace reserved for driver-specific objects, methods and attributes.
pub const ID_DRIVER_NS: u16 = 1 << ID_NS_SHIFT;

/// Number of distinct namespaces a `u16` id can encode.
pub const NUM_NAMESPACES: usize = 1 << (16 - ID_NS_SHIFT);

/// Splits `id` into `(bucket, offset)`.
#[inline]
pub const fn split_id(id: u16) -> (usize, usize) {
    ((id >> ID_NS_SHIFT) as usize, (id & !ID_NS_MASK) as usize)
}

/// Inverse of [`split_id`]. `bucket` and `offset` are truncated to their field widths.
#[inline]
pub const fn join_id(bucket: usize, offset: usize) -> u16 {
    (((bucket as u16) << ID_NS_SHIFT) & ID_NS_MASK) | (offset as u16 & !ID_NS_MASK)
}

/// Id of the `offset`th driver-namespace definition.
#[inline]
pub const fn driver_id(offset: u16) -> u16 {
    ID_DRIVER_NS | (offset & !ID_NS_MASK)
}
