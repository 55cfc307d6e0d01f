//! Wire layout of an ioctl request.
//!
//! A request is an [`IoctlHeader`] immediately followed by `num_attrs` [`WireAttr`] records, all
//! little-endian and living in the sender's memory.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use uverbs_memory::{UserMemory, UserMemoryError, UserMemoryResult};

/// Largest payload carried inline in [`WireAttr::data`].
pub const INLINE_DATA_LEN: usize = 8;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct WireAttrFlags: u16 {
        /// The sender requires the attribute to be understood.
        const MANDATORY = 1 << 0;
        /// Set by the receiver once it has written the attribute's output.
        const VALID_OUTPUT = 1 << 1;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct IoctlHeader {
    /// Total request size: header plus all attribute records.
    pub length: u16,
    pub object_id: u16,
    pub method_id: u16,
    pub num_attrs: u16,
    pub reserved1: u64,
    pub driver_id: u32,
    pub reserved2: u32,
}

impl IoctlHeader {
    pub const SIZE_BYTES: usize = 24;

    /// Header for a request carrying `num_attrs` records.
    ///
    /// # Panics
    ///
    /// If the request would be longer than `length` can express.
    pub fn new(object_id: u16, method_id: u16, num_attrs: u16) -> Self {
        let length = Self::SIZE_BYTES + usize::from(num_attrs) * WireAttr::SIZE_BYTES;
        let Ok(length) = u16::try_from(length) else {
            panic!("{num_attrs} attribute records do not fit in one request");
        };
        Self {
            length,
            object_id,
            method_id,
            num_attrs,
            ..Self::default()
        }
    }

    pub fn read_from(mem: &dyn UserMemory, addr: u64) -> UserMemoryResult<Self> {
        let mut buf = [0u8; Self::SIZE_BYTES];
        mem.read_into(addr, &mut buf)?;
        Ok(bytemuck::pod_read_unaligned::<Self>(&buf).le_swapped())
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        bytemuck::cast(self.le_swapped())
    }

    /// Checks the header's self-consistency. Returns a short reason on failure.
    pub fn validate(&self, max_attrs: usize) -> Result<(), &'static str> {
        if self.reserved1 != 0 || self.reserved2 != 0 {
            return Err("reserved header fields must be zero");
        }
        if usize::from(self.num_attrs) > max_attrs {
            return Err("too many attributes");
        }
        let expected = Self::SIZE_BYTES + usize::from(self.num_attrs) * WireAttr::SIZE_BYTES;
        if usize::from(self.length) != expected {
            return Err("header length does not match attribute count");
        }
        Ok(())
    }

    fn le_swapped(self) -> Self {
        Self {
            length: u16::from_le(self.length),
            object_id: u16::from_le(self.object_id),
            method_id: u16::from_le(self.method_id),
            num_attrs: u16::from_le(self.num_attrs),
            reserved1: u64::from_le(self.reserved1),
            driver_id: u32::from_le(self.driver_id),
            reserved2: u32::from_le(self.reserved2),
        }
    }
}

/// One attribute record as sent on the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct WireAttr {
    pub attr_id: u16,
    pub len: u16,
    pub flags: u16,
    /// Selected candidate of an enum attribute; zero for every other kind.
    pub elem_id: u8,
    pub reserved: u8,
    /// Inline value, user address or object id depending on the attribute kind.
    pub data: u64,
}

impl WireAttr {
    pub const SIZE_BYTES: usize = 16;
    /// Byte offset of `flags` inside a record.
    pub const FLAGS_OFFSET: u64 = 4;
    /// Byte offset of `data` inside a record.
    pub const DATA_OFFSET: u64 = 8;

    /// Record whose payload is stored inline.
    ///
    /// # Panics
    ///
    /// If `value` is longer than [`INLINE_DATA_LEN`] bytes.
    pub fn inline(attr_id: u16, value: &[u8]) -> Self {
        assert!(
            value.len() <= INLINE_DATA_LEN,
            "inline payload of {} bytes exceeds {INLINE_DATA_LEN}",
            value.len()
        );
        let mut data = [0u8; INLINE_DATA_LEN];
        data[..value.len()].copy_from_slice(value);
        Self {
            attr_id,
            len: value.len() as u16,
            data: u64::from_le_bytes(data),
            ..Self::default()
        }
    }

    /// Record pointing at `len` bytes at `addr` in the sender's memory.
    pub fn pointer(attr_id: u16, addr: u64, len: u16) -> Self {
        Self {
            attr_id,
            len,
            data: addr,
            ..Self::default()
        }
    }

    /// Record naming an existing object (or a placeholder for one to be created).
    pub fn object(attr_id: u16, id: u32) -> Self {
        Self {
            attr_id,
            data: u64::from(id),
            ..Self::default()
        }
    }

    pub fn with_elem_id(mut self, elem_id: u8) -> Self {
        self.elem_id = elem_id;
        self
    }

    pub fn with_flags(mut self, flags: WireAttrFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    pub fn wire_flags(&self) -> WireAttrFlags {
        WireAttrFlags::from_bits_retain(self.flags)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        bytemuck::cast(self.le_swapped())
    }

    fn le_swapped(self) -> Self {
        Self {
            attr_id: u16::from_le(self.attr_id),
            len: u16::from_le(self.len),
            flags: u16::from_le(self.flags),
            elem_id: self.elem_id,
            reserved: self.reserved,
            data: u64::from_le(self.data),
        }
    }
}

/// The attribute records of one request, read out of user memory exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAttrs {
    records: Vec<WireAttr>,
    /// User address of `records[0]`; record `i` lives at `base + 16 * i`.
    base: u64,
}

impl UserAttrs {
    pub fn read(mem: &dyn UserMemory, base: u64, count: usize) -> UserMemoryResult<Self> {
        let len = count
            .checked_mul(WireAttr::SIZE_BYTES)
            .ok_or(UserMemoryError::Fault {
                addr: base,
                len: usize::MAX,
            })?;
        let mut buf = vec![0u8; len];
        mem.read_into(base, &mut buf)?;

        let records = buf
            .chunks_exact(WireAttr::SIZE_BYTES)
            .map(|chunk| bytemuck::pod_read_unaligned::<WireAttr>(chunk).le_swapped())
            .collect();
        Ok(Self { records, base })
    }

    /// Records that have already been fetched; `base` is where the sender keeps them.
    pub fn from_records(records: Vec<WireAttr>, base: u64) -> Self {
        Self { records, base }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[WireAttr] {
        &self.records
    }

    /// Records paired with their user address.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &WireAttr)> + '_ {
        let base = self.base;
        self.records.iter().enumerate().map(move |(idx, record)| {
            let addr = base.wrapping_add((idx * WireAttr::SIZE_BYTES) as u64);
            (addr, record)
        })
    }
}

/// Serialises a request into `mem` at `addr`: header first, then the records.
pub fn write_request(
    mem: &mut dyn UserMemory,
    addr: u64,
    header: &IoctlHeader,
    attrs: &[WireAttr],
) -> UserMemoryResult<()> {
    mem.write_from(addr, &header.to_bytes())?;
    let mut cur = addr.wrapping_add(IoctlHeader::SIZE_BYTES as u64);
    for attr in attrs {
        mem.write_from(cur, &attr.to_bytes())?;
        cur = cur.wrapping_add(WireAttr::SIZE_BYTES as u64);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uverbs_memory::DenseUserMemory;

    #[test]
    fn layouts_match_the_abi() {
        assert_eq!(core::mem::size_of::<IoctlHeader>(), IoctlHeader::SIZE_BYTES);
        assert_eq!(core::mem::size_of::<WireAttr>(), WireAttr::SIZE_BYTES);
        assert_eq!(core::mem::offset_of!(WireAttr, flags) as u64, WireAttr::FLAGS_OFFSET);
        assert_eq!(core::mem::offset_of!(WireAttr, data) as u64, WireAttr::DATA_OFFSET);
    }

    #[test]
    fn record_bytes_are_little_endian() {
        let attr = WireAttr::pointer(0x1002, 0x1122_3344_5566_7788, 0x30)
            .with_flags(WireAttrFlags::MANDATORY)
            .with_elem_id(5);
        assert_eq!(
            attr.to_bytes(),
            [
                0x02, 0x10, 0x30, 0x00, 0x01, 0x00, 0x05, 0x00, 0x88, 0x77, 0x66, 0x55, 0x44,
                0x33, 0x22, 0x11
            ]
        );
    }

    #[test]
    fn header_validation() {
        let hdr = IoctlHeader::new(1, 2, 3);
        assert_eq!(hdr.length, 24 + 3 * 16);
        assert_eq!(hdr.validate(8), Ok(()));
        assert!(hdr.validate(2).is_err());

        let mut bad = hdr;
        bad.length += 1;
        assert!(bad.validate(8).is_err());

        let mut bad = hdr;
        bad.reserved2 = 1;
        assert!(bad.validate(8).is_err());
    }

    #[test]
    fn largest_header_keeps_its_length() {
        let max = ((usize::from(u16::MAX) - IoctlHeader::SIZE_BYTES) / WireAttr::SIZE_BYTES) as u16;
        let hdr = IoctlHeader::new(0, 0, max);
        assert_eq!(
            usize::from(hdr.length),
            IoctlHeader::SIZE_BYTES + usize::from(max) * WireAttr::SIZE_BYTES
        );
    }

    #[test]
    #[should_panic(expected = "do not fit in one request")]
    fn header_length_never_wraps() {
        IoctlHeader::new(0, 0, 4095);
    }

    #[test]
    #[should_panic(expected = "exceeds 8")]
    fn inline_payload_is_never_truncated() {
        WireAttr::inline(0, &[0; 9]);
    }

    #[test]
    fn request_round_trips_through_user_memory() {
        let mut mem = DenseUserMemory::new(0x1000, 0x100).unwrap();
        let attrs = [WireAttr::inline(0, &[1, 2, 3, 4]), WireAttr::object(1, 9)];
        let hdr = IoctlHeader::new(4, 5, attrs.len() as u16);
        write_request(&mut mem, 0x1000, &hdr, &attrs).unwrap();

        assert_eq!(IoctlHeader::read_from(&mem, 0x1000).unwrap(), hdr);
        let read = UserAttrs::read(&mem, 0x1018, 2).unwrap();
        assert_eq!(read.records(), &attrs);
        let addrs: Vec<u64> = read.iter().map(|(addr, _)| addr).collect();
        assert_eq!(addrs, vec![0x1018, 0x1028]);
    }

    #[test]
    fn short_request_faults() {
        let mem = DenseUserMemory::new(0x1000, 0x20).unwrap();
        assert!(UserAttrs::read(&mem, 0x1010, 2).is_err());
        assert!(IoctlHeader::read_from(&mem, 0x1010).is_err());
    }
}
