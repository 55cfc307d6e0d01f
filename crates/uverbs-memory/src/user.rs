use thiserror::Error;

/// Errors returned by [`UserMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserMemoryError {
    /// The requested range is not (fully) accessible.
    #[error("user memory fault: addr=0x{addr:x} len={len}")]
    Fault { addr: u64, len: usize },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("user memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
    /// A new mapping overlaps one that already exists.
    #[error("mapping overlaps an existing region: addr=0x{addr:x} len={len}")]
    Overlap { addr: u64, len: usize },
}

pub type UserMemoryResult<T> = Result<T, UserMemoryError>;

/// Memory on the far side of the trust boundary.
///
/// All copies go through `read_into`/`write_from` so a backend can fault any part of the range.
/// No method hands out references into the backing store.
pub trait UserMemory {
    /// Reads `dst.len()` bytes starting at `addr`.
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> UserMemoryResult<()>;

    /// Writes all of `src` starting at `addr`.
    fn write_from(&mut self, addr: u64, src: &[u8]) -> UserMemoryResult<()>;

    fn read_u16_le(&self, addr: u64) -> UserMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u64_le(&self, addr: u64) -> UserMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16_le(&mut self, addr: u64, value: u16) -> UserMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }

    fn write_u64_le(&mut self, addr: u64, value: u64) -> UserMemoryResult<()> {
        self.write_from(addr, &value.to_le_bytes())
    }

    /// Returns `true` if every byte in `[addr, addr + len)` reads as zero.
    ///
    /// Reads in small blocks so a large sender-controlled `len` does not turn into a large
    /// allocation.
    fn is_zeroed(&self, addr: u64, len: usize) -> UserMemoryResult<bool> {
        let mut block = [0u8; 64];
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(block.len());
            self.read_into(cur, &mut block[..take])?;
            if block[..take].iter().any(|&b| b != 0) {
                return Ok(false);
            }
            cur = cur
                .checked_add(take as u64)
                .ok_or(UserMemoryError::Fault { addr, len })?;
            remaining -= take;
        }
        Ok(true)
    }
}

impl<M: UserMemory + ?Sized> UserMemory for &mut M {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> UserMemoryResult<()> {
        (**self).read_into(addr, dst)
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> UserMemoryResult<()> {
        (**self).write_from(addr, src)
    }
}

/// Returns `[start, end)` as offsets into a region of `size` bytes mapped at `base`, or a fault
/// if any byte of `[addr, addr + len)` falls outside it.
pub(crate) fn region_offsets(
    base: u64,
    size: u64,
    addr: u64,
    len: usize,
) -> UserMemoryResult<(usize, usize)> {
    let fault = UserMemoryError::Fault { addr, len };
    let start = addr.checked_sub(base).ok_or(fault.clone())?;
    let end = start.checked_add(len as u64).ok_or(fault.clone())?;
    if end > size {
        return Err(fault);
    }
    let start = usize::try_from(start).map_err(|_| fault.clone())?;
    let end = usize::try_from(end).map_err(|_| fault)?;
    Ok((start, end))
}

/// A single contiguous mapping of `size` bytes starting at `base`.
#[derive(Debug, Clone)]
pub struct DenseUserMemory {
    base: u64,
    data: Box<[u8]>,
}

impl DenseUserMemory {
    pub fn new(base: u64, size: u64) -> UserMemoryResult<Self> {
        let size_usize = usize::try_from(size).map_err(|_| UserMemoryError::SizeTooLarge { size })?;
        // The mapping itself must not wrap the address space.
        base.checked_add(size).ok_or(UserMemoryError::Fault {
            addr: base,
            len: size_usize,
        })?;
        Ok(Self {
            base,
            data: vec![0u8; size_usize].into_boxed_slice(),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl UserMemory for DenseUserMemory {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> UserMemoryResult<()> {
        let (start, end) = region_offsets(self.base, self.size(), addr, dst.len())?;
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> UserMemoryResult<()> {
        let (start, end) = region_offsets(self.base, self.size(), addr, src.len())?;
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_read_write_primitives() {
        let mut mem = DenseUserMemory::new(0x1000, 64).unwrap();

        mem.write_u16_le(0x1002, 0x1122).unwrap();
        mem.write_u64_le(0x1008, 0x7788_99aa_bbcc_ddee).unwrap();

        assert_eq!(mem.read_u16_le(0x1002).unwrap(), 0x1122);
        assert_eq!(mem.read_u64_le(0x1008).unwrap(), 0x7788_99aa_bbcc_ddee);
    }

    #[test]
    fn dense_faults_below_base_and_past_end() {
        let mut mem = DenseUserMemory::new(0x1000, 16).unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(
            mem.read_into(0xffe, &mut buf),
            Err(UserMemoryError::Fault {
                addr: 0xffe,
                len: 4
            })
        );
        assert!(mem.read_into(0x100e, &mut buf).is_err());
        assert!(mem.write_from(0x1010, &[1]).is_err());

        // Last byte is fine.
        mem.write_from(0x100f, &[0xaa]).unwrap();
        assert_eq!(mem.read_u16_le(0x100e).unwrap(), 0xaa00);
    }

    #[test]
    fn dense_wrapping_address_faults_instead_of_panicking() {
        let mem = DenseUserMemory::new(0x1000, 16).unwrap();
        let mut buf = [0u8; 8];
        assert!(mem.read_into(u64::MAX - 3, &mut buf).is_err());
    }

    #[test]
    fn zeroed_scan_covers_multiple_blocks() {
        let mut mem = DenseUserMemory::new(0, 256).unwrap();
        assert!(mem.is_zeroed(0, 256).unwrap());

        mem.write_from(200, &[1]).unwrap();
        assert!(mem.is_zeroed(0, 200).unwrap());
        assert!(!mem.is_zeroed(0, 201).unwrap());
        assert!(mem.is_zeroed(240, 32).is_err());
    }
}
