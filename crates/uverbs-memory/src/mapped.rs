use std::collections::BTreeMap;

use crate::user::{region_offsets, UserMemory, UserMemoryError, UserMemoryResult};

/// User memory made of explicitly mapped regions; everything else faults.
///
/// Accesses may span several regions as long as they are back to back with no hole in
/// between, the same way a user buffer may straddle two adjacent pages.
#[derive(Debug, Clone, Default)]
pub struct MappedUserMemory {
    regions: BTreeMap<u64, Box<[u8]>>,
}

impl MappedUserMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `len` zeroed bytes at `addr`.
    pub fn map(&mut self, addr: u64, len: usize) -> UserMemoryResult<()> {
        let end = addr
            .checked_add(len as u64)
            .ok_or(UserMemoryError::Fault { addr, len })?;
        if len == 0 {
            return Ok(());
        }

        if let Some((&prev_base, prev)) = self.regions.range(..=addr).next_back() {
            if prev_base + prev.len() as u64 > addr {
                return Err(UserMemoryError::Overlap { addr, len });
            }
        }
        if self.regions.range(addr..end).next().is_some() {
            return Err(UserMemoryError::Overlap { addr, len });
        }

        self.regions.insert(addr, vec![0u8; len].into_boxed_slice());
        Ok(())
    }

    /// Removes the region that starts at `addr`. Returns `false` if there was none.
    pub fn unmap(&mut self, addr: u64) -> bool {
        self.regions.remove(&addr).is_some()
    }

    pub fn is_mapped(&self, addr: u64, len: usize) -> bool {
        let mut buf_len = len;
        let mut cur = addr;
        while buf_len > 0 {
            let Some((base, region)) = self.region_containing(cur) else {
                return false;
            };
            let region_end = base + region.len() as u64;
            let take = (region_end - cur).min(buf_len as u64) as usize;
            cur += take as u64;
            buf_len -= take;
        }
        true
    }

    fn region_containing(&self, addr: u64) -> Option<(u64, &[u8])> {
        let (&base, region) = self.regions.range(..=addr).next_back()?;
        if addr - base < region.len() as u64 {
            Some((base, region))
        } else {
            None
        }
    }
}

impl UserMemory for MappedUserMemory {
    fn read_into(&self, addr: u64, dst: &mut [u8]) -> UserMemoryResult<()> {
        let fault = UserMemoryError::Fault {
            addr,
            len: dst.len(),
        };
        addr.checked_add(dst.len() as u64).ok_or(fault.clone())?;

        let mut remaining = dst;
        let mut cur = addr;
        while !remaining.is_empty() {
            let (base, region) = self.region_containing(cur).ok_or(fault.clone())?;
            let avail = region.len() - (cur - base) as usize;
            let take = avail.min(remaining.len());
            let (start, end) = region_offsets(base, region.len() as u64, cur, take)?;
            remaining[..take].copy_from_slice(&region[start..end]);
            cur += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    fn write_from(&mut self, addr: u64, src: &[u8]) -> UserMemoryResult<()> {
        // Validate the whole range first so a fault never leaves a partial write behind.
        if addr.checked_add(src.len() as u64).is_none() || !self.is_mapped(addr, src.len()) {
            return Err(UserMemoryError::Fault {
                addr,
                len: src.len(),
            });
        }

        let mut remaining = src;
        let mut cur = addr;
        while !remaining.is_empty() {
            let (&base, region) = self
                .regions
                .range_mut(..=cur)
                .next_back()
                .ok_or(UserMemoryError::Fault {
                    addr,
                    len: src.len(),
                })?;
            let avail = region.len() - (cur - base) as usize;
            let take = avail.min(remaining.len());
            let (start, end) = region_offsets(base, region.len() as u64, cur, take)?;
            region[start..end].copy_from_slice(&remaining[..take]);
            cur += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }
}
