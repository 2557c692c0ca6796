use crate::slot::MIN_SLOT_BYTES;
use std::collections::BTreeMap;

// Decides where in the file each object lives. The allocator only does
// arithmetic over extents; the engine is responsible for writing the slot
// headers its decisions imply.
//
// Free space is tracked as a map from file offset to capacity. Placement is
// first-fit in ascending offset order, which a BTreeMap gives us for free;
// small objects gravitate toward the front of the file and growth happens
// at the tail. Freeing coalesces eagerly with both neighbors, so the free
// list stays short under the common alternate-and-refill churn of a config
// store.

/// Where the allocator decided an object goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub offset: u64,
    /// Granted capacity. May exceed what was asked for when splitting the
    /// host slot would have left a fragment below the minimum slot size.
    pub capacity: u32,
    /// Leftover extent split off the host slot, which the caller must
    /// re-header as a free slot on disk.
    pub remainder: Option<(u64, u32)>,
    /// True when the slot was carved from fresh space past the old end of
    /// the region; the caller must extend the file.
    pub grew: bool,
}

#[derive(Debug)]
pub struct SlotAllocator {
    free: BTreeMap<u64, u32>,
    /// File offset one past the last slot.
    end: u64,
}

impl SlotAllocator {
    pub fn new(region_start: u64) -> SlotAllocator {
        SlotAllocator {
            free: BTreeMap::new(),
            end: region_start,
        }
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn set_end(&mut self, end: u64) {
        self.end = end;
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.values().map(|&c| c as u64).sum()
    }

    /// First free extent that could host `needed` bytes, or fresh space at
    /// the end of the region.
    pub fn place(&mut self, needed: u32) -> Placement {
        let found = self
            .free
            .iter()
            .map(|(&off, &cap)| (off, cap))
            .find(|&(_, cap)| cap >= needed);
        match found {
            Some((offset, cap)) => {
                self.free.remove(&offset);
                let spare = cap - needed;
                if spare >= MIN_SLOT_BYTES {
                    let r_off = offset + needed as u64;
                    self.free.insert(r_off, spare);
                    Placement {
                        offset,
                        capacity: needed,
                        remainder: Some((r_off, spare)),
                        grew: false,
                    }
                } else {
                    // too small to stand alone; the spare rides along as
                    // dead space inside the used slot
                    Placement {
                        offset,
                        capacity: cap,
                        remainder: None,
                        grew: false,
                    }
                }
            }
            None => {
                let offset = self.end;
                self.end += needed as u64;
                Placement {
                    offset,
                    capacity: needed,
                    remainder: None,
                    grew: true,
                }
            }
        }
    }

    /// Returns the extent to the free list, merging with free neighbors on
    /// either side. Returns the merged extent; the caller re-headers it.
    pub fn release(&mut self, offset: u64, capacity: u32) -> (u64, u32) {
        let mut off = offset;
        let mut cap = capacity as u64;
        if let Some(&right) = self.free.get(&(offset + cap)) {
            if cap + right as u64 <= u32::MAX as u64 {
                self.free.remove(&(offset + cap));
                cap += right as u64;
            }
        }
        if let Some((&l_off, &l_cap)) = self.free.range(..offset).next_back() {
            if l_off + l_cap as u64 == offset && l_cap as u64 + cap <= u32::MAX as u64 {
                self.free.remove(&l_off);
                off = l_off;
                cap += l_cap as u64;
            }
        }
        let cap = cap as u32;
        self.free.insert(off, cap);
        (off, cap)
    }

    /// Rebuild hook: same as `release`, but reads as what it is at the
    /// open-time scan call sites.
    pub fn restore_free(&mut self, offset: u64, capacity: u32) {
        self.release(offset, capacity);
    }
}
