use crate::prelude::*;
use std::io;

// The backing file is a fixed header followed by slots laid end to end.
// Every byte of the file past the header belongs to exactly one slot, so
// the whole structure can be walked from the front and the file length
// always equals the header plus the sum of all slot capacities. A slot is
// either Used (it holds one object: the key image, then the payload, then
// whatever reserve is left) or Free. The in-memory directory is never
// persisted; it is rebuilt by walking the slots.
//
// All integers are little-endian.

pub const FILE_MAGIC: u32 = 0xCB01_57AF;
pub const SLOT_MAGIC: u32 = 0x510C_CB01;
pub const FORMAT_VERSION: u32 = 1;

pub const FILE_HEADER_LEN: u64 = 32;
pub const SLOT_HEADER_LEN: u32 = 20;

/// Splitting a free slot never leaves a fragment smaller than this; the
/// spare bytes stay inside the used slot as dead space instead.
pub const MIN_SLOT_BYTES: u32 = 64;

const FLAG_CASE_SENSITIVE: u32 = 0x0001;

/// The fixed header at offset zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub case_sensitive: bool,
    /// Total bytes of the slot region, i.e. file length minus this header.
    pub region_len: u64,
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN as usize] {
        let mut buf = [0u8; FILE_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&FILE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        let mut flags = 0u32;
        if self.case_sensitive {
            flags |= FLAG_CASE_SENSITIVE;
        }
        buf[8..12].copy_from_slice(&flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.region_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<FileHeader> {
        if buf.len() < FILE_HEADER_LEN as usize {
            return Err(StoreError::Corrupt(
                "file too short to hold a store header".into(),
            ));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != FILE_MAGIC {
            return Err(StoreError::Corrupt("bad store file magic".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported store format version {version}"
            )));
        }
        let flags = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let region_len = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        Ok(FileHeader {
            case_sensitive: flags & FLAG_CASE_SENSITIVE != 0,
            region_len,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Used,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub state: SlotState,
    /// Total slot size on disk, header included.
    pub capacity: u32,
    pub path_len: u16,
    pub payload_len: u32,
    pub version: u32,
}

impl SlotHeader {
    pub fn free(capacity: u32) -> SlotHeader {
        SlotHeader {
            state: SlotState::Free,
            capacity,
            path_len: 0,
            payload_len: 0,
            version: 0,
        }
    }

    pub fn encode(&self) -> [u8; SLOT_HEADER_LEN as usize] {
        let mut buf = [0u8; SLOT_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&SLOT_MAGIC.to_le_bytes());
        buf[4] = match self.state {
            SlotState::Free => 0,
            SlotState::Used => 1,
        };
        // buf[5] is a reserved flags byte, kept zero
        buf[6..10].copy_from_slice(&self.capacity.to_le_bytes());
        buf[10..12].copy_from_slice(&self.path_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.version.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<SlotHeader> {
        if buf.len() < SLOT_HEADER_LEN as usize {
            return Err(StoreError::Corrupt("truncated slot header".into()));
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != SLOT_MAGIC {
            return Err(StoreError::Corrupt("bad slot magic".into()));
        }
        let state = match buf[4] {
            0 => SlotState::Free,
            1 => SlotState::Used,
            other => {
                return Err(StoreError::Corrupt(format!("bad slot state byte {other}")));
            }
        };
        Ok(SlotHeader {
            state,
            capacity: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            path_len: u16::from_le_bytes(buf[10..12].try_into().unwrap()),
            payload_len: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            version: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }

    /// Bytes of the slot actually occupied by header, key image, and
    /// payload. Anything beyond this, up to capacity, is reserve.
    pub fn content_len(&self) -> u64 {
        SLOT_HEADER_LEN as u64 + self.path_len as u64 + self.payload_len as u64
    }
}

/// Reads the capacity field without validating the rest of the header.
/// Recovery uses this to try skipping past a damaged slot.
pub fn peek_capacity(buf: &[u8]) -> Option<u32> {
    let bytes = buf.get(6..10)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// The capacity a new slot needs for this object, reserve included.
pub fn needed_capacity(path_len: usize, payload_len: usize, reserve: u32) -> Result<u32> {
    let total =
        SLOT_HEADER_LEN as u64 + path_len as u64 + payload_len as u64 + reserve as u64;
    if total > u32::MAX as u64 {
        return Err(StoreError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "object too large for the slot format",
        )));
    }
    Ok((total as u32).max(MIN_SLOT_BYTES))
}

/// Whether an object of this shape can be rewritten in place.
pub fn fits(capacity: u32, path_len: usize, payload_len: usize) -> bool {
    SLOT_HEADER_LEN as u64 + path_len as u64 + payload_len as u64 <= capacity as u64
}
