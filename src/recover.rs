use crate::alloc::SlotAllocator;
use crate::backing::BackingFile;
use crate::dir::{Directory, SlotRef};
use crate::engine::{Store, StoreFlags};
use crate::path::{CaseMode, StorePath};
use crate::prelude::*;
use crate::slot::{
    self, FileHeader, SlotHeader, SlotState, FILE_HEADER_LEN, SLOT_HEADER_LEN, SLOT_MAGIC,
};
use std::io;

// Everything that runs at open time: prove the file is structurally sound
// and rebuild the directory and free list by walking the slot sequence.
// The walk is also reused for the validation and dump entry points, which
// re-read the file rather than trusting the in-memory state.
//
// A normal open refuses the file on the first structural problem. A
// recover-mode open is deliberately least-destructive: damaged or
// conflicting slots are logged and their extents treated as free space in
// memory only. Nothing is rewritten on disk until a later allocation
// happens to land in one of those extents, so an operator can still take a
// byte-for-byte backup of the damaged file afterwards.

struct RawSlot {
    header: SlotHeader,
    /// Present for used slots; rebuilt from the key image in the slot.
    path: Option<StorePath>,
}

fn read_slot_at(
    file: &mut BackingFile,
    off: u64,
    region_end: u64,
    case: CaseMode,
) -> Result<RawSlot> {
    if off + SLOT_HEADER_LEN as u64 > region_end {
        return Err(StoreError::Corrupt(format!(
            "slot header at offset {off} runs past the end of the region"
        )));
    }
    let buf = file.read_at(off, SLOT_HEADER_LEN as usize)?;
    let header = SlotHeader::decode(&buf)?;
    if header.capacity < SLOT_HEADER_LEN {
        return Err(StoreError::Corrupt(format!(
            "slot at offset {off} declares an impossible capacity {}",
            header.capacity
        )));
    }
    if off + header.capacity as u64 > region_end {
        return Err(StoreError::Corrupt(format!(
            "slot at offset {off} overruns the region"
        )));
    }
    if header.content_len() > header.capacity as u64 {
        return Err(StoreError::Corrupt(format!(
            "slot at offset {off} holds more content than its capacity"
        )));
    }
    match header.state {
        SlotState::Free => {
            if header.path_len != 0 || header.payload_len != 0 || header.version != 0 {
                return Err(StoreError::Corrupt(format!(
                    "free slot at offset {off} carries object fields"
                )));
            }
            Ok(RawSlot { header, path: None })
        }
        SlotState::Used => {
            if header.version == 0 {
                return Err(StoreError::Corrupt(format!(
                    "used slot at offset {off} has version zero"
                )));
            }
            let key = file.read_at(off + SLOT_HEADER_LEN as u64, header.path_len as usize)?;
            let path = StorePath::from_stored(&key, case).map_err(|e| {
                StoreError::Corrupt(format!("slot at offset {off} has a bad key image: {e}"))
            })?;
            Ok(RawSlot {
                header,
                path: Some(path),
            })
        }
    }
}

fn corrupt_at(off: u64, e: StoreError) -> StoreError {
    match e {
        StoreError::Corrupt(msg) => StoreError::Corrupt(format!("slot at offset {off}: {msg}")),
        other => other,
    }
}

/// Validates an existing file and rebuilds the in-memory state from it.
pub(crate) fn load(mut file: BackingFile, flags: StoreFlags) -> Result<Store> {
    let case = if flags.case_sensitive {
        CaseMode::Sensitive
    } else {
        CaseMode::Insensitive
    };
    let file_len = file.len()?;
    if file_len < FILE_HEADER_LEN {
        return Err(StoreError::Corrupt(
            "file too short to hold a store header".into(),
        ));
    }
    let header = FileHeader::decode(&file.read_at(0, FILE_HEADER_LEN as usize)?)?;
    if header.case_sensitive != flags.case_sensitive {
        // rebuilding under the wrong folding would alias or split keys,
        // which is indistinguishable from corruption later on
        return Err(StoreError::Corrupt(format!(
            "store was created with case_sensitive={}, opened with case_sensitive={}",
            header.case_sensitive, flags.case_sensitive
        )));
    }
    let declared_end = FILE_HEADER_LEN + header.region_len;
    let region_end = if declared_end == file_len {
        declared_end
    } else {
        if !flags.recover {
            return Err(StoreError::Corrupt(format!(
                "file is {file_len} bytes but the header declares {declared_end}"
            )));
        }
        warn!(
            file_len,
            declared_end, "recover: file length disagrees with the header"
        );
        declared_end.min(file_len)
    };

    let mut dir = Directory::new(case);
    let mut alloc = SlotAllocator::new(FILE_HEADER_LEN);
    let mut skipped = 0u32;
    let mut off = FILE_HEADER_LEN;
    while off < region_end {
        match read_slot_at(&mut file, off, region_end, case) {
            Ok(raw) => {
                let cap = raw.header.capacity;
                match raw.header.state {
                    SlotState::Free => alloc.restore_free(off, cap),
                    SlotState::Used => {
                        // unwrap rationale: read_slot_at always fills path for used slots
                        let path = raw.path.unwrap();
                        let slot_ref = SlotRef {
                            offset: off,
                            capacity: cap,
                            key_len: raw.header.path_len,
                            live_len: raw.header.payload_len,
                            version: raw.header.version,
                        };
                        if let Err(e) = dir.insert(path, slot_ref) {
                            if !flags.recover {
                                return Err(StoreError::Corrupt(format!(
                                    "slot at offset {off}: {e}"
                                )));
                            }
                            warn!(offset = off, error = %e, "recover: dropping conflicting key");
                            skipped += 1;
                            alloc.restore_free(off, cap);
                        }
                    }
                }
                off += cap as u64;
            }
            Err(StoreError::Io(e)) => return Err(StoreError::Io(e)),
            Err(e) => {
                if !flags.recover {
                    return Err(corrupt_at(off, e));
                }
                warn!(offset = off, error = %e, "recover: skipping damaged slot");
                skipped += 1;
                let next = skip_damaged(&mut file, off, region_end)?;
                let mut gap_at = off;
                while gap_at < next {
                    let chunk = (next - gap_at).min(u32::MAX as u64) as u32;
                    alloc.restore_free(gap_at, chunk);
                    gap_at += chunk as u64;
                }
                off = next;
            }
        }
    }
    alloc.set_end(region_end);
    if skipped > 0 {
        warn!(skipped, "store opened in recover mode with damage present");
    }
    info!(
        path = %file.path().display(),
        keys = dir.len(),
        "opened object store"
    );
    Ok(Store {
        file,
        alloc,
        dir,
        case,
        last_backup: None,
    })
}

/// Finds where the slot after a damaged one begins: by the damaged
/// header's capacity field when that looks sane, else by hunting for the
/// next slot magic.
fn skip_damaged(file: &mut BackingFile, off: u64, region_end: u64) -> Result<u64> {
    let head_len = (region_end - off).min(SLOT_HEADER_LEN as u64) as usize;
    let head = file.read_at(off, head_len)?;
    if let Some(cap) = slot::peek_capacity(&head) {
        let end = off + cap as u64;
        if cap >= SLOT_HEADER_LEN && end <= region_end {
            return Ok(end);
        }
    }
    hunt_for_magic(file, off + 1, region_end)
}

fn hunt_for_magic(file: &mut BackingFile, from: u64, region_end: u64) -> Result<u64> {
    const CHUNK: usize = 64 * 1024;
    let magic = SLOT_MAGIC.to_le_bytes();
    let mut at = from;
    loop {
        if at >= region_end {
            return Ok(region_end);
        }
        let want = ((region_end - at) as usize).min(CHUNK);
        let buf = file.read_at(at, want)?;
        if let Some(pos) = buf.windows(4).position(|w| w == magic) {
            return Ok(at + pos as u64);
        }
        if at + want as u64 >= region_end {
            return Ok(region_end);
        }
        // overlap the chunk boundary so a split magic is not missed
        at += (want - 3) as u64;
    }
}

/// What a clean validation walk found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateReport {
    pub used_slots: usize,
    pub free_slots: usize,
    /// Payload bytes currently referenced by the directory.
    pub live_bytes: u64,
    /// Capacity held in used slots beyond their current content.
    pub reserve_bytes: u64,
    pub free_bytes: u64,
    pub file_bytes: u64,
}

/// Re-walks the file and cross-checks every slot against the directory.
pub(crate) fn validate(store: &mut Store) -> Result<ValidateReport> {
    let file_len = store.file.len()?;
    let header = FileHeader::decode(&store.file.read_at(0, FILE_HEADER_LEN as usize)?)?;
    if header.case_sensitive != (store.case == CaseMode::Sensitive) {
        return Err(StoreError::Corrupt(
            "case flag on disk does not match the open store".into(),
        ));
    }
    let region_end = FILE_HEADER_LEN + header.region_len;
    if region_end != file_len {
        return Err(StoreError::Corrupt(format!(
            "file is {file_len} bytes but the header declares {region_end}"
        )));
    }
    if region_end != store.alloc.end() {
        return Err(StoreError::Corrupt(
            "allocator end drifted from the declared region".into(),
        ));
    }

    let mut report = ValidateReport {
        file_bytes: file_len,
        ..Default::default()
    };
    let mut off = FILE_HEADER_LEN;
    while off < region_end {
        let raw =
            read_slot_at(&mut store.file, off, region_end, store.case).map_err(|e| corrupt_at(off, e))?;
        let cap = raw.header.capacity;
        match raw.header.state {
            SlotState::Free => {
                report.free_slots += 1;
                report.free_bytes += cap as u64;
            }
            SlotState::Used => {
                // unwrap rationale: read_slot_at always fills path for used slots
                let path = raw.path.unwrap();
                match store.dir.lookup(&path) {
                    Some(entry)
                        if entry.offset == off
                            && entry.capacity == cap
                            && entry.key_len == raw.header.path_len
                            && entry.live_len == raw.header.payload_len
                            && entry.version == raw.header.version =>
                    {
                        report.used_slots += 1;
                        report.live_bytes += raw.header.payload_len as u64;
                        report.reserve_bytes += cap as u64 - raw.header.content_len();
                    }
                    Some(_) => {
                        return Err(StoreError::Corrupt(format!(
                            "slot at offset {off} disagrees with the directory entry for {path}"
                        )));
                    }
                    None => {
                        return Err(StoreError::Corrupt(format!(
                            "slot at offset {off} holds {path}, which is not in the directory"
                        )));
                    }
                }
            }
        }
        off += cap as u64;
    }
    if report.used_slots != store.dir.len() {
        return Err(StoreError::Corrupt(format!(
            "directory has {} entries but the file has {} used slots",
            store.dir.len(),
            report.used_slots
        )));
    }
    if report.free_slots != store.alloc.free_slots()
        || report.free_bytes != store.alloc.free_bytes()
    {
        return Err(StoreError::Corrupt(
            "free list drifted from the on-disk free slots".into(),
        ));
    }
    Ok(report)
}

/// Human-readable walk of the slot sequence, for operator tooling.
pub(crate) fn dump(store: &mut Store, out: &mut dyn io::Write) -> Result<()> {
    writeln!(
        out,
        "store {} ({} bytes, {} keys)",
        store.file.path().display(),
        store.file.len()?,
        store.dir.len()
    )?;
    let region_end = store.alloc.end();
    let mut off = FILE_HEADER_LEN;
    while off < region_end {
        let raw =
            read_slot_at(&mut store.file, off, region_end, store.case).map_err(|e| corrupt_at(off, e))?;
        let header = raw.header;
        match header.state {
            SlotState::Free => {
                writeln!(out, "  [{off:#010x}] free cap={}", header.capacity)?;
            }
            SlotState::Used => {
                // unwrap rationale: read_slot_at always fills path for used slots
                writeln!(
                    out,
                    "  [{off:#010x}] used cap={} ver={} len={} {}",
                    header.capacity,
                    header.version,
                    header.payload_len,
                    raw.path.unwrap()
                )?;
            }
        }
        off += header.capacity as u64;
    }
    Ok(())
}
