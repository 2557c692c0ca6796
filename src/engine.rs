use crate::alloc::SlotAllocator;
use crate::backing::BackingFile;
use crate::dir::{Directory, SlotRef};
use crate::path::{self, CaseMode, StorePath};
use crate::prelude::*;
use crate::recover::{self, ValidateReport};
use crate::slot::{self, FileHeader, SlotHeader, SlotState, FILE_HEADER_LEN, SLOT_HEADER_LEN};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

// The public face of the store. One mutex serializes every operation, and
// everything under it (directory, allocator, backing file) is treated as a
// single unit. That is deliberate: the workload is config-scale reads and
// writes, and one coarse lock keeps the consistency story trivial. Threads
// blocked on the lock wait out at most one operation's worth of file i/o.
//
// Benign errors (bad path, missing key, duplicate key) never change store
// state. An i/o error aborts the operation and may leave the directory
// ahead of or behind the file; the next open re-validates and rebuilds.
// Detected structural corruption poisons the engine so nothing else runs
// on top of a store known to be bad; re-opening (usually in recover mode)
// is the only way forward from there.

/// Extension of store files: `<dir>/<name>.cubby`.
pub const STORE_SUFFIX: &str = "cubby";

/// Open-time options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFlags {
    /// Compare keys case-sensitively. The flag is recorded in the file at
    /// creation and must match on every later open. In sensitive mode the
    /// caller is responsible for consistent key casing; the store will
    /// happily hold `/A/b` and `/a/B` side by side.
    pub case_sensitive: bool,
    /// Tolerate structural damage at open: bad slots are logged and
    /// skipped instead of failing the open. The file itself is not
    /// modified until a later write lands in a damaged extent.
    pub recover: bool,
}

/// Outcome of a version-gated read.
#[derive(Debug, PartialEq, Eq)]
pub enum LoadRes {
    NewData { version: u32, bytes: Vec<u8> },
    NoNewData,
    NotFound,
}

enum State {
    Ready(Box<Store>),
    Poisoned,
    Closed,
}

/// A hierarchical key/object store in a single backing file.
///
/// Keys are paths like `/Windows/Dialogs/Config`, values are opaque byte
/// blobs, and every object carries a version that bumps on each update so
/// callers can poll cheaply. All methods take `&self` and are safe to call
/// from multiple threads; they serialize on an internal mutex.
pub struct ObjStore {
    inner: Mutex<State>,
}

impl ObjStore {
    /// Opens the store `<dir>/<name>.cubby`, creating it if absent. The
    /// second return value is true if a fresh store was created.
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        flags: StoreFlags,
    ) -> Result<(ObjStore, bool)> {
        let file_path = dir.as_ref().join(format!("{name}.{STORE_SUFFIX}"));
        let (mut file, was_empty) = BackingFile::open(&file_path)?;
        let case = if flags.case_sensitive {
            CaseMode::Sensitive
        } else {
            CaseMode::Insensitive
        };
        let store = if was_empty {
            let header = FileHeader {
                case_sensitive: flags.case_sensitive,
                region_len: 0,
            };
            file.write_at(0, &header.encode())?;
            file.flush()?;
            info!(path = %file_path.display(), "created a new object store");
            Store {
                file,
                alloc: SlotAllocator::new(FILE_HEADER_LEN),
                dir: Directory::new(case),
                case,
                last_backup: None,
            }
        } else {
            recover::load(file, flags)?
        };
        Ok((
            ObjStore {
                inner: Mutex::new(State::Ready(Box::new(store))),
            },
            was_empty,
        ))
    }

    fn locked(&self) -> Result<MutexGuard<'_, State>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Corrupt("store mutex poisoned by a panicked thread".into()))
    }

    /// Runs one operation under the store lock. A `Corrupt` result poisons
    /// the engine; everything after that fails `Corrupt` until re-open.
    fn run<R>(&self, op: impl FnOnce(&mut Store) -> Result<R>) -> Result<R> {
        let mut state = self.locked()?;
        let store = match &mut *state {
            State::Ready(store) => store,
            State::Poisoned => {
                return Err(StoreError::Corrupt(
                    "store is poisoned; re-open it to recover".into(),
                ));
            }
            State::Closed => return Err(StoreError::NotReady),
        };
        let res = op(store);
        if matches!(res, Err(StoreError::Corrupt(_))) {
            *state = State::Poisoned;
        }
        res
    }

    /// Stores a new object. Fails `AlreadyExists` if the key (or a scope
    /// of the same name) is taken. `reserve` asks for that many spare
    /// bytes in the slot so future growth stays in place.
    pub fn add(&self, path: &str, bytes: &[u8], reserve: u32) -> Result<()> {
        self.run(|store| store.add(path, bytes, reserve))
    }

    /// Adds the object or updates it if present. Returns whether it was
    /// created, and the resulting version.
    pub fn add_or_update(&self, path: &str, bytes: &[u8], reserve: u32) -> Result<(bool, u32)> {
        self.run(|store| store.add_or_update(path, bytes, reserve))
    }

    /// Replaces an existing object's payload and returns the new version.
    pub fn update(&self, path: &str, bytes: &[u8]) -> Result<u32> {
        self.run(|store| store.update(path, bytes, 0))
    }

    /// Version-gated read. Pass the last version you saw (0 for "I have
    /// nothing"): you get `None` when that is still current, and the new
    /// version plus payload otherwise. Missing keys are `NotFound`.
    pub fn read(&self, path: &str, last_version: u32) -> Result<Option<(u32, Vec<u8>)>> {
        match self.read_full(path, last_version, true)? {
            LoadRes::NewData { version, bytes } => Ok(Some((version, bytes))),
            LoadRes::NoNewData => Ok(None),
            // read_full with throw_if_not never returns NotFound
            LoadRes::NotFound => Err(StoreError::NotFound {
                path: path.to_owned(),
            }),
        }
    }

    /// Like `read`, but reports a missing key as `LoadRes::NotFound`
    /// instead of an error when `throw_if_not` is false.
    pub fn read_full(&self, path: &str, last_version: u32, throw_if_not: bool) -> Result<LoadRes> {
        self.run(|store| store.read_full(path, last_version, throw_if_not))
    }

    /// Removes an object. Its slot becomes free space for later adds.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.run(|store| store.delete(path))
    }

    /// Like `delete`, but a missing key reports `false` instead of
    /// `NotFound`.
    pub fn delete_if_exists(&self, path: &str) -> Result<bool> {
        self.run(|store| store.delete_if_exists(path))
    }

    /// Removes every object under `scope` and returns how many went.
    pub fn delete_scope(&self, scope: &str) -> Result<usize> {
        self.run(|store| store.delete_scope(scope))
    }

    pub fn key_exists(&self, path: &str) -> Result<bool> {
        self.run(|store| Ok(store.lookup(path)?.is_some()))
    }

    /// Current version of the object, or `None` if the key is absent.
    pub fn key_version(&self, path: &str) -> Result<Option<u32>> {
        self.run(|store| Ok(store.lookup(path)?.map(|s| s.version)))
    }

    pub fn object_count(&self) -> Result<usize> {
        self.run(|store| Ok(store.dir.len()))
    }

    /// Every key in the store.
    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.run(|store| Ok(store.dir.all_keys()))
    }

    /// Full paths of every object anywhere under `scope`.
    pub fn all_objects_under(&self, scope: &str) -> Result<Vec<String>> {
        self.run(|store| {
            let scope = StorePath::parse_scope(scope, store.case)?;
            Ok(store.dir.all_objects_under(&scope))
        })
    }

    /// Full paths of objects under `scope` whose leaf name is `name`.
    pub fn find_name_under(&self, name: &str, scope: &str) -> Result<Vec<String>> {
        self.run(|store| {
            path::check_leaf_name(name)?;
            let scope = StorePath::parse_scope(scope, store.case)?;
            Ok(store.dir.find_name_under(name, &scope))
        })
    }

    /// Leaf names of the objects sitting directly in `scope`.
    pub fn keys_in_scope(&self, scope: &str) -> Result<Vec<String>> {
        self.run(|store| {
            let scope = StorePath::parse_scope(scope, store.case)?;
            Ok(store.dir.keys_in_scope(&scope))
        })
    }

    /// Names of the immediate sub-scopes of `scope`.
    pub fn subscopes_in_scope(&self, scope: &str) -> Result<Vec<String>> {
        self.run(|store| {
            let scope = StorePath::parse_scope(scope, store.case)?;
            Ok(store.dir.subscopes_in_scope(&scope))
        })
    }

    /// Forces buffered writes down to durable storage.
    pub fn flush_to_disk(&self) -> Result<()> {
        self.run(|store| store.file.flush())
    }

    /// Flushes, then copies the file to a timestamped sibling. Returns the
    /// backup's path. Other operations wait while the copy runs.
    pub fn backup(&self) -> Result<PathBuf> {
        self.run(|store| store.backup())
    }

    /// When the last successful `backup` through this engine ran.
    pub fn last_backup(&self) -> Result<Option<SystemTime>> {
        self.run(|store| Ok(store.last_backup))
    }

    /// Re-walks the file and cross-checks it against the in-memory
    /// directory. Any structural problem fails `Corrupt` (and poisons the
    /// engine, since the store is provably bad).
    pub fn validate(&self) -> Result<ValidateReport> {
        self.run(recover::validate)
    }

    /// Writes a human-readable listing of the slot sequence, for
    /// dump-and-inspect tooling.
    pub fn debug_dump(&self, out: &mut dyn io::Write) -> Result<()> {
        self.run(|store| recover::dump(store, out))
    }

    /// Flushes and releases the backing file. Idempotent; every other
    /// operation on a closed store fails `NotReady`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.locked()?;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Ready(mut store) => store.file.flush(),
            State::Poisoned | State::Closed => Ok(()),
        }
    }
}

pub(crate) struct Store {
    pub(crate) file: BackingFile,
    pub(crate) alloc: SlotAllocator,
    pub(crate) dir: Directory,
    pub(crate) case: CaseMode,
    pub(crate) last_backup: Option<SystemTime>,
}

impl Store {
    fn lookup(&self, raw: &str) -> Result<Option<&SlotRef>> {
        let path = StorePath::parse_key(raw, self.case)?;
        Ok(self.dir.lookup(&path))
    }

    fn write_file_header(&mut self) -> Result<()> {
        let header = FileHeader {
            case_sensitive: self.case == CaseMode::Sensitive,
            region_len: self.alloc.end() - FILE_HEADER_LEN,
        };
        self.file.write_at(0, &header.encode())
    }

    /// Places and writes a fresh used slot for this object.
    fn write_object_slot(
        &mut self,
        path: &StorePath,
        payload: &[u8],
        reserve: u32,
        version: u32,
    ) -> Result<SlotRef> {
        let key = path.as_str().as_bytes();
        let needed = slot::needed_capacity(key.len(), payload.len(), reserve)?;
        let place = self.alloc.place(needed);
        let header = SlotHeader {
            state: SlotState::Used,
            capacity: place.capacity,
            path_len: key.len() as u16,
            payload_len: payload.len() as u32,
            version,
        };
        let mut buf = Vec::with_capacity(SLOT_HEADER_LEN as usize + key.len() + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(key);
        buf.extend_from_slice(payload);
        self.file.write_at(place.offset, &buf)?;
        if let Some((r_off, r_cap)) = place.remainder {
            self.file.write_at(r_off, &SlotHeader::free(r_cap).encode())?;
        }
        if place.grew {
            // materialize the slot's full capacity so the file length
            // stays equal to header + sum of capacities
            self.file.truncate(self.alloc.end())?;
            self.write_file_header()?;
        }
        Ok(SlotRef {
            offset: place.offset,
            capacity: place.capacity,
            key_len: key.len() as u16,
            live_len: payload.len() as u32,
            version,
        })
    }

    /// Marks the extent free, coalescing with free neighbors, and writes
    /// the covering free header.
    fn free_slot(&mut self, offset: u64, capacity: u32) -> Result<()> {
        let (m_off, m_cap) = self.alloc.release(offset, capacity);
        if m_off != offset || m_cap != capacity {
            trace!(offset = m_off, capacity = m_cap, "coalesced adjacent free slots");
        }
        self.file.write_at(m_off, &SlotHeader::free(m_cap).encode())
    }

    fn add(&mut self, raw: &str, payload: &[u8], reserve: u32) -> Result<()> {
        let path = StorePath::parse_key(raw, self.case)?;
        self.dir.check_insert(&path)?;
        let slot_ref = self.write_object_slot(&path, payload, reserve, 1)?;
        self.dir.insert(path, slot_ref)
    }

    fn update(&mut self, raw: &str, payload: &[u8], reserve: u32) -> Result<u32> {
        let path = StorePath::parse_key(raw, self.case)?;
        let current = *self
            .dir
            .lookup(&path)
            .ok_or_else(|| StoreError::NotFound {
                path: path.as_str().to_owned(),
            })?;
        let version = current.version + 1;
        let key = path.as_str().as_bytes();
        let slot_ref = if slot::fits(current.capacity, key.len(), payload.len()) {
            // hot path: rewrite in place, capacity unchanged
            let header = SlotHeader {
                state: SlotState::Used,
                capacity: current.capacity,
                path_len: key.len() as u16,
                payload_len: payload.len() as u32,
                version,
            };
            let mut buf =
                Vec::with_capacity(SLOT_HEADER_LEN as usize + key.len() + payload.len());
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(key);
            buf.extend_from_slice(payload);
            self.file.write_at(current.offset, &buf)?;
            SlotRef {
                offset: current.offset,
                capacity: current.capacity,
                key_len: key.len() as u16,
                live_len: payload.len() as u32,
                version,
            }
        } else {
            debug!(path = %path, capacity = current.capacity, "payload outgrew its slot, relocating");
            let moved = self.write_object_slot(&path, payload, reserve, version)?;
            self.free_slot(current.offset, current.capacity)?;
            moved
        };
        if let Some(entry) = self.dir.lookup_mut(&path) {
            *entry = slot_ref;
        }
        Ok(version)
    }

    fn add_or_update(&mut self, raw: &str, payload: &[u8], reserve: u32) -> Result<(bool, u32)> {
        let path = StorePath::parse_key(raw, self.case)?;
        if self.dir.lookup(&path).is_some() {
            let version = self.update(raw, payload, reserve)?;
            Ok((false, version))
        } else {
            self.add(raw, payload, reserve)?;
            Ok((true, 1))
        }
    }

    fn read_full(&mut self, raw: &str, last_version: u32, throw_if_not: bool) -> Result<LoadRes> {
        let path = StorePath::parse_key(raw, self.case)?;
        let Some(&entry) = self.dir.lookup(&path) else {
            if throw_if_not {
                return Err(StoreError::NotFound {
                    path: path.as_str().to_owned(),
                });
            }
            return Ok(LoadRes::NotFound);
        };
        if entry.version == last_version {
            return Ok(LoadRes::NoNewData);
        }
        let total = SLOT_HEADER_LEN as usize + entry.key_len as usize + entry.live_len as usize;
        let buf = self.file.read_at(entry.offset, total)?;
        let header = SlotHeader::decode(&buf)?;
        if header.state != SlotState::Used
            || header.version != entry.version
            || header.path_len != entry.key_len
            || header.payload_len != entry.live_len
        {
            return Err(StoreError::Corrupt(format!(
                "slot at offset {} does not match the directory entry for {path}",
                entry.offset
            )));
        }
        let bytes = buf[SLOT_HEADER_LEN as usize + entry.key_len as usize..].to_vec();
        Ok(LoadRes::NewData {
            version: entry.version,
            bytes,
        })
    }

    fn delete(&mut self, raw: &str) -> Result<()> {
        let path = StorePath::parse_key(raw, self.case)?;
        let slot_ref = self.dir.remove(&path).ok_or_else(|| StoreError::NotFound {
            path: path.as_str().to_owned(),
        })?;
        self.free_slot(slot_ref.offset, slot_ref.capacity)
    }

    fn delete_if_exists(&mut self, raw: &str) -> Result<bool> {
        match self.delete(raw) {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_scope(&mut self, raw: &str) -> Result<usize> {
        let scope = StorePath::parse_scope(raw, self.case)?;
        let freed = self.dir.remove_scope(&scope);
        let count = freed.len();
        for slot_ref in freed {
            self.free_slot(slot_ref.offset, slot_ref.capacity)?;
        }
        if count > 0 {
            debug!(scope = raw, count, "deleted scope");
        }
        Ok(count)
    }

    fn backup(&mut self) -> Result<PathBuf> {
        self.file.flush()?;
        let file_path = self.file.path().to_owned();
        let stem = file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store");
        let parent = match file_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let dest = parent.join(format!("{stem}_{stamp}.{STORE_SUFFIX}"));
        self.file.copy_to(&dest)?;
        self.last_backup = Some(SystemTime::now());
        info!(backup = %dest.display(), "store backed up");
        Ok(dest)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::Arc;

    fn open_fresh(dir: &Path, name: &str) -> ObjStore {
        let (store, created) = ObjStore::open(dir, name, StoreFlags::default()).unwrap();
        assert!(created);
        store
    }

    fn slot_offset(store: &ObjStore, raw: &str) -> u64 {
        let mut guard = store.inner.lock().unwrap();
        match &mut *guard {
            State::Ready(s) => {
                let p = StorePath::parse_key(raw, s.case).unwrap();
                s.dir.lookup(&p).unwrap().offset
            }
            _ => panic!("store not ready"),
        }
    }

    fn sorted(mut v: Vec<String>) -> Vec<String> {
        v.sort();
        v
    }

    #[test]
    fn test_create_write_read_reopen() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let area = b"10,10,512,480";
        {
            let store = open_fresh(tmp.path(), "test1");
            assert_eq!(store.object_count()?, 0);
            store.add("/LastPos/Main", area, 0)?;
            assert_eq!(store.object_count()?, 1);
            let (version, bytes) = store.read("/LastPos/Main", 0)?.unwrap();
            assert_eq!(version, 1);
            assert_eq!(bytes, area);
            store.close()?;
        }
        let (store, created) = ObjStore::open(tmp.path(), "test1", StoreFlags::default())?;
        assert!(!created);
        let (version, bytes) = store.read("/LastPos/Main", 0)?.unwrap();
        assert_eq!(version, 1);
        assert_eq!(bytes, area);
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_version_gating() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "gate");
        store.add("/LastPos/Main", b"10,10,512,480", 0)?;

        // caller already has version 1, so nothing comes back
        assert_eq!(store.read("/LastPos/Main", 1)?, None);
        assert_eq!(
            store.read_full("/LastPos/Main", 1, true)?,
            LoadRes::NoNewData
        );

        let v = store.update("/LastPos/Main", b"24,34,512,480")?;
        assert_eq!(v, 2);
        let (version, bytes) = store.read("/LastPos/Main", 1)?.unwrap();
        assert_eq!(version, 2);
        assert_eq!(bytes, b"24,34,512,480");

        // missing keys: error by default, a value when asked nicely
        assert!(matches!(
            store.read("/LastPos/Gone", 0),
            Err(StoreError::NotFound { .. })
        ));
        assert_eq!(
            store.read_full("/LastPos/Gone", 0, false)?,
            LoadRes::NotFound
        );
        Ok(())
    }

    #[test]
    fn test_versions_climb_one_at_a_time() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "vers");
        store.add("/counter", b"0", 0)?;
        for expect in 2..=20u32 {
            let v = store.update("/counter", format!("{expect}").as_bytes())?;
            assert_eq!(v, expect);
        }
        assert_eq!(store.key_version("/counter")?, Some(20));
        Ok(())
    }

    #[test]
    fn test_add_conflicts_and_bad_paths() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "conf");
        store.add("/A/x", b"1", 0)?;

        assert!(matches!(
            store.add("/a/X", b"2", 0),
            Err(StoreError::AlreadyExists { .. })
        ));
        // "/A" is now a scope, and "/A/x" is a key; neither name is free
        assert!(matches!(
            store.add("/A", b"2", 0),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert!(matches!(
            store.add("/A/x/deeper", b"2", 0),
            Err(StoreError::AlreadyExists { .. })
        ));

        for bad in ["noslash", "/a//b", "/trailing/", "/"] {
            assert!(matches!(
                store.add(bad, b"x", 0),
                Err(StoreError::InvalidPath { .. })
            ));
        }
        // a failed add leaves nothing behind
        assert_eq!(store.object_count()?, 1);
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_reserve_amortizes_growth() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "res");

        // key sized so header + key + payload + reserve lands over the
        // minimum slot: capacity is granted exactly
        let key = "/S3/StringValue";
        let mut value = String::from("1");
        store.add(key, value.as_bytes(), 32)?;
        let home = slot_offset(&store, key);

        for _ in 0..32 {
            value.push('x');
            store.update(key, value.as_bytes())?;
        }
        // 32 appends fit inside the reserve without moving
        assert_eq!(slot_offset(&store, key), home);

        // the 33rd overflows the slot and relocates the object
        value.push('x');
        store.update(key, value.as_bytes())?;
        let moved = slot_offset(&store, key);
        assert_ne!(moved, home);

        // the vacated slot is free space; an add of the same shape
        // lands right back in it
        store.add("/S3/OtherString", b"1", 32)?;
        assert_eq!(slot_offset(&store, "/S3/OtherString"), home);
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_scope_enumeration() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "scopes");
        for key in ["/A/x", "/A/y", "/A/B/z", "/A/B/C/w"] {
            store.add(key, b"v", 0)?;
        }

        assert_eq!(sorted(store.keys_in_scope("/A")?), vec!["x", "y"]);
        assert_eq!(store.subscopes_in_scope("/A")?, vec!["B"]);
        assert_eq!(
            sorted(store.all_objects_under("/A")?),
            vec!["/A/B/C/w", "/A/B/z", "/A/x", "/A/y"]
        );
        assert_eq!(store.find_name_under("z", "/")?, vec!["/A/B/z"]);
        assert!(matches!(
            store.find_name_under("a/b", "/"),
            Err(StoreError::InvalidPath { .. })
        ));

        // recursive walk through subscopes visits exactly the objects
        // that all_objects_under reports
        fn walk(store: &ObjStore, scope: &str, out: &mut Vec<String>) -> Result<()> {
            let prefix = if scope == "/" { "" } else { scope };
            for leaf in store.keys_in_scope(scope)? {
                out.push(format!("{prefix}/{leaf}"));
            }
            for sub in store.subscopes_in_scope(scope)? {
                let child = if scope == "/" {
                    format!("/{sub}")
                } else {
                    format!("{scope}/{sub}")
                };
                walk(store, &child, out)?;
            }
            Ok(())
        }
        let mut walked = Vec::new();
        walk(&store, "/", &mut walked)?;
        assert_eq!(sorted(walked), sorted(store.all_objects_under("/")?));
        Ok(())
    }

    #[test]
    fn test_delete_and_space_reuse() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "churn");
        let payload = vec![0xA5u8; 300];

        for i in 0..512 {
            store.add(&format!("/bulk/e{i:03}"), &payload, 0)?;
        }
        store.flush_to_disk()?;
        let full_len = fs::metadata(tmp.path().join(format!("churn.{STORE_SUFFIX}")))?.len();

        for i in (0..512).step_by(2) {
            store.delete(&format!("/bulk/e{i:03}"))?;
        }
        for i in 0..256 {
            store.add(&format!("/bulk/n{i:03}"), &payload, 0)?;
        }
        store.flush_to_disk()?;
        let len_after = fs::metadata(tmp.path().join(format!("churn.{STORE_SUFFIX}")))?.len();

        // the new objects fit exactly in the freed slots
        assert_eq!(len_after, full_len);
        assert_eq!(store.object_count()?, 512);
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_delete_semantics() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "del");
        store.add("/a/one", b"1", 0)?;

        store.delete("/a/one")?;
        assert!(!store.key_exists("/a/one")?);
        assert!(matches!(
            store.read("/a/one", 0),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete("/a/one"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(!store.delete_if_exists("/a/one")?);

        // versions restart after re-creation
        store.add("/a/one", b"again", 0)?;
        assert_eq!(store.key_version("/a/one")?, Some(1));
        Ok(())
    }

    #[test]
    fn test_delete_scope() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "delscope");
        for key in ["/A/x", "/A/B/z", "/Keep/k"] {
            store.add(key, b"v", 0)?;
        }
        assert_eq!(store.delete_scope("/A")?, 2);
        assert_eq!(store.all_keys()?, vec!["/Keep/k"]);
        assert_eq!(store.delete_scope("/A")?, 0);
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_reopen_preserves_everything() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut expected: HashMap<String, (u32, Vec<u8>)> = HashMap::new();
        {
            let store = open_fresh(tmp.path(), "stable");
            for i in 0..20 {
                let key = format!("/cfg/group{}/item{i}", i % 3);
                store.add(&key, format!("value {i}").as_bytes(), 8)?;
                let mut version = 1;
                for bump in 0..(i % 4) {
                    version = store.update(&key, format!("value {i}.{bump}").as_bytes())?;
                }
                let (_, bytes) = store.read(&key, 0)?.unwrap();
                expected.insert(key, (version, bytes));
            }
            store.close()?;
        }

        let (store, created) = ObjStore::open(tmp.path(), "stable", StoreFlags::default())?;
        assert!(!created);
        assert_eq!(store.object_count()?, expected.len());
        for (key, (version, bytes)) in &expected {
            let (got_version, got_bytes) = store.read(key, 0)?.unwrap();
            assert_eq!(got_version, *version, "{key}");
            assert_eq!(&got_bytes, bytes, "{key}");
        }
        store.validate()?;
        Ok(())
    }

    #[test]
    fn test_case_modes() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        {
            let store = open_fresh(tmp.path(), "insens");
            store.add("/Windows/Main", b"1", 0)?;
            let (_, bytes) = store.read("/windows/MAIN", 0)?.unwrap();
            assert_eq!(bytes, b"1");
            store.close()?;
        }
        // reopening with the other case flag is refused
        let sensitive = StoreFlags {
            case_sensitive: true,
            ..Default::default()
        };
        assert!(matches!(
            ObjStore::open(tmp.path(), "insens", sensitive),
            Err(StoreError::Corrupt(_))
        ));

        let (store, _) = ObjStore::open(tmp.path(), "sens", sensitive)?;
        store.add("/Windows/Main", b"1", 0)?;
        store.add("/windows/main", b"2", 0)?;
        assert_eq!(store.object_count()?, 2);
        assert!(matches!(
            store.read("/WINDOWS/MAIN", 0),
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_close_semantics() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "closing");
        store.add("/a/one", b"1", 0)?;
        store.close()?;
        store.close()?;
        assert!(matches!(store.add("/a/two", b"2", 0), Err(StoreError::NotReady)));
        assert!(matches!(store.read("/a/one", 0), Err(StoreError::NotReady)));

        // the file handle is released, so the same store can be opened again
        let (store, created) = ObjStore::open(tmp.path(), "closing", StoreFlags::default())?;
        assert!(!created);
        assert!(store.key_exists("/a/one")?);
        Ok(())
    }

    #[test]
    fn test_backup_copies_the_store() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "bak");
        store.add("/cfg/a", b"payload a", 4)?;
        store.add("/cfg/b", b"payload b", 4)?;
        assert_eq!(store.last_backup()?, None);

        let backup_path = store.backup()?;
        assert!(store.last_backup()?.is_some());
        assert_eq!(
            fs::read(&backup_path)?,
            fs::read(tmp.path().join(format!("bak.{STORE_SUFFIX}")))?
        );

        // the copy is a store in its own right
        store.close()?;
        let backup_name = backup_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap()
            .to_owned();
        let (copy, created) = ObjStore::open(tmp.path(), &backup_name, StoreFlags::default())?;
        assert!(!created);
        let (_, bytes) = copy.read("/cfg/a", 0)?.unwrap();
        assert_eq!(bytes, b"payload a");
        Ok(())
    }

    #[test]
    fn test_corruption_mid_operation_poisons() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = open_fresh(tmp.path(), "poison");
        store.add("/a/one", b"1111", 0)?;
        store.flush_to_disk()?;

        // shred the slot header behind the engine's back
        let path = tmp.path().join(format!("poison.{STORE_SUFFIX}"));
        let mut raw = fs::OpenOptions::new().write(true).open(&path)?;
        raw.seek(SeekFrom::Start(FILE_HEADER_LEN))?;
        raw.write_all(&[0u8; 20])?;
        raw.sync_all()?;

        assert!(matches!(
            store.read("/a/one", 0),
            Err(StoreError::Corrupt(_))
        ));
        // poisoned now: even a lookup that needs no disk access refuses
        assert!(matches!(
            store.key_exists("/a/one"),
            Err(StoreError::Corrupt(_))
        ));
        store.close()?;

        assert!(matches!(
            ObjStore::open(tmp.path(), "poison", StoreFlags::default()),
            Err(StoreError::Corrupt(_))
        ));
        let recover = StoreFlags {
            recover: true,
            ..Default::default()
        };
        let (store, _) = ObjStore::open(tmp.path(), "poison", recover)?;
        assert!(!store.key_exists("/a/one")?);
        Ok(())
    }

    #[test]
    fn test_threads_on_disjoint_keys() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(open_fresh(tmp.path(), "mt1"));
        const THREADS: u64 = 4;
        const KEYS: u64 = 8;
        const OPS: u64 = 150;

        let finals: Vec<HashMap<String, Vec<u8>>> = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for t in 0..THREADS {
                let store = Arc::clone(&store);
                handles.push(scope.spawn(move || {
                    let rng = fastrand::Rng::with_seed(0xC0FFEE + t);
                    let mut mine: HashMap<String, Vec<u8>> = HashMap::new();
                    for i in 0..OPS {
                        let key = format!("/t{t}/k{}", rng.u64(0..KEYS));
                        match rng.u64(0..10) {
                            0 => {
                                store.delete_if_exists(&key).unwrap();
                                mine.remove(&key);
                            }
                            1..=4 => {
                                let value =
                                    format!("t{t} i{i} {}", "x".repeat(rng.usize(0..200)));
                                store
                                    .add_or_update(&key, value.as_bytes(), 16)
                                    .unwrap();
                                mine.insert(key, value.into_bytes());
                            }
                            _ => {
                                let got = store.read_full(&key, 0, false).unwrap();
                                match (&got, mine.get(&key)) {
                                    (LoadRes::NewData { bytes, .. }, Some(want)) => {
                                        assert_eq!(bytes, want)
                                    }
                                    (LoadRes::NotFound, None) => {}
                                    other => panic!("mismatch for {key}: {other:?}"),
                                }
                            }
                        }
                    }
                    mine
                }));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let report = store.validate()?;
        let live: usize = finals.iter().map(|m| m.len()).sum();
        assert_eq!(report.used_slots, live);
        for mine in &finals {
            for (key, want) in mine {
                let (_, bytes) = store.read(key, 0)?.unwrap();
                assert_eq!(&bytes, want, "{key}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_threads_contending_on_shared_keys() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = Arc::new(open_fresh(tmp.path(), "mt2"));

        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    let rng = fastrand::Rng::with_seed(0xBEEF + t);
                    for i in 0..200u64 {
                        let key = format!("/shared/k{}", rng.u64(0..5));
                        let res: Result<()> = match rng.u64(0..4) {
                            0 => store.add(&key, b"fresh", 8).map(drop).or_else(|e| {
                                match e {
                                    StoreError::AlreadyExists { .. } => Ok(()),
                                    other => Err(other),
                                }
                            }),
                            1 => store
                                .update(&key, format!("t{t} i{i}").as_bytes())
                                .map(drop)
                                .or_else(|e| match e {
                                    StoreError::NotFound { .. } => Ok(()),
                                    other => Err(other),
                                }),
                            2 => store.delete_if_exists(&key).map(drop),
                            _ => store.read_full(&key, 0, false).map(drop),
                        };
                        // contention produces benign errors only, never
                        // corruption
                        res.unwrap();
                    }
                });
            }
        });

        let keys = store.all_keys()?;
        for i in 0..5 {
            let key = format!("/shared/k{i}");
            assert_eq!(store.key_exists(&key)?, keys.contains(&key), "{key}");
        }
        store.validate()?;
        Ok(())
    }
}
