use crate::prelude::*;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Positioned byte i/o over the one file that holds the whole store. The
// engine serializes access, so all of this takes &mut self and nothing here
// worries about interleaving.
//
// We take an exclusive advisory lock on the file for as long as it is open.
// The store is a single-process design, but a second process (or a second
// engine instance in this process) innocently opening the same file would
// silently shred it; the lock turns that into a clean error at open time.

pub struct BackingFile {
    file: File,
    path: PathBuf,
}

impl BackingFile {
    /// Opens or creates the file and locks it. `was_empty` is true for a
    /// brand new (or zero-length) file, which the caller will initialize.
    pub fn open(path: &Path) -> Result<(BackingFile, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive().map_err(|_| {
            StoreError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("store file {} is already open elsewhere", path.display()),
            ))
        })?;
        let was_empty = file.metadata()?.len() == 0;
        Ok((
            BackingFile {
                file,
                path: path.to_owned(),
            },
            was_empty,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Reads exactly `len` bytes at `offset`. A short read is an error.
    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Overwrites at `offset`, growing the file if the write runs past the
    /// current end.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Grows or shrinks the file to exactly `len`; new bytes read as zero.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Forces everything down to durable storage.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Byte-copies the file to `dest`. The copy is staged through a temp
    /// file in the destination directory and renamed into place, so a
    /// half-written copy never appears under the final name.
    pub fn copy_to(&mut self, dest: &Path) -> Result<()> {
        let dir = dest.parent().ok_or_else(|| {
            StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "backup destination has no parent directory",
            ))
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        self.file.seek(SeekFrom::Start(0))?;
        io::copy(&mut self.file, tmp.as_file_mut())?;
        tmp.as_file().sync_data()?;
        tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}
