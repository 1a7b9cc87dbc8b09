//! File-backed message store.
//!
//! The store is a single append-only file. Client chunks are appended as
//! they arrive and the whole file is played back once a message completes.
//! Between sessions the file is unlinked; the next append reopens a fresh
//! file at the same path, so no session ever sees another session's bytes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

pub struct Store {
    path: PathBuf,
    /// Open handle; `None` after a reset until the next append.
    file: Option<File>,
}

impl Store {
    /// Open the store at `path`, discarding whatever a previous run left there.
    ///
    /// Relative paths are resolved against the current directory up front so
    /// later reopens still land in the same place after daemonizing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        remove_if_present(&path)?;
        let file = open_file(&path)?;
        debug!(path = %path.display(), "Store opened");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                trace!(path = %self.path.display(), "Reopening store");
                open_file(&self.path)?
            }
        };
        Ok(self.file.insert(file))
    }

    /// Append raw bytes at the end of the store.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let file = self.handle()?;
        file.write_all(data)?;
        file.flush()
    }

    /// Move the read cursor back to the start of the store.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.handle()?.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Read the next chunk from the current cursor. Returns 0 at end of store.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }

    /// Drop the handle and unlink the file so the next session starts empty.
    pub fn reset(&mut self) -> io::Result<()> {
        self.file = None;
        remove_if_present(&self.path)
    }

    /// Close and delete the store for good.
    pub fn remove(mut self) -> io::Result<()> {
        self.reset()
    }
}

fn open_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
