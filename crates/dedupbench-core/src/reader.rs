//! Sequential and random-access block reads over a source file

use crate::error::{DedupError, Result};
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads a source file block by block.
///
/// The sequential cursor only moves through [`BlockReader::read_next`];
/// [`BlockReader::read_at`] restores it after seeking elsewhere.
#[derive(Debug)]
pub struct BlockReader {
    file: File,
    path: PathBuf,
    size: u64,
    position: u64,
}

impl BlockReader {
    /// Open `path` for reading. Fails with `FileUnavailable`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |source| DedupError::FileUnavailable {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(unavailable)?;
        let meta = file.metadata().map_err(unavailable)?;
        if meta.is_dir() {
            return Err(unavailable(std::io::Error::new(
                ErrorKind::InvalidInput,
                "is a directory",
            )));
        }
        debug!(path = %path.display(), size = meta.len(), "opened source");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: meta.len(),
            position: 0,
        })
    }

    /// Read up to `n` bytes at the cursor and advance it. Returns fewer than
    /// `n` bytes only when the end of the file is reached.
    pub fn read_next(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; clamp(n, self.size.saturating_sub(self.position))];
        let got = fill(&mut self.file, &mut buf)?;
        buf.truncate(got);
        self.position += got as u64;
        Ok(buf)
    }

    /// Read up to `n` bytes starting at `offset` without moving the
    /// sequential cursor. Short only if the file ends before `offset + n`.
    pub fn read_at(&mut self, offset: u64, n: usize) -> Result<Vec<u8>> {
        if offset >= self.size {
            return Ok(Vec::new());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; clamp(n, self.size - offset)];
        let got = fill(&mut self.file, &mut buf);
        self.file.seek(SeekFrom::Start(self.position))?;
        buf.truncate(got?);
        Ok(buf)
    }

    /// True once the cursor has consumed the whole file
    pub fn is_at_end(&self) -> bool {
        self.position >= self.size
    }

    /// File size in bytes, taken when the file was opened
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current cursor position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Path the reader was opened on
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Buffer length for a request of `n` bytes with `remaining` left in the
/// file; the block size alone never drives an allocation.
fn clamp(n: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(n, |left| n.min(left))
}

/// `read` until `buf` is full or EOF, retrying on interrupts.
fn fill(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
