//! Hash-block trail files.
//!
//! A trail is `ceil(source_size / block_size)` digest records written back to
//! back in source order. There is no header, footer or separator; the record
//! length is the digest size of the algorithm and must be supplied when the
//! trail is read back.

use crate::error::{DedupError, Result};
use crate::fingerprint::{Digest, HashAlgorithm};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Create an output file. With `overwrite` unset an existing file is an
/// `OutputExists` error; with it set the file is truncated.
pub(crate) fn create_output(path: &Path, overwrite: bool) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true);
    if overwrite {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    opts.open(path).map_err(|source| {
        if source.kind() == ErrorKind::AlreadyExists {
            DedupError::OutputExists {
                path: path.to_path_buf(),
            }
        } else {
            DedupError::OutputUnwritable {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

/// Appends digest records to a new trail file.
pub struct TrailWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    record_len: usize,
    records: u64,
}

impl TrailWriter {
    /// Create a fresh trail for digests of `algorithm`.
    pub fn create(path: impl AsRef<Path>, algorithm: HashAlgorithm, overwrite: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = create_output(path, overwrite)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            record_len: algorithm.digest_size(),
            records: 0,
        })
    }

    /// Append exactly one record.
    pub fn append_digest(&mut self, digest: &Digest) -> Result<()> {
        if digest.len() != self.record_len {
            return Err(DedupError::DigestLength {
                found: digest.len(),
                expected: self.record_len,
            });
        }
        self.writer
            .write_all(digest.as_bytes())
            .map_err(|source| self.unwritable(source))?;
        self.records += 1;
        Ok(())
    }

    /// Flush and sync the trail, returning the record count.
    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush().map_err(|source| self.unwritable(source))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|source| self.unwritable(source))?;
        Ok(self.records)
    }

    fn unwritable(&self, source: std::io::Error) -> DedupError {
        DedupError::OutputUnwritable {
            path: self.path.clone(),
            source,
        }
    }
}

/// Reads digest records back from a trail file.
pub struct TrailReader {
    reader: BufReader<File>,
    path: PathBuf,
    record_len: usize,
    file_len: u64,
    offset: u64,
}

impl TrailReader {
    /// Open a trail written with `algorithm`.
    pub fn open(path: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<Self> {
        let path = path.as_ref();
        let unavailable = |source| DedupError::FileUnavailable {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(unavailable)?;
        let file_len = file.metadata().map_err(unavailable)?.len();
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            record_len: algorithm.digest_size(),
            file_len,
            offset: 0,
        })
    }

    /// Number of whole records the file holds
    pub fn expected_records(&self) -> u64 {
        self.file_len / self.record_len as u64
    }

    /// Read the next record. `Ok(None)` at a clean end of file; a partial
    /// trailing record is a `CorruptTrail` error.
    pub fn next_digest(&mut self) -> Result<Option<Digest>> {
        let mut buf = [0u8; crate::fingerprint::MAX_DIGEST_LEN];
        let record = &mut buf[..self.record_len];
        let mut filled = 0;
        while filled < record.len() {
            match self.reader.read(&mut record[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(DedupError::Io(e)),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < self.record_len {
            return Err(DedupError::CorruptTrail {
                path: self.path.clone(),
                offset: self.offset,
                found: filled,
                expected: self.record_len,
            });
        }
        self.offset += filled as u64;
        Ok(Digest::from_slice(record))
    }

    /// Path of the trail
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::digest;

    #[test]
    fn records_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.hb");
        let digests: Vec<Digest> = (0..5u8)
            .map(|i| digest(&[i; 10], HashAlgorithm::Sha1))
            .collect();

        let mut w = TrailWriter::create(&path, HashAlgorithm::Sha1, false).unwrap();
        for d in &digests {
            w.append_digest(d).unwrap();
        }
        assert_eq!(w.finish().unwrap(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5 * 20);

        let mut r = TrailReader::open(&path, HashAlgorithm::Sha1).unwrap();
        assert_eq!(r.expected_records(), 5);
        let mut back = Vec::new();
        while let Some(d) = r.next_digest().unwrap() {
            back.push(d);
        }
        assert_eq!(back, digests);
    }

    #[test]
    fn partial_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.hb");
        std::fs::write(&path, [7u8; 16 + 5]).unwrap();
        let mut r = TrailReader::open(&path, HashAlgorithm::Md5).unwrap();
        assert!(r.next_digest().unwrap().is_some());
        match r.next_digest() {
            Err(DedupError::CorruptTrail {
                offset,
                found,
                expected,
                ..
            }) => {
                assert_eq!(offset, 16);
                assert_eq!(found, 5);
                assert_eq!(expected, 16);
            }
            other => panic!("expected CorruptTrail, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn existing_output_rejected_unless_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.hb");
        std::fs::write(&path, b"old").unwrap();
        assert!(matches!(
            TrailWriter::create(&path, HashAlgorithm::Md5, false),
            Err(DedupError::OutputExists { .. })
        ));
        let w = TrailWriter::create(&path, HashAlgorithm::Md5, true).unwrap();
        assert_eq!(w.finish().unwrap(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn unwritable_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("t.hb");
        assert!(matches!(
            TrailWriter::create(&path, HashAlgorithm::Md5, false),
            Err(DedupError::OutputUnwritable { .. })
        ));
    }

    #[test]
    fn wrong_digest_length_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = TrailWriter::create(dir.path().join("t.hb"), HashAlgorithm::Md5, false).unwrap();
        let d = digest(b"x", HashAlgorithm::Sha256);
        assert!(matches!(
            w.append_digest(&d),
            Err(DedupError::DigestLength { found: 32, expected: 16 })
        ));
    }
}
