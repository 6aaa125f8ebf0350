//! On-disk spooling of streamed transactions.
//!
//! Changes of a streamed transaction that cannot be applied right away are
//! appended to `{subid}-{xid}.changes` inside a per-worker [`FileSet`]
//! directory. Each record is a little-endian `u32` length (body + 1), the
//! action byte and the message body (everything after the action byte, so
//! the streamed subtransaction xid stays in place). A sidecar
//! `{subid}-{xid}.subxacts` remembers where each subtransaction's changes
//! start, so a subtransaction abort can truncate them away.
//!
//! Files are never fsynced: the fileset is thrown away when the worker
//! exits, and a restarted worker gets the whole transaction streamed again.

use crate::error::{ApplyError, Result};
use crate::types::{Oid, TransactionId};
use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A directory of temporary files owned by one worker; removed on drop.
#[derive(Debug)]
pub struct FileSet {
    dir: PathBuf,
}

impl FileSet {
    /// Creates `base/name`, clearing leftovers of a previous incarnation.
    pub fn create(base: &Path, name: &str) -> Result<Self> {
        let dir = base.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "created spool fileset");
        Ok(Self { dir })
    }

    /// The directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for FileSet {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "could not remove spool fileset");
            }
        }
    }
}

/// Changes file name of `(subid, xid)`.
pub fn changes_file_name(subid: Oid, xid: TransactionId) -> String {
    format!("{subid}-{xid}.changes")
}

/// Subxact file name of `(subid, xid)`.
pub fn subxacts_file_name(subid: Oid, xid: TransactionId) -> String {
    format!("{subid}-{xid}.subxacts")
}

/// Where a subtransaction's changes start in the changes file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubXactInfo {
    /// Subtransaction xid.
    pub xid: TransactionId,
    /// File segment number; always 0 for our single-segment files.
    pub fileno: u32,
    /// Byte offset of its first change.
    pub offset: u64,
}

const SUBXACT_ENTRY_SIZE: usize = 16;

/// Writes the subxact file; an empty list removes it.
pub fn subxact_info_write(fileset: &FileSet, subid: Oid, xid: TransactionId, subxacts: &[SubXactInfo]) -> Result<()> {
    let path = fileset.path(&subxacts_file_name(subid, xid));
    if subxacts.is_empty() {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }
    let mut buf = Vec::with_capacity(4 + subxacts.len() * SUBXACT_ENTRY_SIZE);
    buf.extend_from_slice(&(subxacts.len() as u32).to_le_bytes());
    for s in subxacts {
        buf.extend_from_slice(&s.xid.to_le_bytes());
        buf.extend_from_slice(&s.fileno.to_le_bytes());
        buf.extend_from_slice(&s.offset.to_le_bytes());
    }
    fs::write(&path, buf)?;
    Ok(())
}

/// Reads the subxact file; a missing file means no subtransactions.
pub fn subxact_info_read(fileset: &FileSet, subid: Oid, xid: TransactionId) -> Result<Vec<SubXactInfo>> {
    let path = fileset.path(&subxacts_file_name(subid, xid));
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let truncated = || ApplyError::SpoolTruncated {
        path: path.display().to_string(),
    };
    let count_bytes: [u8; 4] = data.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(truncated)?;
    let count = u32::from_le_bytes(count_bytes) as usize;
    let entries = data.get(4..).ok_or_else(truncated)?;
    if entries.len() != count * SUBXACT_ENTRY_SIZE {
        return Err(truncated());
    }
    Ok(entries
        .chunks_exact(SUBXACT_ENTRY_SIZE)
        .map(|e| SubXactInfo {
            xid: u32::from_le_bytes([e[0], e[1], e[2], e[3]]),
            fileno: u32::from_le_bytes([e[4], e[5], e[6], e[7]]),
            offset: u64::from_le_bytes([e[8], e[9], e[10], e[11], e[12], e[13], e[14], e[15]]),
        })
        .collect())
}

/// Removes both files of `(subid, xid)`.
pub fn cleanup_files(fileset: &FileSet, subid: Oid, xid: TransactionId) -> Result<()> {
    for name in [changes_file_name(subid, xid), subxacts_file_name(subid, xid)] {
        match fs::remove_file(fileset.path(&name)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Iterator over the records of a changes file.
#[derive(Debug)]
pub struct SpoolReader {
    path: PathBuf,
    reader: BufReader<File>,
    done: bool,
}

impl SpoolReader {
    /// Opens the changes file of `(subid, xid)`.
    pub fn open(fileset: &FileSet, subid: Oid, xid: TransactionId) -> Result<Self> {
        let path = fileset.path(&changes_file_name(subid, xid));
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            done: false,
        })
    }

    fn truncated(&self) -> ApplyError {
        ApplyError::SpoolTruncated {
            path: self.path.display().to_string(),
        }
    }

    fn next_record(&mut self) -> Result<Option<(u8, Bytes)>> {
        let mut len_buf = [0u8; 4];
        let mut got = 0;
        while got < len_buf.len() {
            match self.reader.read(&mut len_buf[got..]) {
                Ok(0) if got == 0 => return Ok(None),
                Ok(0) => return Err(self.truncated()),
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 {
            return Err(self.truncated());
        }
        let mut record = vec![0u8; len];
        self.reader.read_exact(&mut record).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                self.truncated()
            } else {
                e.into()
            }
        })?;
        let action = record[0];
        Ok(Some((action, Bytes::from(record).slice(1..))))
    }
}

impl Iterator for SpoolReader {
    type Item = Result<(u8, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug)]
struct OpenChanges {
    xid: TransactionId,
    writer: BufWriter<File>,
    offset: u64,
}

/// Per-worker spool of streamed transactions.
#[derive(Debug)]
pub struct StreamSpool {
    base_dir: PathBuf,
    name: String,
    subid: Oid,
    fileset: Option<Arc<FileSet>>,
    current: Option<OpenChanges>,
    subxacts: Vec<SubXactInfo>,
    subxact_last: Option<TransactionId>,
}

impl StreamSpool {
    /// A spool whose fileset will be `base_dir/name`, created on first use.
    pub fn new(base_dir: impl Into<PathBuf>, name: impl Into<String>, subid: Oid) -> Self {
        Self {
            base_dir: base_dir.into(),
            name: name.into(),
            subid,
            fileset: None,
            current: None,
            subxacts: Vec::new(),
            subxact_last: None,
        }
    }

    /// The fileset, creating it on first use.
    pub fn fileset(&mut self) -> Result<Arc<FileSet>> {
        if let Some(fs) = &self.fileset {
            return Ok(fs.clone());
        }
        let fs = Arc::new(FileSet::create(&self.base_dir, &self.name)?);
        self.fileset = Some(fs.clone());
        Ok(fs)
    }

    /// The fileset if it was ever created.
    pub fn existing_fileset(&self) -> Option<Arc<FileSet>> {
        self.fileset.clone()
    }

    /// Whether a changes file is open.
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Xid of the open changes file.
    pub fn open_xid(&self) -> Option<TransactionId> {
        self.current.as_ref().map(|c| c.xid)
    }

    /// Opens the changes file of `xid` for appending: created fresh for the
    /// first segment, reopened at its end otherwise. Loads the subxact list.
    pub fn open(&mut self, xid: TransactionId, first_segment: bool) -> Result<()> {
        if let Some(open) = &self.current {
            return Err(ApplyError::invalid_state(format!(
                "spool file of transaction {} is still open",
                open.xid
            )));
        }
        let fileset = self.fileset()?;
        let path = fileset.path(&changes_file_name(self.subid, xid));
        let file = if first_segment {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?
        } else {
            OpenOptions::new().write(true).open(&path)?
        };
        let mut writer = BufWriter::new(file);
        let offset = writer.seek(SeekFrom::End(0))?;
        self.current = Some(OpenChanges { xid, writer, offset });
        self.subxacts = if first_segment {
            Vec::new()
        } else {
            subxact_info_read(&fileset, self.subid, xid)?
        };
        self.subxact_last = None;
        debug!(subid = self.subid, xid, first_segment, "opened spool file");
        Ok(())
    }

    fn open_changes(&mut self) -> Result<&mut OpenChanges> {
        self.current
            .as_mut()
            .ok_or_else(|| ApplyError::invalid_state("no spool file is open"))
    }

    /// Appends one change record.
    pub fn append(&mut self, action: u8, body: &[u8]) -> Result<()> {
        let open = self.open_changes()?;
        let len = u32::try_from(body.len() + 1)
            .map_err(|_| ApplyError::invalid_state("spooled change too large"))?;
        open.writer.write_all(&len.to_le_bytes())?;
        open.writer.write_all(&[action])?;
        open.writer.write_all(body)?;
        open.offset += 4 + u64::from(len);
        Ok(())
    }

    /// Notes that `subxid` starts at the current end of the changes file,
    /// unless it was already seen.
    pub fn record_subxact(&mut self, subxid: TransactionId) -> Result<()> {
        let open = self.open_changes()?;
        let (toplevel, offset) = (open.xid, open.offset);
        if subxid == toplevel || self.subxact_last == Some(subxid) {
            return Ok(());
        }
        self.subxact_last = Some(subxid);
        if self.subxacts.iter().any(|s| s.xid == subxid) {
            return Ok(());
        }
        self.subxacts.push(SubXactInfo {
            xid: subxid,
            fileno: 0,
            offset,
        });
        Ok(())
    }

    /// Flushes and closes the changes file and writes the subxact file.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        open.writer.flush()?;
        let fileset = self.fileset()?;
        subxact_info_write(&fileset, self.subid, open.xid, &self.subxacts)?;
        self.subxacts.clear();
        self.subxact_last = None;
        Ok(())
    }

    /// Flushes buffered records without closing.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(open) = self.current.as_mut() {
            open.writer.flush()?;
        }
        Ok(())
    }

    /// Discards the changes of `subxid` and every later subtransaction of
    /// `xid`. A subtransaction with no recorded changes is a no-op.
    pub fn truncate_after(&mut self, xid: TransactionId, subxid: TransactionId) -> Result<()> {
        let reopened = self.open_xid() != Some(xid);
        if reopened {
            self.open(xid, false)?;
        }
        if let Some(pos) = self.subxacts.iter().rposition(|s| s.xid == subxid) {
            let offset = self.subxacts[pos].offset;
            let open = self.open_changes()?;
            open.writer.flush()?;
            open.writer.get_ref().set_len(offset)?;
            open.writer.seek(SeekFrom::Start(offset))?;
            open.offset = offset;
            self.subxacts.truncate(pos);
            self.subxact_last = None;
            debug!(subid = self.subid, xid, subxid, offset, "truncated spool file");
        }
        if reopened {
            self.close()?;
        }
        Ok(())
    }

    /// Reads back every record of `xid`; the file must be closed.
    pub fn read_all(&mut self, xid: TransactionId) -> Result<SpoolReader> {
        if self.open_xid() == Some(xid) {
            self.close()?;
        }
        let fileset = self.fileset()?;
        SpoolReader::open(&fileset, self.subid, xid)
    }

    /// Deletes both files of `xid`.
    pub fn cleanup(&mut self, xid: TransactionId) -> Result<()> {
        if self.open_xid() == Some(xid) {
            self.current = None;
            self.subxacts.clear();
            self.subxact_last = None;
        }
        if let Some(fileset) = &self.fileset {
            cleanup_files(fileset, self.subid, xid)?;
        }
        Ok(())
    }

    /// Whether a changes file for `xid` exists.
    pub fn exists(&self, xid: TransactionId) -> bool {
        self.fileset
            .as_ref()
            .is_some_and(|fs| fs.path(&changes_file_name(self.subid, xid)).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn records(spool: &mut StreamSpool, xid: TransactionId) -> Vec<(u8, Vec<u8>)> {
        spool
            .read_all(xid)
            .unwrap()
            .map(|r| r.map(|(a, b)| (a, b.to_vec())))
            .collect::<Result<_>>()
            .unwrap()
    }

    #[test]
    fn test_append_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = StreamSpool::new(dir.path(), "w1", 16394);
        spool.open(200, true).unwrap();
        spool.append(b'I', b"one").unwrap();
        spool.append(b'I', b"two").unwrap();
        spool.close().unwrap();
        spool.open(200, false).unwrap();
        spool.append(b'I', b"three").unwrap();
        spool.close().unwrap();

        assert_eq!(
            records(&mut spool, 200),
            vec![
                (b'I', b"one".to_vec()),
                (b'I', b"two".to_vec()),
                (b'I', b"three".to_vec())
            ]
        );
        assert!(spool.exists(200));
        spool.cleanup(200).unwrap();
        assert!(!spool.exists(200));
    }

    #[test]
    fn test_record_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = StreamSpool::new(dir.path(), "w1", 1);
        spool.open(7, true).unwrap();
        spool.append(b'T', &[9, 9]).unwrap();
        spool.close().unwrap();
        let fs = spool.fileset().unwrap();
        let raw = fs::read(fs.dir().join("1-7.changes")).unwrap();
        assert_eq!(raw, vec![3, 0, 0, 0, b'T', 9, 9]);
    }

    #[test]
    fn test_truncated_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = StreamSpool::new(dir.path(), "w1", 1);
        spool.open(7, true).unwrap();
        spool.append(b'I', b"abcdef").unwrap();
        spool.close().unwrap();
        let fs = spool.fileset().unwrap();
        let path = fs.dir().join("1-7.changes");
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 2]).unwrap();
        let result: Result<Vec<_>> = spool.read_all(7).unwrap().collect();
        assert!(matches!(result, Err(ApplyError::SpoolTruncated { .. })));
    }

    #[test]
    fn test_subxact_abort_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = StreamSpool::new(dir.path(), "w1", 1);
        spool.open(300, true).unwrap();
        spool.append(b'I', b"10").unwrap();
        spool.record_subxact(301).unwrap();
        spool.append(b'I', b"11").unwrap();
        spool.record_subxact(301).unwrap();
        spool.append(b'I', b"12").unwrap();
        spool.close().unwrap();

        let fs = spool.fileset().unwrap();
        let subs = subxact_info_read(&fs, 1, 300).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].offset, 7);

        spool.truncate_after(300, 301).unwrap();
        assert_eq!(records(&mut spool, 300), vec![(b'I', b"10".to_vec())]);
        assert!(subxact_info_read(&fs, 1, 300).unwrap().is_empty());

        // Unknown subxact: nothing to undo.
        spool.truncate_after(300, 999).unwrap();
        assert_eq!(records(&mut spool, 300).len(), 1);
    }

    #[test]
    fn test_fileset_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut spool = StreamSpool::new(dir.path(), "w9", 1);
            let fs = spool.fileset().unwrap();
            fs.dir().to_path_buf()
        };
        assert!(!path.exists());
    }

    proptest! {
        #[test]
        fn prop_subxact_info_round_trip(xids in proptest::collection::btree_set(1u32..10_000, 0..20)) {
            let dir = tempfile::tempdir().unwrap();
            let fs = FileSet::create(dir.path(), "p").unwrap();
            let list: Vec<SubXactInfo> = xids
                .iter()
                .enumerate()
                .map(|(i, x)| SubXactInfo { xid: *x, fileno: 0, offset: i as u64 * 11 })
                .collect();
            subxact_info_write(&fs, 5, 1, &list).unwrap();
            prop_assert_eq!(subxact_info_read(&fs, 5, 1).unwrap(), list);
        }

        #[test]
        fn prop_aborted_subxact_leaves_no_trace(
            before in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..6),
            aborted in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 1..6),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut with = StreamSpool::new(dir.path(), "a", 1);
            let mut without = StreamSpool::new(dir.path(), "b", 1);
            with.open(50, true).unwrap();
            without.open(50, true).unwrap();
            for body in &before {
                with.append(b'I', body).unwrap();
                without.append(b'I', body).unwrap();
            }
            with.record_subxact(51).unwrap();
            for body in &aborted {
                with.append(b'I', body).unwrap();
            }
            with.close().unwrap();
            without.close().unwrap();
            with.truncate_after(50, 51).unwrap();

            let a = fs::read(with.fileset().unwrap().dir().join("1-50.changes")).unwrap();
            let b = fs::read(without.fileset().unwrap().dir().join("1-50.changes")).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
