//! Append-only write-ahead log.
//!
//! Record framing: `[len u32][crc32 u32][type u8][payload]`, CRC over
//! type + payload. A batch is effective only once its `CommitBatch` record is
//! present; recovery discards any trailing incomplete batch, treats a CRC
//! mismatch or short read as end-of-log, and refuses unknown record types.

use crate::property::{decode_value, encode_value};
use crate::{Error, PAGE_SIZE, PropertyValue, Result};
use crc32fast::Hasher;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAX_WAL_RECORD_LEN: u32 = 2 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    BeginBatch { seq: u64, tx_id: String },
    CommitBatch { seq: u64 },
    AddEdge { src: u32, rel: u32, dst: u32 },
    DeleteEdge { src: u32, rel: u32, dst: u32 },
    CreateNode { external_id: u64, internal_id: u32 },
    AssignLabel { node: u32, label: u32 },
    RemoveLabel { node: u32, label: u32 },
    CreateSymbol { name: String, id: u32 },
    SetNodeProperty { node: u32, key: String, value: PropertyValue },
    SetEdgeProperty { src: u32, rel: u32, dst: u32, key: String, value: PropertyValue },
    TombstoneNode { node: u32 },
    PageWrite { page_id: u32, page: Box<[u8; PAGE_SIZE]> },
    ManifestSwitch { epoch: u64 },
    Checkpoint {
        epoch: u64,
        next_internal_id: u32,
        next_symbol_id: u32,
        manifest_revision: u64,
    },
}

impl WalRecord {
    fn record_type(&self) -> u8 {
        match self {
            WalRecord::BeginBatch { .. } => 1,
            WalRecord::CommitBatch { .. } => 2,
            WalRecord::AddEdge { .. } => 3,
            WalRecord::DeleteEdge { .. } => 4,
            WalRecord::CreateNode { .. } => 5,
            WalRecord::AssignLabel { .. } => 6,
            WalRecord::RemoveLabel { .. } => 7,
            WalRecord::CreateSymbol { .. } => 8,
            WalRecord::SetNodeProperty { .. } => 9,
            WalRecord::SetEdgeProperty { .. } => 10,
            WalRecord::TombstoneNode { .. } => 11,
            WalRecord::PageWrite { .. } => 12,
            WalRecord::ManifestSwitch { .. } => 13,
            WalRecord::Checkpoint { .. } => 14,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(self.record_type());
        match self {
            WalRecord::BeginBatch { seq, tx_id } => {
                out.extend_from_slice(&seq.to_le_bytes());
                push_str(&mut out, tx_id);
            }
            WalRecord::CommitBatch { seq } => {
                out.extend_from_slice(&seq.to_le_bytes());
            }
            WalRecord::AddEdge { src, rel, dst } | WalRecord::DeleteEdge { src, rel, dst } => {
                out.extend_from_slice(&src.to_le_bytes());
                out.extend_from_slice(&rel.to_le_bytes());
                out.extend_from_slice(&dst.to_le_bytes());
            }
            WalRecord::CreateNode { external_id, internal_id } => {
                out.extend_from_slice(&external_id.to_le_bytes());
                out.extend_from_slice(&internal_id.to_le_bytes());
            }
            WalRecord::AssignLabel { node, label } | WalRecord::RemoveLabel { node, label } => {
                out.extend_from_slice(&node.to_le_bytes());
                out.extend_from_slice(&label.to_le_bytes());
            }
            WalRecord::CreateSymbol { name, id } => {
                out.extend_from_slice(&id.to_le_bytes());
                push_str(&mut out, name);
            }
            WalRecord::SetNodeProperty { node, key, value } => {
                out.extend_from_slice(&node.to_le_bytes());
                push_str(&mut out, key);
                out.extend_from_slice(&encode_value(value));
            }
            WalRecord::SetEdgeProperty { src, rel, dst, key, value } => {
                out.extend_from_slice(&src.to_le_bytes());
                out.extend_from_slice(&rel.to_le_bytes());
                out.extend_from_slice(&dst.to_le_bytes());
                push_str(&mut out, key);
                out.extend_from_slice(&encode_value(value));
            }
            WalRecord::TombstoneNode { node } => {
                out.extend_from_slice(&node.to_le_bytes());
            }
            WalRecord::PageWrite { page_id, page } => {
                out.extend_from_slice(&page_id.to_le_bytes());
                out.extend_from_slice(page.as_ref());
            }
            WalRecord::ManifestSwitch { epoch } => {
                out.extend_from_slice(&epoch.to_le_bytes());
            }
            WalRecord::Checkpoint {
                epoch,
                next_internal_id,
                next_symbol_id,
                manifest_revision,
            } => {
                out.extend_from_slice(&epoch.to_le_bytes());
                out.extend_from_slice(&next_internal_id.to_le_bytes());
                out.extend_from_slice(&next_symbol_id.to_le_bytes());
                out.extend_from_slice(&manifest_revision.to_le_bytes());
            }
        }
        out
    }

    fn decode_body(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Err(Error::WalProtocol("empty record body"));
        }
        let ty = body[0];
        let payload = &body[1..];

        match ty {
            1 => {
                if payload.len() < 8 + 4 {
                    return Err(Error::WalProtocol("short BeginBatch payload"));
                }
                let seq = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let (tx_id, rest) = take_str(&payload[8..])?;
                if !rest.is_empty() {
                    return Err(Error::WalProtocol("trailing bytes in BeginBatch"));
                }
                Ok(WalRecord::BeginBatch { seq, tx_id })
            }
            2 => {
                if payload.len() != 8 {
                    return Err(Error::WalProtocol("invalid CommitBatch payload"));
                }
                let seq = u64::from_le_bytes(payload.try_into().unwrap());
                Ok(WalRecord::CommitBatch { seq })
            }
            3 | 4 => {
                if payload.len() != 12 {
                    return Err(Error::WalProtocol("invalid edge payload"));
                }
                let src = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let rel = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                let dst = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                if ty == 3 {
                    Ok(WalRecord::AddEdge { src, rel, dst })
                } else {
                    Ok(WalRecord::DeleteEdge { src, rel, dst })
                }
            }
            5 => {
                if payload.len() != 12 {
                    return Err(Error::WalProtocol("invalid CreateNode payload"));
                }
                let external_id = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let internal_id = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                Ok(WalRecord::CreateNode { external_id, internal_id })
            }
            6 | 7 => {
                if payload.len() != 8 {
                    return Err(Error::WalProtocol("invalid label payload"));
                }
                let node = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let label = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                if ty == 6 {
                    Ok(WalRecord::AssignLabel { node, label })
                } else {
                    Ok(WalRecord::RemoveLabel { node, label })
                }
            }
            8 => {
                if payload.len() < 8 {
                    return Err(Error::WalProtocol("short CreateSymbol payload"));
                }
                let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let (name, rest) = take_str(&payload[4..])?;
                if !rest.is_empty() {
                    return Err(Error::WalProtocol("trailing bytes in CreateSymbol"));
                }
                Ok(WalRecord::CreateSymbol { name, id })
            }
            9 => {
                if payload.len() < 8 {
                    return Err(Error::WalProtocol("short SetNodeProperty payload"));
                }
                let node = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let (key, rest) = take_str(&payload[4..])?;
                let value = decode_value(rest)?;
                Ok(WalRecord::SetNodeProperty { node, key, value })
            }
            10 => {
                if payload.len() < 16 {
                    return Err(Error::WalProtocol("short SetEdgeProperty payload"));
                }
                let src = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let rel = u32::from_le_bytes(payload[4..8].try_into().unwrap());
                let dst = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                let (key, rest) = take_str(&payload[12..])?;
                let value = decode_value(rest)?;
                Ok(WalRecord::SetEdgeProperty { src, rel, dst, key, value })
            }
            11 => {
                if payload.len() != 4 {
                    return Err(Error::WalProtocol("invalid TombstoneNode payload"));
                }
                let node = u32::from_le_bytes(payload.try_into().unwrap());
                Ok(WalRecord::TombstoneNode { node })
            }
            12 => {
                if payload.len() != 4 + PAGE_SIZE {
                    return Err(Error::WalProtocol("invalid PageWrite payload"));
                }
                let page_id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
                let mut page = Box::new([0u8; PAGE_SIZE]);
                page.as_mut_slice().copy_from_slice(&payload[4..]);
                Ok(WalRecord::PageWrite { page_id, page })
            }
            13 => {
                if payload.len() != 8 {
                    return Err(Error::WalProtocol("invalid ManifestSwitch payload"));
                }
                let epoch = u64::from_le_bytes(payload.try_into().unwrap());
                Ok(WalRecord::ManifestSwitch { epoch })
            }
            14 => {
                if payload.len() != 8 + 4 + 4 + 8 {
                    return Err(Error::WalProtocol("invalid Checkpoint payload"));
                }
                let epoch = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                let next_internal_id = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                let next_symbol_id = u32::from_le_bytes(payload[12..16].try_into().unwrap());
                let manifest_revision = u64::from_le_bytes(payload[16..24].try_into().unwrap());
                Ok(WalRecord::Checkpoint {
                    epoch,
                    next_internal_id,
                    next_symbol_id,
                    manifest_revision,
                })
            }
            other => Err(Error::UnknownWalRecord(other)),
        }
    }
}

fn push_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_str(bytes: &[u8]) -> Result<(String, &[u8])> {
    if bytes.len() < 4 {
        return Err(Error::WalProtocol("short string field"));
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() < 4 + len {
        return Err(Error::WalProtocol("short string field"));
    }
    let s = String::from_utf8(bytes[4..4 + len].to_vec())
        .map_err(|_| Error::WalProtocol("invalid UTF-8 in wal string"))?;
    Ok((s, &bytes[4 + len..]))
}

/// One committed batch, in log order.
#[derive(Debug, Clone)]
pub struct CommittedBatch {
    pub seq: u64,
    pub tx_id: String,
    pub ops: Vec<WalRecord>,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
}

impl Wal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<u64> {
        let body = record.encode_body();
        let len = u32::try_from(body.len()).map_err(|_| Error::WalRecordTooLarge(u32::MAX))?;
        if len > MAX_WAL_RECORD_LEN {
            return Err(Error::WalRecordTooLarge(len));
        }
        let crc = crc32(&body);

        let offset = self.file.metadata()?.len();
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.flush()?;
        Ok(offset)
    }

    pub fn fsync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_committed(&self) -> Result<Vec<CommittedBatch>> {
        Self::read_committed_from_path(&self.path)
    }

    pub fn read_committed_from_path(path: &Path) -> Result<Vec<CommittedBatch>> {
        let mut reader = WalReader::open(path)?;
        let mut out: Vec<CommittedBatch> = Vec::new();

        let mut current: Option<(u64, String)> = None;
        let mut pending: Vec<WalRecord> = Vec::new();

        while let Some((_offset, record)) = reader.next_record()? {
            match record {
                WalRecord::BeginBatch { seq, tx_id } => {
                    // An abandoned batch (crash before commit, then restart)
                    // is simply superseded by the next begin.
                    current = Some((seq, tx_id));
                    pending.clear();
                }
                WalRecord::CommitBatch { seq } => {
                    let Some((open_seq, tx_id)) = current.take() else {
                        return Err(Error::WalProtocol("CommitBatch without BeginBatch"));
                    };
                    if open_seq != seq {
                        return Err(Error::WalProtocol("CommitBatch seq mismatch"));
                    }
                    out.push(CommittedBatch {
                        seq,
                        tx_id,
                        ops: std::mem::take(&mut pending),
                    });
                }
                op => {
                    if current.is_none() {
                        return Err(Error::WalProtocol("record outside batch"));
                    }
                    pending.push(op);
                }
            }
        }

        Ok(out)
    }

    /// Replace the log with a single committed batch, atomically.
    ///
    /// Used by checkpoint truncation: once the checkpoint tables are durable
    /// in the pager, everything before the checkpoint is redundant.
    pub fn rewrite_as_snapshot(
        &mut self,
        tmp_path: &Path,
        seq: u64,
        tx_id: &str,
        ops: Vec<WalRecord>,
    ) -> Result<()> {
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(tmp_path)?;
            let mut fresh = Wal { path: tmp_path.to_path_buf(), file };
            fresh.append(&WalRecord::BeginBatch { seq, tx_id: tx_id.to_string() })?;
            for op in &ops {
                fresh.append(op)?;
            }
            fresh.append(&WalRecord::CommitBatch { seq })?;
            fresh.fsync()?;
        }

        std::fs::rename(tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        Ok(())
    }
}

struct WalReader {
    file: File,
    offset: u64,
}

impl WalReader {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, offset: 0 })
    }

    fn next_record(&mut self) -> Result<Option<(u64, WalRecord)>> {
        let record_offset = self.offset;

        let Some(len) = self.try_read_u32()? else {
            return Ok(None);
        };
        if len > MAX_WAL_RECORD_LEN {
            // A garbage length is indistinguishable from a torn tail.
            return Ok(None);
        }

        let Some(crc) = self.try_read_u32()? else {
            return Ok(None);
        };

        let mut body = vec![0u8; len as usize];
        if let Err(e) = self.file.read_exact(&mut body) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Error::Io(e));
        }

        if crc32(&body) != crc {
            // Torn final record after a crash; ignore the tail.
            return Ok(None);
        }

        self.offset += 4 + 4 + len as u64;

        let record = WalRecord::decode_body(&body)?;
        Ok(Some((record_offset, record)))
    }

    fn try_read_u32(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(Some(u32::from_le_bytes(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn begin(seq: u64) -> WalRecord {
        WalRecord::BeginBatch { seq, tx_id: format!("tx-{seq}") }
    }

    #[test]
    fn roundtrip_every_record_type() {
        let records = vec![
            begin(1),
            WalRecord::AddEdge { src: 1, rel: 2, dst: 3 },
            WalRecord::DeleteEdge { src: 1, rel: 2, dst: 3 },
            WalRecord::CreateNode { external_id: 77, internal_id: 0 },
            WalRecord::AssignLabel { node: 0, label: 4 },
            WalRecord::RemoveLabel { node: 0, label: 4 },
            WalRecord::CreateSymbol { name: "KNOWS".into(), id: 4 },
            WalRecord::SetNodeProperty {
                node: 0,
                key: "name".into(),
                value: PropertyValue::String("ada".into()),
            },
            WalRecord::SetEdgeProperty {
                src: 1,
                rel: 2,
                dst: 3,
                key: "w".into(),
                value: PropertyValue::Float(1.5),
            },
            WalRecord::TombstoneNode { node: 9 },
            WalRecord::PageWrite { page_id: 2, page: Box::new([7u8; PAGE_SIZE]) },
            WalRecord::ManifestSwitch { epoch: 3 },
            WalRecord::Checkpoint {
                epoch: 3,
                next_internal_id: 10,
                next_symbol_id: 5,
                manifest_revision: 2,
            },
            WalRecord::CommitBatch { seq: 1 },
        ];
        for record in &records {
            let body = record.encode_body();
            assert_eq!(&WalRecord::decode_body(&body).unwrap(), record);
        }
    }

    #[test]
    fn replay_yields_only_committed_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin(1)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 1, rel: 1, dst: 2 }).unwrap();
            wal.append(&WalRecord::CommitBatch { seq: 1 }).unwrap();

            // Crash before commit of batch 2.
            wal.append(&begin(2)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 2, rel: 1, dst: 3 }).unwrap();
            wal.fsync().unwrap();
        }

        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seq, 1);
        assert_eq!(batches[0].tx_id, "tx-1");
        assert_eq!(batches[0].ops.len(), 1);
    }

    #[test]
    fn abandoned_batch_followed_by_new_begin_is_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin(1)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 1, rel: 1, dst: 2 }).unwrap();
            wal.append(&begin(2)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 2, rel: 1, dst: 3 }).unwrap();
            wal.append(&WalRecord::CommitBatch { seq: 2 }).unwrap();
            wal.fsync().unwrap();
        }

        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seq, 2);
    }

    #[test]
    fn trailing_partial_record_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin(1)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 1, rel: 1, dst: 2 }).unwrap();
            wal.append(&WalRecord::CommitBatch { seq: 1 }).unwrap();

            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x01, 0x02, 0x03]).unwrap();
        }

        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 1);
    }

    #[test]
    fn trailing_crc_mismatch_truncates_the_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");

        let begin2_offset;
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&begin(1)).unwrap();
            wal.append(&WalRecord::AddEdge { src: 1, rel: 1, dst: 2 }).unwrap();
            wal.append(&WalRecord::CommitBatch { seq: 1 }).unwrap();
            begin2_offset = wal.append(&begin(2)).unwrap();
            wal.append(&WalRecord::CommitBatch { seq: 2 }).unwrap();
            wal.fsync().unwrap();
        }

        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(begin2_offset + 4)).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.flush().unwrap();
        }

        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seq, 1);
    }

    #[test]
    fn rewrite_as_snapshot_replaces_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal");
        let tmp = dir.path().join("test.wal.tmp");

        let mut wal = Wal::open(&path).unwrap();
        for seq in 1..=5u64 {
            wal.append(&begin(seq)).unwrap();
            wal.append(&WalRecord::AddEdge { src: seq as u32, rel: 1, dst: 0 }).unwrap();
            wal.append(&WalRecord::CommitBatch { seq }).unwrap();
        }
        wal.fsync().unwrap();

        wal.rewrite_as_snapshot(
            &tmp,
            6,
            "checkpoint",
            vec![WalRecord::Checkpoint {
                epoch: 1,
                next_internal_id: 5,
                next_symbol_id: 2,
                manifest_revision: 1,
            }],
        )
        .unwrap();

        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].seq, 6);
        assert!(matches!(batches[0].ops[0], WalRecord::Checkpoint { .. }));

        // The rewritten log accepts further appends.
        wal.append(&begin(7)).unwrap();
        wal.append(&WalRecord::CommitBatch { seq: 7 }).unwrap();
        let batches = Wal::read_committed_from_path(&path).unwrap();
        assert_eq!(batches.len(), 2);
    }
}
