//! External ↔ internal node id mapping.
//!
//! Internal ids are dense and assigned monotonically; once handed out an id
//! is never reassigned, even after the node is tombstoned. The table is a
//! partial injection: `e2i` and the dense reverse vector `i2e` always agree.

use crate::symbols::{read_u32, read_u64};
use crate::{Error, ExternalId, InternalNodeId, Result, SymbolId};

/// Cheaply cloneable id table. Mutated by the engine under its write lock,
/// published as immutable clones to snapshots.
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    e2i: im::HashMap<ExternalId, InternalNodeId>,
    i2e: im::Vector<ExternalId>,
    /// Per-node label ids, sorted and deduplicated.
    i2l: im::Vector<Vec<SymbolId>>,
    tombstoned: im::OrdSet<InternalNodeId>,
}

impl IdMap {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.i2e.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.i2e.is_empty()
    }

    #[inline]
    pub fn next_internal_id(&self) -> InternalNodeId {
        self.i2e.len() as InternalNodeId
    }

    #[inline]
    pub fn lookup(&self, external: ExternalId) -> Option<InternalNodeId> {
        self.e2i.get(&external).copied()
    }

    #[inline]
    pub fn external_of(&self, node: InternalNodeId) -> Option<ExternalId> {
        self.i2e.get(node as usize).copied()
    }

    #[inline]
    pub fn labels_of(&self, node: InternalNodeId) -> &[SymbolId] {
        self.i2l.get(node as usize).map(|v| v.as_slice()).unwrap_or(&[])
    }

    #[inline]
    pub fn is_tombstoned(&self, node: InternalNodeId) -> bool {
        self.tombstoned.contains(&node)
    }

    pub fn apply_create_node(
        &mut self,
        external: ExternalId,
        internal: InternalNodeId,
    ) -> Result<()> {
        if internal != self.next_internal_id() {
            return Err(Error::WalProtocol("non-dense internal id"));
        }
        if self.e2i.contains_key(&external) {
            return Err(Error::WalProtocol("duplicate external id"));
        }
        self.e2i.insert(external, internal);
        self.i2e.push_back(external);
        self.i2l.push_back(Vec::new());
        Ok(())
    }

    pub fn apply_assign_label(&mut self, node: InternalNodeId, label: SymbolId) -> Result<()> {
        let labels = self
            .i2l
            .get_mut(node as usize)
            .ok_or(Error::WalProtocol("label assignment for unknown node"))?;
        if !labels.contains(&label) {
            labels.push(label);
            labels.sort_unstable();
        }
        Ok(())
    }

    pub fn apply_remove_label(&mut self, node: InternalNodeId, label: SymbolId) -> Result<()> {
        let labels = self
            .i2l
            .get_mut(node as usize)
            .ok_or(Error::WalProtocol("label removal for unknown node"))?;
        labels.retain(|&l| l != label);
        Ok(())
    }

    /// Durable node tombstone, applied when compaction consumes the run that
    /// recorded the deletion. The external mapping stays: ids are never
    /// reassigned.
    pub fn apply_tombstone(&mut self, node: InternalNodeId) {
        self.tombstoned.insert(node);
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.i2e.len() as u32).to_le_bytes());
        for (i, external) in self.i2e.iter().enumerate() {
            out.extend_from_slice(&external.to_le_bytes());
            let labels = self.i2l.get(i).map(|v| v.as_slice()).unwrap_or(&[]);
            out.extend_from_slice(&(labels.len() as u16).to_le_bytes());
            for label in labels {
                out.extend_from_slice(&label.to_le_bytes());
            }
        }
        out.extend_from_slice(&(self.tombstoned.len() as u32).to_le_bytes());
        for node in self.tombstoned.iter() {
            out.extend_from_slice(&node.to_le_bytes());
        }
    }

    pub fn decode(bytes: &[u8], pos: &mut usize) -> Result<Self> {
        let count = read_u32(bytes, pos)? as usize;
        let mut map = IdMap::new();
        for internal in 0..count {
            let external = read_u64(bytes, pos)?;
            let label_count = {
                let end = pos
                    .checked_add(2)
                    .filter(|&e| e <= bytes.len())
                    .ok_or(Error::StorageCorrupted("short id table"))?;
                let v = u16::from_le_bytes(bytes[*pos..end].try_into().unwrap());
                *pos = end;
                v as usize
            };
            let mut labels = Vec::with_capacity(label_count);
            for _ in 0..label_count {
                labels.push(read_u32(bytes, pos)?);
            }
            labels.sort_unstable();
            labels.dedup();

            map.e2i.insert(external, internal as InternalNodeId);
            map.i2e.push_back(external);
            map.i2l.push_back(labels);
        }
        let tomb_count = read_u32(bytes, pos)? as usize;
        for _ in 0..tomb_count {
            let node = read_u32(bytes, pos)?;
            map.tombstoned.insert(node);
        }
        Ok(map)
    }
}
