//! The single shared interner for labels and relation types.
//!
//! Both kinds of name draw from one u32 id namespace. The six-ordering edge
//! indexes and the label index key on these ids; splitting labels and
//! relation types into two interners has historically produced silent
//! wrong-answer bugs, so there is exactly one table.

use crate::{Error, Result, SymbolId};

/// Cheaply cloneable symbol table. The engine mutates one instance under its
/// write lock and publishes immutable clones to readers; structural sharing
/// makes the clone O(1).
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    s2i: im::HashMap<String, SymbolId>,
    i2s: im::Vector<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn id(&self, name: &str) -> Option<SymbolId> {
        self.s2i.get(name).copied()
    }

    #[inline]
    pub fn name(&self, id: SymbolId) -> Option<&str> {
        self.i2s.get(id as usize).map(|s| s.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.i2s.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.i2s.is_empty()
    }

    #[inline]
    pub fn next_id(&self) -> SymbolId {
        self.i2s.len() as SymbolId
    }

    /// Returns the id and whether the symbol was newly created.
    pub fn get_or_intern(&mut self, name: &str) -> (SymbolId, bool) {
        if let Some(id) = self.s2i.get(name) {
            return (*id, false);
        }
        let id = self.next_id();
        self.s2i.insert(name.to_string(), id);
        self.i2s.push_back(name.to_string());
        (id, true)
    }

    /// Replay path: install a symbol at the id recorded in the WAL.
    pub fn apply_create(&mut self, name: &str, id: SymbolId) -> Result<()> {
        match self.id(name) {
            Some(existing) if existing == id => Ok(()),
            Some(_) => Err(Error::WalProtocol("symbol id mismatch on replay")),
            None => {
                if self.next_id() != id {
                    return Err(Error::WalProtocol("non-dense symbol id on replay"));
                }
                self.s2i.insert(name.to_string(), id);
                self.i2s.push_back(name.to_string());
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &str)> {
        self.i2s
            .iter()
            .enumerate()
            .map(|(i, s)| (i as SymbolId, s.as_str()))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.i2s.len() as u32).to_le_bytes());
        for name in self.i2s.iter() {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
    }

    pub fn decode(bytes: &[u8], pos: &mut usize) -> Result<Self> {
        let count = read_u32(bytes, pos)? as usize;
        let mut table = SymbolTable::new();
        for _ in 0..count {
            let len = read_u32(bytes, pos)? as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= bytes.len())
                .ok_or(Error::StorageCorrupted("short symbol table"))?;
            let name = std::str::from_utf8(&bytes[*pos..end])
                .map_err(|_| Error::StorageCorrupted("invalid UTF-8 in symbol table"))?;
            *pos = end;
            let id = table.next_id();
            table.s2i.insert(name.to_string(), id);
            table.i2s.push_back(name.to_string());
        }
        Ok(table)
    }
}

pub(crate) fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    let end = pos
        .checked_add(4)
        .filter(|&e| e <= bytes.len())
        .ok_or(Error::StorageCorrupted("short integer field"))?;
    let v = u32::from_le_bytes(bytes[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(v)
}

pub(crate) fn read_u64(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let end = pos
        .checked_add(8)
        .filter(|&e| e <= bytes.len())
        .ok_or(Error::StorageCorrupted("short integer field"))?;
    let v = u64::from_le_bytes(bytes[*pos..end].try_into().unwrap());
    *pos = end;
    Ok(v)
}
