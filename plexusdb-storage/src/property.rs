//! Binary codec for property values and the durable property table.
//!
//! Recent writes live as overlays inside MemTable / L0 runs; the durable
//! state is a [`PropertyTable`] persisted as a blob chain in the pager at
//! checkpoint. Reads consult overlays first, then the table. A `Null` value
//! in an overlay is the deletion sentinel; merging drops pairs whose latest
//! value is `Null`.

use crate::{EdgeKey, Error, InternalNodeId, MAX_VALUE_BYTES, PropertyValue, Result};
use std::collections::BTreeMap;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;
const TAG_MAP: u8 = 7;
const TAG_DATETIME: u8 = 8;

/// Nesting bound for decode; deeper values are rejected as corruption.
const MAX_DEPTH: u32 = 32;

pub fn encode_value(value: &PropertyValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &PropertyValue, out: &mut Vec<u8>) {
    match value {
        PropertyValue::Null => out.push(TAG_NULL),
        PropertyValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        PropertyValue::Int(i) => {
            out.push(TAG_INT);
            out.extend_from_slice(&i.to_le_bytes());
        }
        PropertyValue::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        PropertyValue::String(s) => {
            out.push(TAG_STRING);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        PropertyValue::Bytes(b) => {
            out.push(TAG_BYTES);
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        PropertyValue::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        PropertyValue::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, item) in entries {
                out.extend_from_slice(&(key.len() as u16).to_le_bytes());
                out.extend_from_slice(key.as_bytes());
                encode_into(item, out);
            }
        }
        PropertyValue::DateTime(ms) => {
            out.push(TAG_DATETIME);
            out.extend_from_slice(&ms.to_le_bytes());
        }
    }
}

pub fn decode_value(bytes: &[u8]) -> Result<PropertyValue> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = decode_one(&mut cursor, 0)?;
    if cursor.pos != bytes.len() {
        return Err(Error::StorageCorrupted("trailing bytes after property value"));
    }
    Ok(value)
}

/// Enforce the single-value size cap at the write boundary.
pub fn check_value_size(value: &PropertyValue) -> Result<()> {
    let size = encode_value(value).len();
    if size > MAX_VALUE_BYTES {
        return Err(Error::PayloadTooLarge { size, limit: MAX_VALUE_BYTES });
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.bytes.len())
            .ok_or(Error::StorageCorrupted("short property value"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn utf8(&mut self, len: usize) -> Result<String> {
        String::from_utf8(self.take(len)?.to_vec())
            .map_err(|_| Error::StorageCorrupted("invalid UTF-8 in property value"))
    }
}

fn decode_one(cursor: &mut Cursor<'_>, depth: u32) -> Result<PropertyValue> {
    if depth > MAX_DEPTH {
        return Err(Error::StorageCorrupted("property value nested too deeply"));
    }
    match cursor.u8()? {
        TAG_NULL => Ok(PropertyValue::Null),
        TAG_BOOL => Ok(PropertyValue::Bool(cursor.u8()? != 0)),
        TAG_INT => Ok(PropertyValue::Int(cursor.i64()?)),
        TAG_FLOAT => Ok(PropertyValue::Float(cursor.f64()?)),
        TAG_STRING => {
            let len = cursor.u32()? as usize;
            Ok(PropertyValue::String(cursor.utf8(len)?))
        }
        TAG_BYTES => {
            let len = cursor.u32()? as usize;
            Ok(PropertyValue::Bytes(cursor.take(len)?.to_vec()))
        }
        TAG_LIST => {
            let count = cursor.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_one(cursor, depth + 1)?);
            }
            Ok(PropertyValue::List(items))
        }
        TAG_MAP => {
            let count = cursor.u32()? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let key_len = cursor.u16()? as usize;
                let key = cursor.utf8(key_len)?;
                entries.insert(key, decode_one(cursor, depth + 1)?);
            }
            Ok(PropertyValue::Map(entries))
        }
        TAG_DATETIME => Ok(PropertyValue::DateTime(cursor.i64()?)),
        _ => Err(Error::StorageCorrupted("unknown property value tag")),
    }
}

/// Durable, cheaply cloneable property state keyed by node or full triple.
#[derive(Debug, Clone, Default)]
pub struct PropertyTable {
    nodes: im::OrdMap<(InternalNodeId, String), PropertyValue>,
    edges: im::OrdMap<(EdgeKey, String), PropertyValue>,
}

impl PropertyTable {
    pub fn node_get(&self, node: InternalNodeId, key: &str) -> Option<&PropertyValue> {
        self.nodes.get(&(node, key.to_string()))
    }

    pub fn edge_get(&self, edge: EdgeKey, key: &str) -> Option<&PropertyValue> {
        self.edges.get(&(edge, key.to_string()))
    }

    pub fn node_entries(
        &self,
        node: InternalNodeId,
    ) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.nodes
            .range((node, String::new())..)
            .take_while(move |((n, _), _)| *n == node)
            .map(|((_, k), v)| (k, v))
    }

    pub fn edge_entries(&self, edge: EdgeKey) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.edges
            .range((edge, String::new())..)
            .take_while(move |((e, _), _)| *e == edge)
            .map(|((_, k), v)| (k, v))
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Apply one overlay delta. A `Null` value drops the pair.
    pub fn apply_node(&mut self, node: InternalNodeId, key: String, value: PropertyValue) {
        if value.is_null() {
            self.nodes.remove(&(node, key));
        } else {
            self.nodes.insert((node, key), value);
        }
    }

    pub fn apply_edge(&mut self, edge: EdgeKey, key: String, value: PropertyValue) {
        if value.is_null() {
            self.edges.remove(&(edge, key));
        } else {
            self.edges.insert((edge, key), value);
        }
    }

    /// Drop all pairs of a tombstoned node.
    pub fn drop_node(&mut self, node: InternalNodeId) {
        let keys: Vec<_> = self
            .nodes
            .range((node, String::new())..)
            .take_while(|((n, _), _)| *n == node)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            self.nodes.remove(&k);
        }
    }

    /// Drop all pairs of a deleted edge.
    pub fn drop_edge(&mut self, edge: EdgeKey) {
        let keys: Vec<_> = self
            .edges
            .range((edge, String::new())..)
            .take_while(|((e, _), _)| *e == edge)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            self.edges.remove(&k);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        for ((node, key), value) in self.nodes.iter() {
            out.extend_from_slice(&node.to_le_bytes());
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            let encoded = encode_value(value);
            out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        out.extend_from_slice(&(self.edges.len() as u32).to_le_bytes());
        for ((edge, key), value) in self.edges.iter() {
            out.extend_from_slice(&edge.src.to_le_bytes());
            out.extend_from_slice(&edge.rel.to_le_bytes());
            out.extend_from_slice(&edge.dst.to_le_bytes());
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            let encoded = encode_value(value);
            out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let mut table = PropertyTable::default();

        let node_count = cursor.u32()?;
        for _ in 0..node_count {
            let node = cursor.u32()?;
            let key_len = cursor.u16()? as usize;
            let key = cursor.utf8(key_len)?;
            let value_len = cursor.u32()? as usize;
            let value = decode_value(cursor.take(value_len)?)?;
            table.nodes.insert((node, key), value);
        }

        let edge_count = cursor.u32()?;
        for _ in 0..edge_count {
            let edge = EdgeKey {
                src: cursor.u32()?,
                rel: cursor.u32()?,
                dst: cursor.u32()?,
            };
            let key_len = cursor.u16()? as usize;
            let key = cursor.utf8(key_len)?;
            let value_len = cursor.u32()? as usize;
            let value = decode_value(cursor.take(value_len)?)?;
            table.edges.insert((edge, key), value);
        }

        if cursor.pos != bytes.len() {
            return Err(Error::StorageCorrupted("trailing bytes after property table"));
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: PropertyValue) {
        let encoded = encode_value(&v);
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn encode_decode_scalars() {
        roundtrip(PropertyValue::Null);
        roundtrip(PropertyValue::Bool(true));
        roundtrip(PropertyValue::Bool(false));
        for i in [0i64, -1, 1, i64::MIN, i64::MAX] {
            roundtrip(PropertyValue::Int(i));
        }
        for f in [0.0f64, -1.5, f64::MIN, f64::MAX] {
            roundtrip(PropertyValue::Float(f));
        }
        roundtrip(PropertyValue::DateTime(1_700_000_000_000));
    }

    #[test]
    fn encode_decode_strings_and_bytes() {
        for s in ["", "hello", "世界"] {
            roundtrip(PropertyValue::String(s.to_string()));
        }
        roundtrip(PropertyValue::Bytes(vec![0, 1, 2, 255]));
    }

    #[test]
    fn encode_decode_nested() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), PropertyValue::Int(1));
        map.insert(
            "b".to_string(),
            PropertyValue::List(vec![
                PropertyValue::Null,
                PropertyValue::String("x".into()),
            ]),
        );
        roundtrip(PropertyValue::Map(map));
    }

    #[test]
    fn oversize_value_is_rejected_not_panicked() {
        let big = PropertyValue::Bytes(vec![0u8; MAX_VALUE_BYTES + 1]);
        assert!(matches!(
            check_value_size(&big),
            Err(Error::PayloadTooLarge { .. })
        ));
        check_value_size(&PropertyValue::Bytes(vec![0u8; 64])).unwrap();
    }

    #[test]
    fn unknown_tag_is_corruption() {
        assert!(matches!(
            decode_value(&[200]),
            Err(Error::StorageCorrupted(_))
        ));
    }

    #[test]
    fn deeply_nested_value_is_rejected() {
        let mut v = PropertyValue::Null;
        for _ in 0..40 {
            v = PropertyValue::List(vec![v]);
        }
        let encoded = encode_value(&v);
        assert!(decode_value(&encoded).is_err());
    }

    #[test]
    fn table_merge_and_null_sentinel() {
        let mut table = PropertyTable::default();
        table.apply_node(1, "name".into(), PropertyValue::String("ada".into()));
        table.apply_node(1, "age".into(), PropertyValue::Int(36));
        assert_eq!(table.node_entries(1).count(), 2);

        table.apply_node(1, "age".into(), PropertyValue::Null);
        assert_eq!(table.node_get(1, "age"), None);
        assert_eq!(table.node_entries(1).count(), 1);
    }

    #[test]
    fn table_roundtrip() {
        let mut table = PropertyTable::default();
        table.apply_node(3, "k".into(), PropertyValue::Int(9));
        let edge = EdgeKey { src: 1, rel: 2, dst: 3 };
        table.apply_edge(edge, "w".into(), PropertyValue::Float(0.5));

        let decoded = PropertyTable::decode(&table.encode()).unwrap();
        assert_eq!(decoded.node_get(3, "k"), Some(&PropertyValue::Int(9)));
        assert_eq!(decoded.edge_get(edge, "w"), Some(&PropertyValue::Float(0.5)));
    }
}
