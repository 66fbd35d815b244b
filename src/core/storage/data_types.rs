// src/core/storage/data_types.rs

//! The value containers a key can hold.
//!
//! The engine treats these as opaque serializable payloads with a known type
//! tag; the container semantics (list ordering, set membership rules, score
//! updates) live in the command layer, which is out of tree.

use crate::core::protocol::RespFrame;
use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};

/// A value stored against a key in one of the logical databases.
///
/// `Hash` and `SortedSet` use `IndexMap` so that iteration order is the
/// insertion order, which keeps serialized forms deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    SortedSet(IndexMap<Bytes, f64>),
    Hash(IndexMap<Bytes, Bytes>),
}

impl DataValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            DataValue::String(_) => "string",
            DataValue::List(_) => "list",
            DataValue::Set(_) => "set",
            DataValue::SortedSet(_) => "zset",
            DataValue::Hash(_) => "hash",
        }
    }

    /// Approximate heap footprint of the payload, for memory reporting.
    pub fn memory_usage(&self) -> usize {
        match self {
            DataValue::String(val) => val.len(),
            DataValue::List(list) => list.iter().map(Bytes::len).sum(),
            DataValue::Set(set) => set.iter().map(Bytes::len).sum(),
            DataValue::SortedSet(zset) => zset
                .keys()
                .map(|member| member.len() + std::mem::size_of::<f64>())
                .sum(),
            DataValue::Hash(hash) => hash
                .iter()
                .map(|(field, val)| field.len() + val.len())
                .sum(),
        }
    }

    /// Formats a sorted-set score the way it is persisted: the shortest
    /// string that round-trips through an f64 parse.
    pub fn format_score(score: f64) -> Bytes {
        let mut buffer = ryu::Buffer::new();
        Bytes::copy_from_slice(buffer.format(score).as_bytes())
    }

    /// Converts the value back into the minimal set of commands needed to
    /// recreate it, used by the AOF rewrite to emit a compact file.
    pub fn reconstruction_commands(&self, key: &Bytes) -> Vec<RespFrame> {
        match self {
            DataValue::String(val) => {
                vec![RespFrame::command([
                    Bytes::from_static(b"SET"),
                    key.clone(),
                    val.clone(),
                ])]
            }
            DataValue::List(list) => {
                if list.is_empty() {
                    return Vec::new();
                }
                let mut args = Vec::with_capacity(list.len() + 2);
                args.push(Bytes::from_static(b"RPUSH"));
                args.push(key.clone());
                args.extend(list.iter().cloned());
                vec![RespFrame::command(args)]
            }
            DataValue::Set(set) => {
                if set.is_empty() {
                    return Vec::new();
                }
                let mut args = Vec::with_capacity(set.len() + 2);
                args.push(Bytes::from_static(b"SADD"));
                args.push(key.clone());
                args.extend(set.iter().cloned());
                vec![RespFrame::command(args)]
            }
            DataValue::SortedSet(zset) => {
                if zset.is_empty() {
                    return Vec::new();
                }
                let mut args = Vec::with_capacity(zset.len() * 2 + 2);
                args.push(Bytes::from_static(b"ZADD"));
                args.push(key.clone());
                for (member, score) in zset {
                    args.push(Self::format_score(*score));
                    args.push(member.clone());
                }
                vec![RespFrame::command(args)]
            }
            DataValue::Hash(hash) => {
                if hash.is_empty() {
                    return Vec::new();
                }
                let mut args = Vec::with_capacity(hash.len() * 2 + 2);
                args.push(Bytes::from_static(b"HSET"));
                args.push(key.clone());
                for (field, val) in hash {
                    args.push(field.clone());
                    args.push(val.clone());
                }
                vec![RespFrame::command(args)]
            }
        }
    }
}
