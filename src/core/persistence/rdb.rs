// src/core/persistence/rdb.rs

//! Implements the RDB snapshot file format.
//!
//! Layout: a 9-byte `REDIS0009` header, then one `(0xFE, varlen db_id)`
//! section per non-empty database, each followed by `(type_tag, key, value)`
//! records, a `0xFF` EOF byte, and an 8-byte little-endian CRC64 trailer
//! computed over every byte up to and including the EOF byte.

use crate::core::JasperDBError;
use crate::core::state::ServerState;
use crate::core::storage::data_types::DataValue;
use crate::core::storage::db::Db;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_64_REDIS, Crc};
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::io::{self, Error, ErrorKind};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info};

// --- RDB framing constants ---
const RDB_MAGIC: &[u8] = b"REDIS0009";

const RDB_OPCODE_SELECTDB: u8 = 0xFE;
const RDB_OPCODE_EOF: u8 = 0xFF;

const RDB_TYPE_STRING: u8 = 0x00;
const RDB_TYPE_LIST: u8 = 0x01;
const RDB_TYPE_SET: u8 = 0x02;
const RDB_TYPE_ZSET: u8 = 0x03;
const RDB_TYPE_HASH: u8 = 0x04;

/// CRC-64 with the 0x95ac9329ac4bc9b5 reflected polynomial, table-driven.
const CHECKSUM_ALGO: Crc<u64> = Crc::<u64>::new(&CRC_64_REDIS);

// --- Loader ---

pub struct RdbLoader {
    config: crate::config::PersistenceConfig,
}

impl RdbLoader {
    pub fn new(config: crate::config::PersistenceConfig) -> Self {
        Self { config }
    }

    /// Loads the RDB file into the provided `ServerState` at startup.
    pub async fn load_into(&self, state: &Arc<ServerState>) -> Result<(), JasperDBError> {
        let path = &self.config.rdb_file_name;
        let metadata = match fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("RDB file not found at {path}. Starting with an empty database.");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() || metadata.len() == 0 {
            info!("RDB file at {path} is empty or not a file. Starting fresh.");
            return Ok(());
        }

        let bytes = Bytes::from(fs::read(path).await?);
        info!("RDB file found ({} bytes). Starting parsing...", bytes.len());
        load_from_bytes(&bytes, &state.dbs).await?;
        info!("Successfully loaded database from RDB file {path}");
        Ok(())
    }
}

/// Verifies and loads a full RDB image into the databases. The databases
/// are only touched after the magic and checksum pass.
pub async fn load_from_bytes(data: &Bytes, dbs: &[Arc<Db>]) -> Result<(), JasperDBError> {
    if data.len() < RDB_MAGIC.len() + 1 + 8 {
        return Err(JasperDBError::Corruption(
            "RDB file is too short to be valid".into(),
        ));
    }

    let (data_part, checksum_part) = data.split_at(data.len() - 8);
    let expected_checksum = CHECKSUM_ALGO.checksum(data_part);
    let file_checksum = (&checksum_part[..]).get_u64_le();
    if expected_checksum != file_checksum {
        return Err(JasperDBError::Corruption(
            "RDB checksum mismatch. File may be corrupt.".into(),
        ));
    }

    let mut cursor = Bytes::copy_from_slice(data_part);
    let magic = cursor.split_to(RDB_MAGIC.len());
    if magic != RDB_MAGIC {
        return Err(JasperDBError::Corruption("invalid RDB magic string".into()));
    }

    for db in dbs {
        db.clear().await;
    }

    let mut current_db_index = 0usize;
    loop {
        if !cursor.has_remaining() {
            return Err(JasperDBError::Corruption(
                "RDB data ended without EOF opcode".into(),
            ));
        }
        let opcode = cursor.get_u8();
        match opcode {
            RDB_OPCODE_EOF => {
                debug!("RDB EOF reached. Parsing complete.");
                return Ok(());
            }
            RDB_OPCODE_SELECTDB => {
                let db_index = read_length(&mut cursor).map_err(corruption)? as usize;
                if db_index >= dbs.len() {
                    return Err(JasperDBError::Corruption(format!(
                        "RDB contains SELECTDB for out-of-range index {db_index}"
                    )));
                }
                current_db_index = db_index;
            }
            type_tag => {
                let key = read_string(&mut cursor).map_err(corruption)?;
                let value = decode_value(&mut cursor, type_tag).map_err(corruption)?;
                dbs[current_db_index].insert_value_from_load(key, value).await;
            }
        }
    }
}

fn corruption(e: io::Error) -> JasperDBError {
    JasperDBError::Corruption(e.to_string())
}

// --- Encoder building blocks ---
// The background saver assembles a file incrementally from these, releasing
// the dictionary lock between chunks.

pub fn encode_header(buf: &mut BytesMut) {
    buf.put_slice(RDB_MAGIC);
}

pub fn encode_select(buf: &mut BytesMut, db_index: usize) {
    buf.put_u8(RDB_OPCODE_SELECTDB);
    write_length(buf, db_index as u64);
}

pub fn encode_record(buf: &mut BytesMut, key: &Bytes, value: &DataValue) {
    match value {
        DataValue::String(val) => {
            buf.put_u8(RDB_TYPE_STRING);
            write_string(buf, key);
            write_string(buf, val);
        }
        DataValue::List(list) => {
            buf.put_u8(RDB_TYPE_LIST);
            write_string(buf, key);
            write_length(buf, list.len() as u64);
            for item in list {
                write_string(buf, item);
            }
        }
        DataValue::Set(set) => {
            buf.put_u8(RDB_TYPE_SET);
            write_string(buf, key);
            write_length(buf, set.len() as u64);
            for member in set {
                write_string(buf, member);
            }
        }
        DataValue::SortedSet(zset) => {
            buf.put_u8(RDB_TYPE_ZSET);
            write_string(buf, key);
            write_length(buf, zset.len() as u64);
            for (member, score) in zset {
                write_string(buf, &DataValue::format_score(*score));
                write_string(buf, member);
            }
        }
        DataValue::Hash(hash) => {
            buf.put_u8(RDB_TYPE_HASH);
            write_string(buf, key);
            write_length(buf, hash.len() as u64);
            for (field, val) in hash {
                write_string(buf, field);
                write_string(buf, val);
            }
        }
    }
}

/// Appends the EOF byte and the CRC64 trailer, consuming the body.
pub fn finalize(mut buf: BytesMut) -> Bytes {
    buf.put_u8(RDB_OPCODE_EOF);
    let checksum = CHECKSUM_ALGO.checksum(&buf);
    buf.put_u64_le(checksum);
    buf.freeze()
}

/// Serializes complete database sections into one RDB image; the
/// synchronous save path and tests use this.
pub fn encode_databases(sections: &[(usize, Vec<(Bytes, DataValue)>)]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_header(&mut buf);
    for (db_index, records) in sections {
        if records.is_empty() {
            continue;
        }
        encode_select(&mut buf, *db_index);
        for (key, value) in records {
            encode_record(&mut buf, key, value);
        }
    }
    finalize(buf)
}

fn decode_value(cursor: &mut Bytes, type_tag: u8) -> io::Result<DataValue> {
    match type_tag {
        RDB_TYPE_STRING => Ok(DataValue::String(read_string(cursor)?)),
        RDB_TYPE_LIST => {
            let len = read_length(cursor)? as usize;
            let mut list = VecDeque::with_capacity(len);
            for _ in 0..len {
                list.push_back(read_string(cursor)?);
            }
            Ok(DataValue::List(list))
        }
        RDB_TYPE_SET => {
            let len = read_length(cursor)? as usize;
            let mut set = HashSet::with_capacity(len);
            for _ in 0..len {
                set.insert(read_string(cursor)?);
            }
            Ok(DataValue::Set(set))
        }
        RDB_TYPE_ZSET => {
            let len = read_length(cursor)? as usize;
            let mut zset = IndexMap::with_capacity(len);
            for _ in 0..len {
                let score_bytes = read_string(cursor)?;
                let member = read_string(cursor)?;
                let score_str = std::str::from_utf8(&score_bytes)
                    .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
                let score: f64 = score_str
                    .parse()
                    .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
                zset.insert(member, score);
            }
            Ok(DataValue::SortedSet(zset))
        }
        RDB_TYPE_HASH => {
            let len = read_length(cursor)? as usize;
            let mut hash = IndexMap::with_capacity(len);
            for _ in 0..len {
                let field = read_string(cursor)?;
                let value = read_string(cursor)?;
                hash.insert(field, value);
            }
            Ok(DataValue::Hash(hash))
        }
        other => Err(Error::new(
            ErrorKind::InvalidData,
            format!("Unknown RDB value type: {other:#04x}"),
        )),
    }
}

// --- Length and string encoding helpers ---
// Lengths 0..=63 take one byte (00xxxxxx), 64..=16383 two bytes
// (01xxxxxx xxxxxxxx), anything larger a 0x80 marker plus a big-endian u32.

fn write_string(buf: &mut BytesMut, s: &[u8]) {
    write_length(buf, s.len() as u64);
    buf.put_slice(s);
}

fn read_string(cursor: &mut Bytes) -> io::Result<Bytes> {
    let len = read_length(cursor)? as usize;
    if cursor.remaining() < len {
        return Err(Error::new(
            ErrorKind::UnexpectedEof,
            "Not enough data for string",
        ));
    }
    Ok(cursor.split_to(len))
}

fn write_length(buf: &mut BytesMut, len: u64) {
    if len < (1 << 6) {
        buf.put_u8(len as u8);
    } else if len < (1 << 14) {
        buf.put_u16((len | (1 << 14)) as u16);
    } else {
        debug_assert!(len <= u32::MAX as u64, "length exceeds the 32-bit form");
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    }
}

fn read_length(cursor: &mut Bytes) -> io::Result<u64> {
    if !cursor.has_remaining() {
        return Err(Error::new(ErrorKind::UnexpectedEof, "Cannot read length"));
    }
    let first_byte = cursor.get_u8();
    match (first_byte & 0xC0) >> 6 {
        0b00 => Ok(u64::from(first_byte & 0x3F)),
        0b01 => {
            if !cursor.has_remaining() {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Cannot read 14-bit length",
                ));
            }
            let next_byte = cursor.get_u8();
            Ok(u64::from(
                ((first_byte as u16 & 0x3F) << 8) | next_byte as u16,
            ))
        }
        0b10 if first_byte == 0x80 => {
            if cursor.remaining() < 4 {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Cannot read 32-bit length",
                ));
            }
            Ok(u64::from(cursor.get_u32()))
        }
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            "Unknown length encoding format",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_round_trip(len: u64) -> (usize, u64) {
        let mut buf = BytesMut::new();
        write_length(&mut buf, len);
        let written = buf.len();
        let mut cursor = buf.freeze();
        (written, read_length(&mut cursor).unwrap())
    }

    #[test]
    fn length_encoding_forms() {
        assert_eq!(length_round_trip(0), (1, 0));
        assert_eq!(length_round_trip(63), (1, 63));
        assert_eq!(length_round_trip(64), (2, 64));
        assert_eq!(length_round_trip(16383), (2, 16383));
        assert_eq!(length_round_trip(16384), (5, 16384));
        assert_eq!(length_round_trip(1 << 30), (5, 1 << 30));
    }

    #[test]
    fn fourteen_bit_form_has_01_prefix() {
        let mut buf = BytesMut::new();
        write_length(&mut buf, 64);
        assert_eq!(buf[0] & 0xC0, 0x40);
    }
}
