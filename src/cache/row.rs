//! # Cache Rows and Key Encodings
//!
//! A cache data row carries `(cache_id, key, value, version, expire_time)`
//! plus the link of its stored bytes. Rows are serialized into data pages
//! as a fixed header followed by key and value bytes; the link is *not*
//! part of the payload, it is where the payload lives.
//!
//! ## Key Encodings
//!
//! The trees order entries by encoded byte strings:
//!
//! - cache data tree: `sign_flip(cache_id) ++ sign_flip(hash) ++ key`
//! - pending entries tree: `sign_flip(cache_id) ++ expire_time ++ link`
//! - link map: `old_link` (big-endian)
//!
//! Signed components are offset so that negative ids sort before
//! positive ones under byte comparison; unsigned components are plain
//! big-endian.
//!
//! `cache_id` is `UNDEFINED_CACHE_ID` inside data pages when the owning
//! group does not inline cache ids per page (single-cache groups); the
//! per-group flag must be preserved round-trip through defragmentation.

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::storage::PartitionId;

pub const UNDEFINED_CACHE_ID: i32 = 0;

const ROW_HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Key hash used as the middle component of the data tree key.
pub fn key_hash(key: &[u8]) -> i32 {
    ROW_HASH.checksum(key) as i32
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RowHeader {
    cache_id: i32,
    hash: i32,
    version: u64,
    expire_time: u64,
    key_len: u32,
    value_len: u32,
}

const ROW_HEADER_SIZE: usize = size_of::<RowHeader>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub cache_id: i32,
    pub hash: i32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: u64,
    pub expire_time: u64,
    pub link: u64,
}

impl DataRow {
    pub fn new(
        cache_id: i32,
        key: Vec<u8>,
        value: Vec<u8>,
        version: u64,
        expire_time: u64,
    ) -> Self {
        let hash = key_hash(&key);
        Self {
            cache_id,
            hash,
            key,
            value,
            version,
            expire_time,
            link: 0,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let header = RowHeader {
            cache_id: self.cache_id,
            hash: self.hash,
            version: self.version,
            expire_time: self.expire_time,
            key_len: self.key.len() as u32,
            value_len: self.value.len() as u32,
        };

        let mut payload =
            Vec::with_capacity(ROW_HEADER_SIZE + self.key.len() + self.value.len());
        payload.extend_from_slice(header.as_bytes());
        payload.extend_from_slice(&self.key);
        payload.extend_from_slice(&self.value);
        payload
    }

    pub fn from_payload(payload: &[u8], link: u64) -> Result<Self> {
        ensure!(
            payload.len() >= ROW_HEADER_SIZE,
            "row payload of {} bytes is shorter than the row header",
            payload.len()
        );

        let header = RowHeader::ref_from_bytes(&payload[..ROW_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read RowHeader: {:?}", e))?;

        let key_start = ROW_HEADER_SIZE;
        let key_end = key_start + header.key_len as usize;
        let value_end = key_end + header.value_len as usize;
        ensure!(
            value_end == payload.len(),
            "row payload length mismatch: header says {}, payload has {}",
            value_end,
            payload.len()
        );

        Ok(Self {
            cache_id: header.cache_id,
            hash: header.hash,
            key: payload[key_start..key_end].to_vec(),
            value: payload[key_end..value_end].to_vec(),
            version: header.version,
            expire_time: header.expire_time,
            link,
        })
    }
}

/// A headerless row: an opaque blob in a partition store (the update
/// counter gaps of a partition travel as one of these).
#[derive(Debug, Clone)]
pub struct SimpleDataRow {
    pub partition: PartitionId,
    pub bytes: Vec<u8>,
    pub link: u64,
}

impl SimpleDataRow {
    pub fn new(partition: PartitionId, bytes: Vec<u8>) -> Self {
        Self {
            partition,
            bytes,
            link: 0,
        }
    }
}

fn sign_flip(v: i32) -> [u8; 4] {
    ((v as u32) ^ 0x8000_0000).to_be_bytes()
}

pub fn data_key(cache_id: i32, hash: i32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&sign_flip(cache_id));
    out.extend_from_slice(&sign_flip(hash));
    out.extend_from_slice(key);
    out
}

pub fn pending_key(cache_id: i32, expire_time: u64, link: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&sign_flip(cache_id));
    out.extend_from_slice(&expire_time.to_be_bytes());
    out.extend_from_slice(&link.to_be_bytes());
    out
}
