//! Versioned on-disk group layout and typed group metadata.
//!
//! A group is a directory of named array members plus a `group_meta` record.
//! Logical artifact names map to physical member names through the storage
//! version; readers must consult the version map and fail on versions they
//! do not know.

use crate::error::{Error, Result};
use crate::storage::ArrayStore;
use std::io::{Cursor, Read};

/// Magic prefix of the `group_meta` member.
const GROUP_MAGIC: u32 = 0x414E_5847; // "ANXG"

/// Member holding the group metadata record.
const META_MEMBER: &str = "group_meta";

/// Known storage layout versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageVersion {
    V0_1,
    V0_2,
    V0_3,
}

/// The version new groups are written with.
pub const CURRENT_STORAGE_VERSION: StorageVersion = StorageVersion::V0_3;

impl StorageVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageVersion::V0_1 => "0.1",
            StorageVersion::V0_2 => "0.2",
            StorageVersion::V0_3 => "0.3",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "0.1" => Ok(StorageVersion::V0_1),
            "0.2" => Ok(StorageVersion::V0_2),
            "0.3" => Ok(StorageVersion::V0_3),
            other => Err(Error::UnknownStorageVersion(other.to_string())),
        }
    }

    /// Physical member name of the IVF centroid matrix.
    pub fn centroids_member(&self) -> &'static str {
        match self {
            StorageVersion::V0_1 | StorageVersion::V0_2 => "centroids.tdb",
            StorageVersion::V0_3 => "partition_centroids",
        }
    }

    /// Physical member name of the IVF partition offsets (or sizes) vector.
    pub fn index_member(&self) -> &'static str {
        match self {
            StorageVersion::V0_1 | StorageVersion::V0_2 => "index.tdb",
            StorageVersion::V0_3 => "partition_indexes",
        }
    }

    /// Physical member name of the shuffled external-id vector.
    pub fn ids_member(&self) -> &'static str {
        match self {
            StorageVersion::V0_1 | StorageVersion::V0_2 => "ids.tdb",
            StorageVersion::V0_3 => "shuffled_vector_ids",
        }
    }

    /// Physical member name of the shuffled vector matrix.
    pub fn parts_member(&self) -> &'static str {
        match self {
            StorageVersion::V0_1 | StorageVersion::V0_2 => "parts.tdb",
            StorageVersion::V0_3 => "shuffled_vectors",
        }
    }
}

/// Vamana member names; these are version-independent.
pub mod vamana_members {
    pub const FEATURE_VECTORS: &str = "feature_vectors";
    pub const ADJ_SCORES: &str = "adj_scores";
    pub const ADJ_IDS: &str = "adj_ids";
    pub const ADJ_INDEX: &str = "adj_index";
}

/// A typed metadata value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetaValue {
    U64(u64),
    F32(f32),
}

/// Ordered typed key/value metadata record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetaValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key.
    pub fn put(&mut self, key: &str, value: MetaValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn put_u64(&mut self, key: &str, value: u64) {
        self.put(key, MetaValue::U64(value));
    }

    pub fn put_f32(&mut self, key: &str, value: f32) {
        self.put(key, MetaValue::F32(value));
    }

    pub fn get(&self, key: &str) -> Option<MetaValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| *v)
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        match self.get(key) {
            Some(MetaValue::U64(v)) => Ok(v),
            _ => Err(Error::MissingMetadata {
                key: key.to_string(),
            }),
        }
    }

    pub fn get_f32(&self, key: &str) -> Result<f32> {
        match self.get(key) {
            Some(MetaValue::F32(v)) => Ok(v),
            _ => Err(Error::MissingMetadata {
                key: key.to_string(),
            }),
        }
    }
}

/// A versioned group of array members under a common URI prefix.
pub struct Group<'s> {
    store: &'s dyn ArrayStore,
    uri: String,
    version: StorageVersion,
    meta: Metadata,
}

impl<'s> Group<'s> {
    /// Start a new group. Nothing touches storage until members or the
    /// metadata record are written.
    pub fn create(store: &'s dyn ArrayStore, uri: &str, version: StorageVersion) -> Self {
        Self {
            store,
            uri: uri.to_string(),
            version,
            meta: Metadata::new(),
        }
    }

    /// Open an existing group, reading its metadata record.
    pub fn open(store: &'s dyn ArrayStore, uri: &str) -> Result<Self> {
        let name = member_uri(uri, META_MEMBER);
        let bytes = store.read_blob(&name)?;
        let (version, meta) = decode_group_meta(&name, &bytes)?;
        Ok(Self {
            store,
            uri: uri.to_string(),
            version,
            meta,
        })
    }

    pub fn version(&self) -> StorageVersion {
        self.version
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self) -> &'s dyn ArrayStore {
        self.store
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }

    /// Physical store name of a member of this group.
    pub fn member(&self, name: &str) -> String {
        member_uri(&self.uri, name)
    }

    /// Physical store name of a member of this group's `temp_data`
    /// sub-group, used to stage partial writes.
    pub fn temp_member(&self, name: &str) -> String {
        member_uri(&self.uri, &format!("temp_data/{name}"))
    }

    /// Promote a staged member to its final name.
    pub fn promote(&self, name: &str) -> Result<()> {
        self.store.rename(&self.temp_member(name), &self.member(name))
    }

    /// Persist the metadata record. Call once all members are in place.
    pub fn write_metadata(&self) -> Result<()> {
        let bytes = encode_group_meta(self.version, &self.meta);
        self.store.write_blob(&member_uri(&self.uri, META_MEMBER), &bytes)
    }
}

fn member_uri(uri: &str, name: &str) -> String {
    if uri.is_empty() {
        name.to_string()
    } else {
        format!("{uri}/{name}")
    }
}

fn encode_group_meta(version: StorageVersion, meta: &Metadata) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&GROUP_MAGIC.to_le_bytes());
    write_str(&mut out, version.as_str());
    out.extend_from_slice(&(meta.entries.len() as u32).to_le_bytes());
    for (key, value) in &meta.entries {
        write_str(&mut out, key);
        match value {
            MetaValue::U64(v) => {
                out.push(1);
                out.extend_from_slice(&v.to_le_bytes());
            }
            MetaValue::F32(v) => {
                out.push(2);
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    out
}

fn decode_group_meta(name: &str, bytes: &[u8]) -> Result<(StorageVersion, Metadata)> {
    let corrupt = |reason: &str| Error::Corruption {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut cursor = Cursor::new(bytes);
    let magic = read_u32(&mut cursor).map_err(|_| corrupt("truncated magic"))?;
    if magic != GROUP_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version_str = read_str(&mut cursor).map_err(|_| corrupt("truncated version"))?;
    let version = StorageVersion::parse(&version_str)?;

    let count = read_u32(&mut cursor).map_err(|_| corrupt("truncated entry count"))?;
    let mut meta = Metadata::new();
    for _ in 0..count {
        let key = read_str(&mut cursor).map_err(|_| corrupt("truncated key"))?;
        let tag = read_u8(&mut cursor).map_err(|_| corrupt("truncated tag"))?;
        let value = match tag {
            1 => MetaValue::U64(read_u64(&mut cursor).map_err(|_| corrupt("truncated u64"))?),
            2 => MetaValue::F32(read_f32(&mut cursor).map_err(|_| corrupt("truncated f32"))?),
            _ => return Err(corrupt("unknown value tag")),
        };
        meta.put(&key, value);
    }
    Ok((version, meta))
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    cursor.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f32(cursor: &mut Cursor<&[u8]>) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> std::io::Result<String> {
    let len = read_u32(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 string"))
}
