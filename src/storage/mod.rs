//! Array store abstraction and the file-system backing used for tests and
//! single-node deployments.
//!
//! The engine treats persistent storage as an opaque typed blob store with
//! range reads: the `ArrayStore` trait is the full contract. Index groups
//! (see [`group`]) are directories of named array members layered on top.
//!
//! Array members are encoded as a 24-byte header (rows, cols as u64 LE plus
//! a dtype tag and padding) followed by the column-major elements in
//! little-endian order. A 1 x N member doubles as a plain vector.

pub mod group;

pub use group::{Group, MetaValue, Metadata, StorageVersion, CURRENT_STORAGE_VERSION};

use crate::error::{Error, Result};
use crate::matrix::ColMajorMatrix;
use crate::types::{Dtype, FeatureElement};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Byte size of an array member header.
pub const MEMBER_HEADER_LEN: usize = 24;

/// Opaque blob/slab store with range reads and whole-blob writes.
///
/// Member names may contain `/` separators; the store treats them as a flat
/// namespace with hierarchical naming.
pub trait ArrayStore: Send + Sync {
    /// Replace the member `name` with `bytes`.
    fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Read the whole member.
    fn read_blob(&self, name: &str) -> Result<Vec<u8>>;

    /// Read `len` bytes of the member starting at byte `offset`.
    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Total size of the member in bytes.
    fn blob_len(&self, name: &str) -> Result<u64>;

    /// `true` if the member exists.
    fn exists(&self, name: &str) -> bool;

    /// Atomically move a member to a new name, replacing any existing one.
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Directory-backed array store. Each member is a file under the root;
/// reads are served through memory maps.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn map(&self, name: &str) -> Result<Mmap> {
        let path = self.path_of(name);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingMember {
                    name: name.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        // Safety: members are written whole and never mutated in place;
        // concurrent truncation is outside the store contract.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap)
    }
}

impl ArrayStore for FsStore {
    fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_blob(&self, name: &str) -> Result<Vec<u8>> {
        Ok(self.map(name)?.to_vec())
    }

    fn read_range(&self, name: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mmap = self.map(name)?;
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= mmap.len());
        match end {
            Some(end) => Ok(mmap[start..end].to_vec()),
            None => Err(Error::Corruption {
                name: name.to_string(),
                reason: format!(
                    "range {}..{} beyond member of {} bytes",
                    start,
                    start + len,
                    mmap.len()
                ),
            }),
        }
    }

    fn blob_len(&self, name: &str) -> Result<u64> {
        let meta = fs::metadata(self.path_of(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingMember {
                    name: name.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        Ok(meta.len())
    }

    fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_path = self.path_of(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.path_of(from), to_path)?;
        Ok(())
    }
}

/// Encode a matrix as a store member blob.
pub fn encode_matrix<T: FeatureElement>(m: &ColMajorMatrix<T>) -> Vec<u8> {
    let mut out = Vec::with_capacity(MEMBER_HEADER_LEN + m.data().len() * T::BYTES);
    out.extend_from_slice(&(m.num_rows() as u64).to_le_bytes());
    out.extend_from_slice(&(m.num_cols() as u64).to_le_bytes());
    out.push(T::DTYPE as u8);
    out.extend_from_slice(&[0u8; 7]);
    for x in m.data() {
        x.write_le(&mut out);
    }
    out
}

/// Decode a member blob produced by [`encode_matrix`].
pub fn decode_matrix<T: FeatureElement>(name: &str, bytes: &[u8]) -> Result<ColMajorMatrix<T>> {
    let (rows, cols) = decode_header::<T>(name, bytes)?;
    let expected = MEMBER_HEADER_LEN + rows * cols * T::BYTES;
    if bytes.len() != expected {
        return Err(Error::Corruption {
            name: name.to_string(),
            reason: format!("expected {} bytes, found {}", expected, bytes.len()),
        });
    }
    let data = decode_elements(&bytes[MEMBER_HEADER_LEN..], rows * cols);
    Ok(ColMajorMatrix::from_vec(rows, cols, data))
}

/// Parse and validate a member header, returning `(rows, cols)`.
pub fn decode_header<T: FeatureElement>(name: &str, bytes: &[u8]) -> Result<(usize, usize)> {
    if bytes.len() < MEMBER_HEADER_LEN {
        return Err(Error::Corruption {
            name: name.to_string(),
            reason: "member shorter than its header".to_string(),
        });
    }
    let rows = u64::from_le_bytes(bytes[0..8].try_into().expect("8-byte slice")) as usize;
    let cols = u64::from_le_bytes(bytes[8..16].try_into().expect("8-byte slice")) as usize;
    let dtype = Dtype::from_u8(bytes[16]);
    if dtype != Some(T::DTYPE) {
        return Err(Error::Corruption {
            name: name.to_string(),
            reason: format!("dtype tag {:?} does not match {:?}", dtype, T::DTYPE),
        });
    }
    Ok((rows, cols))
}

fn decode_elements<T: FeatureElement>(bytes: &[u8], count: usize) -> Vec<T> {
    let mut data = Vec::with_capacity(count);
    for i in 0..count {
        data.push(T::read_le(&bytes[i * T::BYTES..]));
    }
    data
}

/// Read the `(rows, cols)` shape of a stored matrix without loading it.
pub fn read_shape<T: FeatureElement>(store: &dyn ArrayStore, name: &str) -> Result<(usize, usize)> {
    let header = store.read_range(name, 0, MEMBER_HEADER_LEN)?;
    decode_header::<T>(name, &header)
}

/// Read columns `[col_start, col_stop)` of a stored matrix.
pub fn read_matrix_columns<T: FeatureElement>(
    store: &dyn ArrayStore,
    name: &str,
    col_start: usize,
    col_stop: usize,
) -> Result<ColMajorMatrix<T>> {
    let (rows, cols) = read_shape::<T>(store, name)?;
    if col_start > col_stop || col_stop > cols {
        return Err(Error::InvalidParameter(format!(
            "column range {}..{} out of bounds for {} columns",
            col_start, col_stop, cols
        )));
    }
    let width = col_stop - col_start;
    let offset = MEMBER_HEADER_LEN as u64 + (col_start * rows * T::BYTES) as u64;
    let bytes = store.read_range(name, offset, width * rows * T::BYTES)?;
    let data = decode_elements(&bytes, width * rows);
    Ok(ColMajorMatrix::from_vec(rows, width, data))
}

/// Persist a 1-D vector as a 1 x N member.
pub fn write_vector<T: FeatureElement>(
    store: &dyn ArrayStore,
    name: &str,
    values: &[T],
) -> Result<()> {
    let m = ColMajorMatrix::from_vec(1, values.len(), values.to_vec());
    store.write_blob(name, &encode_matrix(&m))
}

/// Read a member written by [`write_vector`].
pub fn read_vector<T: FeatureElement>(store: &dyn ArrayStore, name: &str) -> Result<Vec<T>> {
    let m = decode_matrix::<T>(name, &store.read_blob(name)?)?;
    if m.num_rows() != 1 {
        return Err(Error::Corruption {
            name: name.to_string(),
            reason: format!("expected a 1-row vector, found {} rows", m.num_rows()),
        });
    }
    Ok(m.data().to_vec())
}

/// Persist a matrix member.
pub fn write_matrix<T: FeatureElement>(
    store: &dyn ArrayStore,
    name: &str,
    m: &ColMajorMatrix<T>,
) -> Result<()> {
    store.write_blob(name, &encode_matrix(m))
}

/// Read a whole matrix member.
pub fn read_matrix<T: FeatureElement>(
    store: &dyn ArrayStore,
    name: &str,
) -> Result<ColMajorMatrix<T>> {
    decode_matrix(name, &store.read_blob(name)?)
}
