//! IVF-Flat index: k-means partitioning with exact search inside probed
//! partitions.
//!
//! Build pipeline: train centroids on a (possibly sub-sampled) training
//! set, assign every database vector to its nearest centroid, shuffle the
//! columns so each partition is contiguous, and persist the four artifacts
//! (centroids, partition offsets, shuffled ids, shuffled vectors).
//!
//! Queries come in two execution modes (see [`query`]): infinite-RAM with
//! the whole shuffled matrix resident, and finite-RAM streaming it from the
//! array store in bounded blocks.

pub mod query;

use crate::error::{Error, Result};
use crate::flat::qv_partition;
use crate::kmeans::{KMeans, KMeansInit};
use crate::matrix::{ColMajorMatrix, ColumnMajor};
use crate::scoring::Metric;
use crate::storage::{self, ArrayStore, Group, StorageVersion, CURRENT_STORAGE_VERSION};
use crate::types::{ExternalId, FeatureElement};
use tracing::info;

/// Build-time parameters for [`IvfFlatIndex`].
#[derive(Debug, Clone)]
pub struct IvfFlatParams {
    /// Number of partitions (k-means centroids).
    pub nlist: usize,
    /// Lloyd iterations during training.
    pub max_iters: usize,
    /// Convergence tolerance carried to the trainer.
    pub tolerance: f64,
    /// Worker count; 0 means available hardware parallelism.
    pub nthreads: usize,
    /// Seed for centroid initialization.
    pub seed: u64,
    /// Distance metric. Only L2 is supported.
    pub metric: Metric,
}

impl IvfFlatParams {
    pub fn new(nlist: usize) -> Self {
        Self {
            nlist,
            max_iters: 10,
            tolerance: 1e-4,
            nthreads: 0,
            seed: 0,
            metric: Metric::L2,
        }
    }

    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    pub fn with_nthreads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Inverted-file flat index over a column-major vector set.
pub struct IvfFlatIndex<T: FeatureElement> {
    dimension: usize,
    nlist: usize,
    max_iters: usize,
    tolerance: f64,
    nthreads: usize,
    seed: u64,
    centroids: ColMajorMatrix<f32>,
    /// Partition offsets, length nlist + 1; partition j owns shuffled
    /// columns `[indices[j], indices[j + 1])`.
    indices: Vec<u64>,
    shuffled_ids: Vec<ExternalId>,
    /// Resident shuffled vectors; `None` when opened in finite-RAM mode.
    shuffled_db: Option<ColMajorMatrix<T>>,
    /// Store name of the shuffled vector member, when opened from a group.
    parts_member: Option<String>,
    trained: bool,
}

impl<T: FeatureElement> IvfFlatIndex<T> {
    pub fn new(dimension: usize, params: IvfFlatParams) -> Result<Self> {
        params.metric.require_supported()?;
        if dimension == 0 || params.nlist == 0 {
            return Err(Error::InvalidParameter(
                "dimension and nlist must be nonzero".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            nlist: params.nlist,
            max_iters: params.max_iters,
            tolerance: params.tolerance,
            nthreads: params.nthreads,
            seed: params.seed,
            centroids: ColMajorMatrix::new(dimension, params.nlist),
            indices: Vec::new(),
            shuffled_ids: Vec::new(),
            shuffled_db: None,
            parts_member: None,
            trained: false,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    /// Number of indexed vectors.
    pub fn ntotal(&self) -> usize {
        self.shuffled_ids.len()
    }

    pub fn centroids(&self) -> &ColMajorMatrix<f32> {
        &self.centroids
    }

    /// Partition offsets (length nlist + 1).
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    pub fn shuffled_ids(&self) -> &[ExternalId] {
        &self.shuffled_ids
    }

    /// `true` when the shuffled vectors are resident in memory.
    pub fn is_infinite_ram(&self) -> bool {
        self.shuffled_db.is_some()
    }

    /// Train partition centroids.
    pub fn train<M: ColumnMajor<T>>(&mut self, training_set: &M, init: KMeansInit) -> Result<()> {
        let mut trainer = KMeans::new(
            self.dimension,
            self.nlist,
            self.max_iters,
            self.tolerance,
            self.nthreads,
            self.seed,
        )?;
        trainer.train(training_set, init)?;
        self.centroids = trainer.into_centroids();
        self.trained = true;
        info!(nlist = self.nlist, "ivf centroids trained");
        Ok(())
    }

    /// Install externally trained centroids instead of calling [`train`].
    ///
    /// [`train`]: IvfFlatIndex::train
    pub fn set_centroids(&mut self, centroids: ColMajorMatrix<f32>) -> Result<()> {
        if centroids.num_rows() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: centroids.num_rows(),
            });
        }
        if centroids.num_cols() != self.nlist {
            return Err(Error::InvalidParameter(format!(
                "expected {} centroids, got {}",
                self.nlist,
                centroids.num_cols()
            )));
        }
        self.centroids = centroids;
        self.trained = true;
        Ok(())
    }

    /// Partition-assign and shuffle the database vectors into the index.
    ///
    /// `ids` supplies the external id of each column; `None` assigns
    /// `0..N`. Each column lands in its partition's contiguous range with
    /// its id at the same slot, so writes are disjoint per source column.
    pub fn add<M: ColumnMajor<T>>(&mut self, db: &M, ids: Option<&[ExternalId]>) -> Result<()> {
        if !self.trained {
            return Err(Error::InvalidParameter(
                "train must run before add".to_string(),
            ));
        }
        if db.num_rows() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: db.num_rows(),
            });
        }
        let n = db.num_cols();
        if let Some(ids) = ids {
            if ids.len() != n {
                return Err(Error::InvalidParameter(format!(
                    "{} ids for {} vectors",
                    ids.len(),
                    n
                )));
            }
        }

        let parts = qv_partition(&self.centroids, db, self.nthreads)?;

        let mut degrees = vec![0u64; self.nlist];
        for &p in &parts {
            degrees[p] += 1;
        }
        let mut indices = vec![0u64; self.nlist + 1];
        for j in 0..self.nlist {
            indices[j + 1] = indices[j] + degrees[j];
        }

        let mut shuffled_db = ColMajorMatrix::<T>::new(self.dimension, n);
        let mut shuffled_ids = vec![0 as ExternalId; n];
        let mut cursor = indices.clone();
        for (i, &bin) in parts.iter().enumerate() {
            let slot = cursor[bin] as usize;
            shuffled_ids[slot] = ids.map_or(i as ExternalId, |ids| ids[i]);
            shuffled_db.col_mut(slot).copy_from_slice(db.col(i));
            cursor[bin] += 1;
        }

        self.indices = indices;
        self.shuffled_ids = shuffled_ids;
        self.shuffled_db = Some(shuffled_db);
        info!(ntotal = n, nlist = self.nlist, "ivf partitions built");
        Ok(())
    }

    /// Persist the index as a storage group at `uri`.
    ///
    /// Members are staged under the group's `temp_data` sub-group and
    /// promoted once complete, so a partial write never clobbers a
    /// readable group.
    pub fn write(&self, store: &dyn ArrayStore, uri: &str) -> Result<()> {
        let shuffled_db = self.shuffled_db.as_ref().ok_or_else(|| {
            Error::InvalidParameter("nothing to write: index holds no vectors".to_string())
        })?;

        let mut group = Group::create(store, uri, CURRENT_STORAGE_VERSION);
        let version = group.version();

        let members = [
            version.centroids_member(),
            version.index_member(),
            version.ids_member(),
            version.parts_member(),
        ];
        storage::write_matrix(store, &group.temp_member(members[0]), &self.centroids)?;
        storage::write_vector(store, &group.temp_member(members[1]), &self.indices)?;
        storage::write_vector(store, &group.temp_member(members[2]), &self.shuffled_ids)?;
        storage::write_matrix(store, &group.temp_member(members[3]), shuffled_db)?;
        for member in members {
            group.promote(member)?;
        }

        let meta = group.metadata_mut();
        meta.put_u64("dimension", self.dimension as u64);
        meta.put_u64("partitions", self.nlist as u64);
        meta.put_u64("ntotal", self.ntotal() as u64);
        group.write_metadata()?;
        info!(uri, ntotal = self.ntotal(), "ivf group written");
        Ok(())
    }

    /// Open a group with every artifact resident (infinite-RAM mode).
    pub fn open(store: &dyn ArrayStore, uri: &str) -> Result<Self> {
        let mut index = Self::open_finite(store, uri)?;
        let member = index.parts_member.clone().expect("set by open_finite");
        index.shuffled_db = Some(storage::read_matrix(store, &member)?);
        Ok(index)
    }

    /// Open a group leaving the shuffled vectors on storage (finite-RAM
    /// mode); queries must go through
    /// [`query_finite_ram`](IvfFlatIndex::query_finite_ram).
    pub fn open_finite(store: &dyn ArrayStore, uri: &str) -> Result<Self> {
        let group = Group::open(store, uri)?;
        let version = group.version();
        let meta = group.metadata();

        let dimension = meta.get_u64("dimension")? as usize;
        let nlist = meta.get_u64("partitions")? as usize;
        let ntotal = meta.get_u64("ntotal")? as usize;

        let centroids =
            storage::read_matrix::<f32>(store, &group.member(version.centroids_member()))?;
        if centroids.num_rows() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                got: centroids.num_rows(),
            });
        }

        let indices = load_partition_offsets(store, &group, version, nlist)?;
        let shuffled_ids =
            storage::read_vector::<ExternalId>(store, &group.member(version.ids_member()))?;
        if indices[nlist] as usize != ntotal || shuffled_ids.len() != ntotal {
            return Err(Error::Corruption {
                name: group.member(version.index_member()),
                reason: "partition offsets disagree with ntotal".to_string(),
            });
        }

        Ok(Self {
            dimension,
            nlist,
            max_iters: 0,
            tolerance: 0.0,
            nthreads: 0,
            seed: 0,
            centroids,
            indices,
            shuffled_ids,
            shuffled_db: None,
            parts_member: Some(group.member(version.parts_member())),
            trained: true,
        })
    }

    /// Set the worker count used by subsequent queries.
    pub fn set_nthreads(&mut self, nthreads: usize) {
        self.nthreads = nthreads;
    }

    pub(crate) fn nthreads(&self) -> usize {
        self.nthreads
    }

    pub(crate) fn shuffled_db(&self) -> Option<&ColMajorMatrix<T>> {
        self.shuffled_db.as_ref()
    }

    pub(crate) fn parts_member(&self) -> Option<&str> {
        self.parts_member.as_deref()
    }
}

/// Load the partition index member, accepting either per-partition sizes
/// (length nlist, prefix-summed here) or ready offsets (length nlist + 1).
fn load_partition_offsets(
    store: &dyn ArrayStore,
    group: &Group<'_>,
    version: StorageVersion,
    nlist: usize,
) -> Result<Vec<u64>> {
    let name = group.member(version.index_member());
    let raw = storage::read_vector::<u64>(store, &name)?;

    let offsets = if raw.len() == nlist {
        let mut offsets = vec![0u64; nlist + 1];
        for (j, &size) in raw.iter().enumerate() {
            offsets[j + 1] = offsets[j] + size;
        }
        offsets
    } else if raw.len() == nlist + 1 {
        raw
    } else {
        return Err(Error::Corruption {
            name,
            reason: format!(
                "partition index of length {} fits neither sizes ({}) nor offsets ({})",
                raw.len(),
                nlist,
                nlist + 1
            ),
        });
    };

    if offsets[0] != 0 || offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::Corruption {
            name,
            reason: "partition offsets are not monotone from zero".to_string(),
        });
    }
    Ok(offsets)
}
