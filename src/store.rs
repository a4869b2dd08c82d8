// ========================================================================================
//
//                        THE DRAW STORE: CHUNK-SCOPED PERSISTENCE
//
// ========================================================================================
//
// One directory per model identifier:
//
//   <output_dir>/<model_id>/
//       manifest.toml
//       design.parquet
//       chunks/chunk-000000.rows-0-9999.parquet
//       chunks/chunk-000001.rows-10000-19999.parquet
//       chunks/.chunk-000002.parquet.partial        (in flight, never listed)
//
// A chunk becomes visible only through the final rename. Anything still carrying
// the `.partial` suffix is an interrupted write and is swept on the next run.

use crate::config::{ConfigurationError, validate_model_id};
use crate::design::{DesignError, DesignMatrix};
use crate::emit::DrawBatch;
use crate::indexer::{Chunk, ChunkPlan};
use crate::types::{ChunkIndex, RowId};
use log::{debug, warn};
use natord::compare;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CHUNKS_DIR: &str = "chunks";
const DESIGN_FILE: &str = "design.parquet";
const MANIFEST_FILE: &str = "manifest.toml";
const CHUNK_PREFIX: &str = "chunk-";
const PARQUET_SUFFIX: &str = ".parquet";
const PARTIAL_SUFFIX: &str = ".partial";

/// Disk-level failures. A chunk whose write failed is never published.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Parquet error on '{path}': {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: PolarsError,
    },
    #[error("Failed to serialize the run manifest: {0}")]
    ManifestSerialize(#[from] toml::ser::Error),
    #[error("Failed to parse the run manifest '{path}': {source}")]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("The persisted design matrix is invalid: {0}")]
    Design(#[from] DesignError),
    #[error("No persisted design matrix was found at '{0}'. Run the pipeline first.")]
    MissingDesign(PathBuf),
    #[error("Invalid store configuration: {0}")]
    Configuration(#[from] ConfigurationError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parquet_error(path: &Path) -> impl FnOnce(PolarsError) -> PersistenceError + '_ {
    move |source| PersistenceError::Parquet {
        path: path.to_path_buf(),
        source,
    }
}

/// The shape of the run that wrote a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub model_id: String,
    pub num_rows: u64,
    pub chunk_size: usize,
    pub draw_count: usize,
    pub num_chunks: usize,
}

impl RunManifest {
    pub fn for_plan(model_id: &str, plan: &ChunkPlan, draw_count: usize) -> Self {
        Self {
            model_id: model_id.to_string(),
            num_rows: plan.num_rows(),
            chunk_size: plan.chunk_size(),
            draw_count,
            num_chunks: plan.len(),
        }
    }

    /// Confirms that a resumed run would produce chunks identical in shape to the stored ones.
    pub fn check_resumable(&self, requested: &RunManifest) -> Result<(), ConfigurationError> {
        let mismatch = |field: &'static str, stored: String, requested: String| {
            ConfigurationError::ResumeMismatch {
                model_id: self.model_id.clone(),
                field,
                stored,
                requested,
            }
        };
        if self.num_rows != requested.num_rows {
            return Err(mismatch(
                "num_rows",
                self.num_rows.to_string(),
                requested.num_rows.to_string(),
            ));
        }
        if self.chunk_size != requested.chunk_size {
            return Err(mismatch(
                "chunk_size",
                self.chunk_size.to_string(),
                requested.chunk_size.to_string(),
            ));
        }
        if self.draw_count != requested.draw_count {
            return Err(mismatch(
                "draw_count",
                self.draw_count.to_string(),
                requested.draw_count.to_string(),
            ));
        }
        Ok(())
    }
}

/// A published chunk file and the row range its name declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkArtifact {
    pub index: ChunkIndex,
    pub first_row: RowId,
    pub last_row: RowId,
    pub path: PathBuf,
}

impl ChunkArtifact {
    #[inline]
    pub fn contains(&self, row_id: RowId) -> bool {
        row_id >= self.first_row && row_id <= self.last_row
    }
}

fn chunk_file_name(chunk: &Chunk) -> String {
    format!(
        "{CHUNK_PREFIX}{:06}.rows-{}-{}{PARQUET_SUFFIX}",
        chunk.index.0,
        chunk.first_row().0,
        chunk.last_row().0
    )
}

fn partial_file_name(index: ChunkIndex) -> String {
    format!(".{CHUNK_PREFIX}{:06}{PARQUET_SUFFIX}{PARTIAL_SUFFIX}", index.0)
}

/// Parses `chunk-000003.rows-30000-39999.parquet`.
fn parse_chunk_file_name(name: &str) -> Option<(ChunkIndex, RowId, RowId)> {
    let stem = name.strip_prefix(CHUNK_PREFIX)?.strip_suffix(PARQUET_SUFFIX)?;
    let (index, range) = stem.split_once(".rows-")?;
    let (first, last) = range.split_once('-')?;
    let index = index.parse::<usize>().ok()?;
    let first = first.parse::<u64>().ok()?;
    let last = last.parse::<u64>().ok()?;
    (first <= last).then_some((ChunkIndex(index), RowId(first), RowId(last)))
}

/// The on-disk store of one model. Writes are per-chunk atomic.
#[derive(Debug, Clone)]
pub struct DrawStore {
    model_id: String,
    root: PathBuf,
    chunks_dir: PathBuf,
}

impl DrawStore {
    /// Opens (creating if needed) the store for `model_id` under `output_dir`.
    pub fn open(output_dir: &Path, model_id: &str) -> Result<Self, PersistenceError> {
        validate_model_id(model_id)?;
        let root = output_dir.join(model_id);
        let chunks_dir = root.join(CHUNKS_DIR);
        fs::create_dir_all(&chunks_dir).map_err(io_error(&chunks_dir))?;
        Ok(Self {
            model_id: model_id.to_string(),
            root,
            chunks_dir,
        })
    }

    /// Opens an existing store without creating anything.
    pub fn open_existing(output_dir: &Path, model_id: &str) -> Result<Self, PersistenceError> {
        validate_model_id(model_id)?;
        let root = output_dir.join(model_id);
        let chunks_dir = root.join(CHUNKS_DIR);
        if !chunks_dir.is_dir() {
            return Err(PersistenceError::Io {
                path: chunks_dir,
                source: io::Error::new(io::ErrorKind::NotFound, "no draw store for this model"),
            });
        }
        Ok(Self {
            model_id: model_id.to_string(),
            root,
            chunks_dir,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunks_dir(&self) -> &Path {
        &self.chunks_dir
    }

    pub fn design_path(&self) -> PathBuf {
        self.root.join(DESIGN_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn partial_path(&self, index: ChunkIndex) -> PathBuf {
        self.chunks_dir.join(partial_file_name(index))
    }

    /// Writes a frame to `temp_path`, fsyncs it, then renames it onto `final_path`.
    /// On any failure the temporary file is removed and nothing is published.
    fn write_atomically(
        &self,
        df: &mut DataFrame,
        temp_path: &Path,
        final_path: &Path,
    ) -> Result<(), PersistenceError> {
        let write_result = (|| -> Result<(), PersistenceError> {
            let mut file = File::create(temp_path).map_err(io_error(temp_path))?;
            ParquetWriter::new(&mut file)
                .finish(df)
                .map_err(parquet_error(temp_path))?;
            file.sync_all().map_err(io_error(temp_path))?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(temp_path);
            return Err(err);
        }

        fs::rename(temp_path, final_path).map_err(|source| {
            let _ = fs::remove_file(temp_path);
            PersistenceError::Io {
                path: final_path.to_path_buf(),
                source,
            }
        })
    }

    /// Durably publishes one chunk's draws. Replaces a stale partial or a previously
    /// published artifact for the same chunk index.
    pub fn write_chunk(
        &self,
        chunk: &Chunk,
        batch: &DrawBatch,
    ) -> Result<ChunkArtifact, PersistenceError> {
        let final_path = self.chunks_dir.join(chunk_file_name(chunk));
        let temp_path = self.partial_path(chunk.index);
        let mut df = batch.to_dataframe().map_err(parquet_error(&final_path))?;

        let superseded: Vec<ChunkArtifact> = self
            .published_chunks()?
            .into_iter()
            .filter(|artifact| artifact.index == chunk.index && artifact.path != final_path)
            .collect();

        self.write_atomically(&mut df, &temp_path, &final_path)?;

        for artifact in superseded {
            debug!(
                "Removing superseded artifact {} for chunk {}",
                artifact.path.display(),
                chunk.index
            );
            fs::remove_file(&artifact.path).map_err(io_error(&artifact.path))?;
        }

        debug!(
            "Published chunk {} ({} records) to {}",
            chunk.index,
            batch.len(),
            final_path.display()
        );
        Ok(ChunkArtifact {
            index: chunk.index,
            first_row: chunk.first_row(),
            last_row: chunk.last_row(),
            path: final_path,
        })
    }

    /// Every published chunk artifact, in natural file-name order.
    pub fn published_chunks(&self) -> Result<Vec<ChunkArtifact>, PersistenceError> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.chunks_dir).map_err(io_error(&self.chunks_dir))? {
            let entry = entry.map_err(io_error(&self.chunks_dir))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort_by(|a, b| compare(a, b));

        Ok(names
            .into_iter()
            .filter_map(|name| {
                let (index, first_row, last_row) = parse_chunk_file_name(&name)?;
                Some(ChunkArtifact {
                    index,
                    first_row,
                    last_row,
                    path: self.chunks_dir.join(name),
                })
            })
            .collect())
    }

    /// True if the exact artifact this chunk would produce is already published.
    pub fn is_published(&self, chunk: &Chunk) -> bool {
        self.chunks_dir.join(chunk_file_name(chunk)).is_file()
    }

    /// Removes interrupted writes. Returns how many were removed.
    pub fn sweep_partials(&self) -> Result<usize, PersistenceError> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.chunks_dir).map_err(io_error(&self.chunks_dir))? {
            let entry = entry.map_err(io_error(&self.chunks_dir))?;
            let path = entry.path();
            let is_partial = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
            if is_partial {
                warn!("Removing interrupted chunk write {}", path.display());
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Removes every published chunk and partial write, for a fresh run.
    pub fn clear_chunks(&self) -> Result<usize, PersistenceError> {
        let mut removed = self.sweep_partials()?;
        for artifact in self.published_chunks()? {
            fs::remove_file(&artifact.path).map_err(io_error(&artifact.path))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Reads one published chunk back as a frame.
    pub fn read_chunk(&self, artifact: &ChunkArtifact) -> Result<DataFrame, PersistenceError> {
        let file = File::open(&artifact.path).map_err(io_error(&artifact.path))?;
        ParquetReader::new(file)
            .finish()
            .map_err(parquet_error(&artifact.path))
    }

    /// Persists the design matrix once per run, keyed by `row_id`.
    pub fn write_design(&self, design: &DesignMatrix) -> Result<(), PersistenceError> {
        let final_path = self.design_path();
        let temp_path = self.root.join(format!(".{DESIGN_FILE}{PARTIAL_SUFFIX}"));
        let mut df = design.to_dataframe().map_err(parquet_error(&final_path))?;
        self.write_atomically(&mut df, &temp_path, &final_path)
    }

    pub fn read_design(&self) -> Result<DesignMatrix, PersistenceError> {
        let path = self.design_path();
        if !path.is_file() {
            return Err(PersistenceError::MissingDesign(path));
        }
        let file = File::open(&path).map_err(io_error(&path))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(parquet_error(&path))?;
        Ok(DesignMatrix::from_dataframe(&df)?)
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<(), PersistenceError> {
        let final_path = self.manifest_path();
        let temp_path = self.root.join(format!(".{MANIFEST_FILE}{PARTIAL_SUFFIX}"));
        let toml_string = toml::to_string_pretty(manifest)?;
        let write_result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(toml_string.as_bytes())?;
            file.sync_all()
        })();
        if let Err(source) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(PersistenceError::Io {
                path: temp_path,
                source,
            });
        }
        fs::rename(&temp_path, &final_path).map_err(io_error(&final_path))
    }

    pub fn read_manifest(&self) -> Result<Option<RunManifest>, PersistenceError> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(None);
        }
        let toml_string = fs::read_to_string(&path).map_err(io_error(&path))?;
        let manifest = toml::from_str(&toml_string)
            .map_err(|source| PersistenceError::ManifestParse { path, source })?;
        Ok(Some(manifest))
    }
}
