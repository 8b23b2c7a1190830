//! Part-file writer and merge.

use super::{read_batches, records_to_batch, schema};
use crate::error::{PipelineError, Result};
use crate::source::RecordChunk;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some(concat!("journey-analytics ", env!("CARGO_PKG_VERSION")).to_string()),
    };
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Writes one run's chunks to part files and merges them into the snapshot.
///
/// Part files are named `<target>.<run_id>.part<N>.parquet`, so two writers
/// with different run ids never touch each other's files. Any part still on
/// disk when the writer is dropped is removed; removal failures are logged.
#[derive(Debug)]
pub struct SnapshotWriter {
    target: PathBuf,
    run_id: String,
    parts: Vec<PathBuf>,
    rows_written: u64,
    bytes_written: u64,
}

impl SnapshotWriter {
    /// Prepare a writer for `target`, creating its directory if needed.
    pub fn begin(target: impl Into<PathBuf>, run_id: impl Into<String>) -> Result<Self> {
        let target = target.into();
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PipelineError::snapshot(parent, e))?;
        }

        Ok(Self {
            target,
            run_id: run_id.into(),
            parts: Vec::new(),
            rows_written: 0,
            bytes_written: 0,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Part files written so far, in chunk order.
    pub fn parts(&self) -> &[PathBuf] {
        &self.parts
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn part_path(&self, index: usize) -> PathBuf {
        suffixed(&self.target, &format!(".{}.part{}.parquet", self.run_id, index))
    }

    fn temp_path(&self) -> PathBuf {
        suffixed(&self.target, &format!(".{}.tmp", self.run_id))
    }

    /// Write one chunk to its own part file.
    pub fn write_part(&mut self, chunk: &RecordChunk) -> Result<PathBuf> {
        let path = self.part_path(self.parts.len());
        let batch = records_to_batch(&chunk.records).map_err(|e| PipelineError::snapshot(&path, e))?;

        let file = File::create(&path).map_err(|e| PipelineError::snapshot(&path, e))?;
        // Track before writing so a failed part is still cleaned up
        self.parts.push(path.clone());

        let mut writer = ArrowWriter::try_new(file, schema(), Some(writer_properties()))
            .map_err(|e| PipelineError::snapshot(&path, e))?;
        writer.write(&batch).map_err(|e| PipelineError::snapshot(&path, e))?;
        writer.close().map_err(|e| PipelineError::snapshot(&path, e))?;

        let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        self.rows_written += chunk.len() as u64;
        self.bytes_written += size;
        tracing::debug!("Wrote part {} ({} rows, {} bytes)", path.display(), chunk.len(), size);

        Ok(path)
    }

    fn write_merged(&self, temp: &Path) -> Result<()> {
        let file = File::create(temp).map_err(|e| PipelineError::snapshot(temp, e))?;
        let mut writer = ArrowWriter::try_new(file, schema(), Some(writer_properties()))
            .map_err(|e| PipelineError::snapshot(temp, e))?;

        for part in &self.parts {
            for batch in read_batches(part)? {
                writer.write(&batch).map_err(|e| PipelineError::snapshot(temp, e))?;
            }
        }

        let file = writer.into_inner().map_err(|e| PipelineError::snapshot(temp, e))?;
        file.sync_all().map_err(|e| PipelineError::snapshot(temp, e))?;
        Ok(())
    }

    /// Concatenate the parts in order and publish them as the snapshot.
    ///
    /// The merged file is written next to the target and renamed over it, so
    /// the previous snapshot stays readable until the new one is complete.
    /// Returns `None` without touching the target when no part was written.
    pub fn merge(mut self) -> Result<Option<PathBuf>> {
        if self.parts.is_empty() {
            tracing::info!("No parts written, keeping existing snapshot");
            return Ok(None);
        }

        let temp = self.temp_path();
        if let Err(e) = self.write_merged(&temp) {
            remove_best_effort(&temp);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp, &self.target) {
            remove_best_effort(&temp);
            return Err(PipelineError::snapshot(&self.target, e));
        }

        tracing::info!(
            "Merged {} parts ({} rows) into {}",
            self.parts.len(),
            self.rows_written,
            self.target.display()
        );

        self.remove_parts();
        Ok(Some(self.target.clone()))
    }

    fn remove_parts(&mut self) {
        for part in self.parts.drain(..) {
            remove_best_effort(&part);
        }
    }
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.remove_parts();
    }
}
