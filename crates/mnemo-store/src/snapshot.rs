//! Self-describing JSON snapshot of a whole store.
//!
//! ```json
//! { "format_version": 1, "dimension": 384, "metric": "cosine",
//!   "exported_at": "...", "nodes": [...], "edges": [...], "aliases": {...} }
//! ```
//!
//! Embeddings travel inside each node. The version is checked before the
//! body is decoded, so a future layout fails with `IncompatibleFormat`
//! rather than a confusing field error.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use mnemo_core::error::{MnemoError, Result};
use mnemo_core::types::{DistanceMetric, Edge, Node};

/// The only layout this build reads and writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub exported_at: DateTime<Utc>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    /// Content hashes of merged-away nodes, mapped to their merge base.
    #[serde(default)]
    pub aliases: BTreeMap<String, Uuid>,
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(default)]
    format_version: u32,
}

impl Snapshot {
    /// Decode from JSON, rejecting unknown format versions.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(MnemoError::IncompatibleFormat {
                found: probe.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut bytes = Vec::new();
        BufReader::new(reader).read_to_end(&mut bytes)?;
        Self::from_json_slice(&bytes)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let snapshot = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "Snapshot read"
        );
        Ok(snapshot)
    }

    /// Write to `path` via a temporary sibling file and a rename.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        self.to_writer(std::fs::File::create(&tmp)?)?;
        std::fs::rename(&tmp, path)?;
        info!(
            path = %path.display(),
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            "Snapshot written"
        );
        Ok(())
    }
}
