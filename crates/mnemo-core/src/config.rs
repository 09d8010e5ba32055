use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MnemoError, Result};
use crate::types::{DistanceMetric, SearchMode};

/// Top-level configuration for a Mnemo engine instance.
///
/// Loaded from `~/.mnemo/config.toml` by the binary. Each section
/// corresponds to one component of the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MnemoConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
}

impl MnemoConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MnemoConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.vector.dimension == 0 {
            return Err(MnemoError::Config("vector.dimension must be > 0".into()));
        }
        if self.cache.max_entries == 0 {
            return Err(MnemoError::Config("cache.max_entries must be > 0".into()));
        }
        if self.cache.max_bytes == 0 {
            return Err(MnemoError::Config("cache.max_bytes must be > 0".into()));
        }
        self.consolidation.validate()
    }
}

/// General engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for snapshots and the persistent cache tier.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.mnemo/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GeneralConfig {
    /// `data_dir` with a leading `~` replaced by the user's home directory.
    pub fn data_dir_path(&self) -> PathBuf {
        if self.data_dir.starts_with('~') {
            let home = std::env::var("USERPROFILE")
                .or_else(|_| std::env::var("HOME"))
                .unwrap_or_else(|_| ".".to_string());
            PathBuf::from(self.data_dir.replacen('~', &home, 1))
        } else {
            PathBuf::from(&self.data_dir)
        }
    }
}

/// Which search mode the engine picks for a plain `query` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SearchStrategy {
    /// Always use one mode.
    Fixed { mode: SearchMode },
    /// Exact below `approximate_above` indexed vectors, approximate at or
    /// above it.
    Threshold { approximate_above: usize },
}

impl Default for SearchStrategy {
    fn default() -> Self {
        SearchStrategy::Threshold {
            approximate_above: 10_000,
        }
    }
}

impl SearchStrategy {
    /// Resolve the mode for an index currently holding `indexed` vectors.
    pub fn mode_for(&self, indexed: usize) -> SearchMode {
        match *self {
            SearchStrategy::Fixed { mode } => mode,
            SearchStrategy::Threshold { approximate_above } => {
                if indexed >= approximate_above {
                    SearchMode::Approximate
                } else {
                    SearchMode::Exact
                }
            }
        }
    }
}

/// Vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Embedding dimension, fixed per engine.
    pub dimension: usize,
    /// Distance function.
    pub metric: DistanceMetric,
    /// Mode selection for `query`.
    pub search: SearchStrategy,
    /// Number of IVF partitions. `None` means `ceil(sqrt(n))` at training time.
    pub ivf_partitions: Option<usize>,
    /// Partitions probed per approximate query.
    pub ivf_probes: usize,
    /// Lloyd iterations when training partitions.
    pub kmeans_iterations: usize,
    /// Below this many vectors approximate queries fall back to exact.
    pub min_training_size: usize,
    /// Hard cap on indexed vectors. `None` means unbounded.
    pub max_vectors: Option<usize>,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: DistanceMetric::Cosine,
            search: SearchStrategy::default(),
            ivf_partitions: None,
            ivf_probes: 8,
            kmeans_iterations: 10,
            min_training_size: 256,
            max_vectors: None,
        }
    }
}

/// Tiered cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries in the memory tier.
    pub max_entries: usize,
    /// Byte budget of the memory tier (estimated serialized size).
    pub max_bytes: usize,
    /// TTL applied when `set` is called without one. `None` means no expiry.
    pub default_ttl_secs: Option<u64>,
    /// Whether entries spill to the on-disk tier.
    pub persist: bool,
    /// Directory for the disk tier. Relative paths resolve under `data_dir`.
    pub cache_dir: String,
    /// How long a caller waits on disk I/O before degrading to memory-only.
    pub io_timeout_ms: u64,
    /// Capacity of the engine's internal query-result cache.
    pub query_cache_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 64 * 1024 * 1024,
            default_ttl_secs: None,
            persist: false,
            cache_dir: "cache".to_string(),
            io_timeout_ms: 500,
            query_cache_entries: 256,
        }
    }
}

/// Relative weights of the importance score components. Must sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceWeights {
    pub recency: f64,
    pub frequency: f64,
    pub connectivity: f64,
    pub explicit: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            frequency: 0.3,
            connectivity: 0.2,
            explicit: 0.2,
        }
    }
}

impl ImportanceWeights {
    pub fn sum(&self) -> f64 {
        self.recency + self.frequency + self.connectivity + self.explicit
    }
}

/// Consolidation, decay and reinforcement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Node count at which `should_consolidate` turns true.
    pub consolidation_threshold: usize,
    /// Hard cap on nodes kept by a pass.
    pub max_memories: usize,
    /// Minimum score for a node to be kept.
    pub importance_threshold: f64,
    /// Pairwise similarity above which kept nodes merge.
    pub similarity_threshold: f64,
    /// Score component weights.
    #[serde(default)]
    pub weights: ImportanceWeights,
    /// τ in `recency = exp(-Δt / τ)`, in hours.
    pub recency_half_life_hours: f64,
    /// N in `frequency = min(1, access_count / N)`.
    pub frequency_saturation: f64,
    /// M in `connectivity = min(1, edge_count / M)`.
    pub connectivity_saturation: f64,
    /// Time scale of the temporal-proximity factor in merge similarity.
    pub merge_time_scale_hours: f64,
    /// Default half-life for the forgetting curve.
    pub decay_half_life_days: f64,
    /// Nodes whose strength falls below this leave the active set.
    pub strength_floor: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            consolidation_threshold: 1_000,
            max_memories: 500,
            importance_threshold: 0.1,
            similarity_threshold: 0.8,
            weights: ImportanceWeights::default(),
            recency_half_life_hours: 72.0,
            frequency_saturation: 10.0,
            connectivity_saturation: 5.0,
            merge_time_scale_hours: 24.0,
            decay_half_life_days: 7.0,
            strength_floor: 0.1,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<()> {
        let sum = self.weights.sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(MnemoError::Config(format!(
                "consolidation.weights must sum to 1.0, got {sum}"
            )));
        }
        for (name, value) in [
            ("recency_half_life_hours", self.recency_half_life_hours),
            ("frequency_saturation", self.frequency_saturation),
            ("connectivity_saturation", self.connectivity_saturation),
            ("merge_time_scale_hours", self.merge_time_scale_hours),
            ("decay_half_life_days", self.decay_half_life_days),
        ] {
            if value <= 0.0 {
                return Err(MnemoError::Config(format!(
                    "consolidation.{name} must be > 0"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.strength_floor) {
            return Err(MnemoError::Config(
                "consolidation.strength_floor must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}
