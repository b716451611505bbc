//! Configuration settings for Hark.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub ingestion: IngestionSettings,
    pub asr: AsrSettings,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub scheduler: SchedulerSettings,
    pub alerts: AlertSettings,
    pub bot: BotSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Root directory for all persisted state.
    pub data_root: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_root: "~/.hark".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Submission intake and claim-lease settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    /// Window within which identical (user, source) submissions are rejected, in hours.
    pub dedup_window_hours: u32,
    /// Maximum attempts per stage before a submission is marked failed.
    pub max_attempts: u32,
    /// Exponential backoff base between retries, in seconds.
    pub backoff_base_secs: u64,
    /// Backoff ceiling, in seconds.
    pub backoff_max_secs: u64,
    /// Claim lease duration, in seconds. Expired leases are reclaimed by the sweeper.
    pub lease_secs: u64,
    /// Non-terminal submission count at which new inserts are rejected.
    pub high_water_mark: u32,
    /// Synthetic user id recorded for submissions picked up from the ingress directory.
    pub ingress_user: String,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            dedup_window_hours: 24,
            max_attempts: 3,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            lease_secs: 600,
            high_water_mark: 100,
            ingress_user: "ingress".to_string(),
        }
    }
}

/// Speech-recognition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrSettings {
    /// ASR model identifier.
    pub model: String,
    /// Default language hint (None = auto-detect).
    pub language: Option<String>,
    /// Compute device preference (auto, cpu, gpu).
    pub device: String,
    /// Enable voice-activity detection.
    pub vad: bool,
    /// Use the deterministic fake transcriber instead of the real endpoint.
    pub use_fake: bool,
    /// Per-request timeout, in seconds.
    pub timeout_secs: u64,
    /// Duration in seconds for splitting long audio files.
    pub split_secs: u32,
    /// Maximum concurrent split-segment requests.
    pub max_concurrent_segments: usize,
}

impl Default for AsrSettings {
    fn default() -> Self {
        Self {
            model: "whisper-1".to_string(),
            language: None,
            device: "auto".to_string(),
            vad: true,
            use_fake: false,
            timeout_secs: 60,
            split_secs: 120,
            max_concurrent_segments: 3,
        }
    }
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Embedding model to use.
    pub model: String,
    /// Embedding dimensions.
    pub dimensions: u32,
    /// Chunks per embedding request.
    pub batch_size: usize,
    /// Per-batch timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 32,
            timeout_secs: 30,
        }
    }
}

/// Transcript chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Window size in characters.
    pub chunk_chars: usize,
    /// Overlap carried on each side of a window, in characters.
    pub overlap_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_chars: 300,
            overlap_chars: 75,
        }
    }
}

/// Retrieval and answer-generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Default retrieval variant (semantic, hybrid, hybrid+rerank, rewrite+hybrid+rerank).
    pub variant: String,
    /// Results returned to the caller.
    pub top_k: usize,
    /// Candidates fetched for re-ranking (must exceed top_k).
    pub fetch_k: usize,
    /// Weight of the semantic score in hybrid blending.
    pub semantic_weight: f32,
    /// Weight of the lexical score in hybrid blending.
    pub lexical_weight: f32,
    /// Query variants generated when rewriting is enabled.
    pub rewrite_variants: usize,
    /// Reciprocal-rank-fusion constant.
    pub rrf_k: u32,
    /// LLM model for answer generation and query rewriting.
    pub model: String,
    /// Maximum tokens for generated answers.
    pub max_tokens: u32,
    /// Generation temperature.
    pub temperature: f32,
    /// LLM call timeout, in seconds.
    pub timeout_secs: u64,
    /// Per-pair timeout during parallel re-rank scoring, in milliseconds.
    pub rerank_timeout_ms: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            variant: "hybrid+rerank".to_string(),
            top_k: 3,
            fetch_k: 20,
            semantic_weight: 0.7,
            lexical_weight: 0.3,
            rewrite_variants: 3,
            rrf_k: 60,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 256,
            temperature: 0.3,
            timeout_secs: 60,
            rerank_timeout_ms: 2000,
        }
    }
}

/// Scheduler loop and worker-pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Control loop tick, in milliseconds.
    pub tick_ms: u64,
    /// Concurrent download workers.
    pub download_slots: usize,
    /// Concurrent transcription workers.
    pub transcribe_slots: usize,
    /// Concurrent chunking workers.
    pub chunk_slots: usize,
    /// Concurrent embedding workers.
    pub embed_slots: usize,
    /// Ceiling across all stages.
    pub max_tasks: usize,
    /// Sensor interval overrides, in seconds.
    pub url_sensor_secs: u64,
    pub audio_file_sensor_secs: u64,
    pub health_sensor_secs: u64,
    pub cleanup_sensor_secs: u64,
    pub alert_sensor_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            download_slots: 2,
            transcribe_slots: 1,
            chunk_slots: 4,
            embed_slots: 4,
            max_tasks: 8,
            url_sensor_secs: 30,
            audio_file_sensor_secs: 60,
            health_sensor_secs: 300,
            cleanup_sensor_secs: 3600,
            alert_sensor_secs: 120,
        }
    }
}

/// Alerting thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    /// Sustained failure rate that raises an alert (fraction of terminal outcomes).
    pub failure_rate_threshold: f64,
    /// Window over which the failure rate is computed, in minutes.
    pub failure_window_mins: u32,
    /// Pending submission count that raises a backlog alert.
    pub backlog_threshold: u32,
    /// Claim-lease expirations per hour that raise an alert.
    pub lease_expiry_per_hour: u32,
    /// Artifact storage cap, in bytes.
    pub storage_cap_bytes: u64,
    /// Chat id receiving dispatched alerts (ADMIN_CHAT_ID).
    pub admin_chat_id: Option<String>,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.10,
            failure_window_mins: 15,
            backlog_threshold: 50,
            lease_expiry_per_hour: 3,
            storage_cap_bytes: 10 * 1024 * 1024 * 1024,
            admin_chat_id: None,
        }
    }
}

/// Chat surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSettings {
    /// Progress message refresh cadence, in seconds.
    pub progress_interval_secs: u64,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            progress_interval_secs: 3,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or the default location if None.
    /// Environment overrides are applied after the file is read.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        let mut settings = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Settings::default()
        };

        settings.apply_env();
        Ok(settings)
    }

    /// Apply recognized environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DATA_ROOT") {
            self.general.data_root = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.general.log_level = v;
        }
        if let Ok(v) = std::env::var("ASR_MODEL") {
            self.asr.model = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("DEVICE") {
            self.asr.device = v;
        }
        if let Ok(v) = std::env::var("ADMIN_CHAT_ID") {
            self.alerts.admin_chat_id = Some(v);
        }
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hark")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Expanded data root directory.
    pub fn data_root(&self) -> PathBuf {
        Self::expand_path(&self.general.data_root)
    }

    /// Path to the job store database.
    pub fn jobstore_path(&self) -> PathBuf {
        self.data_root().join("jobstore.db")
    }

    /// Path to the vector store database.
    pub fn vectorstore_path(&self) -> PathBuf {
        self.data_root().join("vectorstore").join("vectors.db")
    }

    /// Directory watched for dropped-in audio files.
    pub fn ingress_dir(&self) -> PathBuf {
        self.data_root().join("ingress")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.ingestion.dedup_window_hours, 24);
        assert_eq!(s.ingestion.max_attempts, 3);
        assert_eq!(s.chunking.chunk_chars, 300);
        assert_eq!(s.chunking.overlap_chars, 75);
        assert_eq!(s.embedding.batch_size, 32);
        assert_eq!(s.retrieval.rrf_k, 60);
        assert_eq!(s.scheduler.transcribe_slots, 1);
    }

    #[test]
    fn test_partial_toml() {
        let s: Settings = toml::from_str(
            r#"
            [general]
            data_root = "/tmp/hark-test"

            [retrieval]
            top_k = 5
            "#,
        )
        .unwrap();
        assert_eq!(s.general.data_root, "/tmp/hark-test");
        assert_eq!(s.retrieval.top_k, 5);
        assert_eq!(s.retrieval.fetch_k, 20);
    }
}
