use serde::{Deserialize, Serialize};

/// Wire format used for merge-exchange pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SerdeKind {
    /// Arrow IPC stream framing.
    ArrowIpc,
}

impl Default for SerdeKind {
    fn default() -> Self {
        Self::ArrowIpc
    }
}

impl SerdeKind {
    /// Stable name used in runtime stats and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArrowIpc => "arrow-ipc",
        }
    }
}

/// Compression applied to merge-exchange page payloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// No compression.
    None,
    /// LZ4 frame compression.
    Lz4,
    /// Zstandard compression.
    Zstd,
}

impl Default for CompressionKind {
    fn default() -> Self {
        Self::None
    }
}

impl CompressionKind {
    /// Stable name used in runtime stats and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Shared-arbitrator configuration applied at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    /// Total memory capacity partitioned across all queries.
    pub memory_capacity_bytes: u64,
    /// Starting capacity granted to each new root pool.
    #[serde(default = "default_pool_init_capacity")]
    pub memory_pool_init_capacity: u64,
    /// Grow/shrink granularity; growth requests are rounded up to this.
    #[serde(default = "default_pool_transfer_capacity")]
    pub memory_pool_transfer_capacity: u64,
    /// Per-request arbitration deadline in milliseconds.
    #[serde(default = "default_arbitration_timeout_ms")]
    pub arbitration_timeout_ms: u64,
    /// Whether global arbitration may abort a victim query as a last resort.
    #[serde(default = "default_abort_on_oom")]
    pub abort_on_oom: bool,
}

fn default_pool_init_capacity() -> u64 {
    128 * 1024 * 1024
}

fn default_pool_transfer_capacity() -> u64 {
    32 * 1024 * 1024
}

fn default_arbitration_timeout_ms() -> u64 {
    300_000
}

fn default_abort_on_oom() -> bool {
    true
}

impl Default for ArbitratorConfig {
    fn default() -> Self {
        Self {
            memory_capacity_bytes: 512 * 1024 * 1024, // 512MB
            memory_pool_init_capacity: default_pool_init_capacity(),
            memory_pool_transfer_capacity: default_pool_transfer_capacity(),
            arbitration_timeout_ms: default_arbitration_timeout_ms(),
            abort_on_oom: default_abort_on_oom(),
        }
    }
}

/// Merge operator configuration shared by local and exchange variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Rows per output batch emitted by the merge.
    pub output_batch_rows: usize,
    /// Total buffer budget split across exchange sources.
    #[serde(default = "default_merge_buffer_bytes")]
    pub max_merge_buffer_bytes: u64,
    /// Wire format of exchange pages.
    #[serde(default)]
    pub serde_kind: SerdeKind,
    /// Compression of exchange pages.
    #[serde(default)]
    pub compression_kind: CompressionKind,
}

fn default_merge_buffer_bytes() -> u64 {
    128 * 1024 * 1024
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            output_batch_rows: 1024,
            max_merge_buffer_bytes: default_merge_buffer_bytes(),
            serde_kind: SerdeKind::default(),
            compression_kind: CompressionKind::default(),
        }
    }
}
