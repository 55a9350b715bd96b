use std::time::Duration;

/// Engine tuning knobs. Memory ceilings are explicit here instead of being
/// sniffed from the runtime; constrained hosts use [`EngineConfig::constrained`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Global cap on peer connections across all torrents.
    pub max_connections: usize,
    /// Per-torrent peer cap.
    pub max_peers: usize,
    pub max_upload_slots: usize,
    /// Stale-partial eviction threshold is twice this.
    pub request_timeout: Duration,
    /// Single block requests older than this are cancelled.
    pub block_request_timeout: Duration,
    pub piece_abandon_timeout: Duration,
    pub piece_abandon_min_progress: f64,
    pub max_active_pieces: usize,
    pub max_buffered_bytes: u64,
    pub max_pool_size: usize,
    /// Extra connecting headroom above `max_peers`.
    pub burst_connections: usize,
    pub slow_peer_min_speed: u64,
    pub slow_peer_timeout: Duration,
    /// Bytes per second; zero means unlimited.
    pub download_limit: u64,
    pub upload_limit: u64,
    pub max_pipeline_depth: usize,
    /// Download rate from which a peer may claim pieces exclusively.
    pub fast_peer_speed: u64,
    pub maintenance_min_interval: Duration,
    pub maintenance_max_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 200,
            max_peers: 50,
            max_upload_slots: 8,
            request_timeout: Duration::from_secs(30),
            block_request_timeout: Duration::from_secs(10),
            piece_abandon_timeout: Duration::from_secs(30),
            piece_abandon_min_progress: 0.5,
            max_active_pieces: 512,
            max_buffered_bytes: 256 * 1024 * 1024,
            max_pool_size: 64,
            burst_connections: 5,
            slow_peer_min_speed: 1024,
            slow_peer_timeout: Duration::from_secs(60),
            download_limit: 0,
            upload_limit: 0,
            max_pipeline_depth: 500,
            fast_peer_speed: 256 * 1024,
            maintenance_min_interval: Duration::from_secs(1),
            maintenance_max_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Preset for memory-constrained hosts.
    pub fn constrained() -> Self {
        Self {
            max_buffered_bytes: 128 * 1024 * 1024,
            max_active_pieces: 128,
            max_pool_size: 16,
            ..Self::default()
        }
    }
}
