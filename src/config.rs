//! Configuration (C14): `clap`-derived CLI/env surface
//!
//! Field names and `TAZER_*` env fallbacks mirror §6's "recognized options"
//! table. `ServerConfig` drives the accept loop's tier set; `ClientConfig`
//! drives the embedding application's `CacheHierarchy`.

use clap::Parser;
use std::path::PathBuf;

fn default_listen_addr() -> String {
    "0.0.0.0:4242".to_string()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tazer-server", about = "TAZeR block-cache acceleration server")]
pub struct ServerConfig {
    #[arg(long, env = "TAZER_LISTEN_ADDR", default_value_t = default_listen_addr())]
    pub listen_addr: String,

    #[arg(long, env = "TAZER_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    #[arg(long, env = "TAZER_SERVER_CACHE_SIZE", default_value_t = 256 * 1024 * 1024)]
    pub server_cache_size: u64,

    #[arg(long, env = "TAZER_SERVER_BLOCK_SIZE", default_value_t = 1024 * 1024)]
    pub server_block_size: u64,

    #[arg(long, env = "TAZER_SERVER_ASSOCIATIVITY", default_value_t = 8)]
    pub server_associativity: usize,

    #[arg(long, env = "TAZER_ENABLE_LOCAL_FILE_CACHE", default_value_t = false)]
    pub enable_local_file_cache: bool,

    #[arg(long, env = "TAZER_LOCAL_FILE_CACHE_SIZE", default_value_t = 1024 * 1024 * 1024)]
    pub local_file_cache_size: u64,

    #[arg(long, env = "TAZER_LOCAL_FILE_CACHE_BLOCK_SIZE", default_value_t = 1024 * 1024)]
    pub local_file_cache_block_size: u64,

    #[arg(long, env = "TAZER_LOCAL_FILE_CACHE_PATH", default_value = "/var/tmp/tazer-local-file.cache")]
    pub local_file_cache_path: PathBuf,

    #[arg(long, env = "TAZER_LOCAL_FILE_CACHE_ASSOCIATIVITY", default_value_t = 8)]
    pub local_file_cache_associativity: usize,

    #[arg(long, env = "TAZER_ENABLE_SHM_CACHE", default_value_t = false)]
    pub enable_shm_cache: bool,

    #[arg(long, env = "TAZER_SHARED_MEMORY_CACHE_SIZE", default_value_t = 256 * 1024 * 1024)]
    pub shared_memory_cache_size: u64,

    #[arg(long, env = "TAZER_SHARED_MEMORY_CACHE_BLOCK_SIZE", default_value_t = 1024 * 1024)]
    pub shared_memory_cache_block_size: u64,

    #[arg(long, env = "TAZER_SHARED_MEMORY_CACHE_ASSOCIATIVITY", default_value_t = 8)]
    pub shared_memory_cache_associativity: usize,

    #[arg(long, env = "TAZER_ENABLE_FILELOCK_CACHE", default_value_t = false)]
    pub enable_filelock_cache: bool,

    #[arg(long, env = "TAZER_BOUNDED_FILELOCK_CACHE_SIZE", default_value_t = 1024 * 1024 * 1024)]
    pub bounded_filelock_cache_size: u64,

    #[arg(long, env = "TAZER_BOUNDED_FILELOCK_CACHE_BLOCK_SIZE", default_value_t = 1024 * 1024)]
    pub bounded_filelock_cache_block_size: u64,

    #[arg(long, env = "TAZER_BOUNDED_FILELOCK_CACHE_ASSOCIATIVITY", default_value_t = 8)]
    pub bounded_filelock_cache_associativity: usize,

    #[arg(long, env = "TAZER_FILELOCK_CACHE_PATH", default_value = "/var/tmp/tazer-filelock.cache")]
    pub filelock_cache_path: PathBuf,

    #[arg(long, env = "TAZER_NUM_SERVER_COMP_THREADS", default_value_t = 4)]
    pub num_server_comp_threads: usize,

    #[arg(long, env = "TAZER_LOG_FORMAT", default_value = "plain")]
    pub log_format: String,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "tazer-client", about = "TAZeR client-side cache hierarchy configuration")]
pub struct ClientConfig {
    /// JSON document shaped `{"servers": ["host:port", ...]}`.
    #[arg(long, env = "TAZER_SERVER_CONNECTIONS_PATH", default_value = "/etc/tazer/connections")]
    pub server_connections_path: PathBuf,

    #[arg(long, env = "TAZER_USE_NETWORK_CACHE", default_value_t = true)]
    pub use_server_network_cache: bool,

    #[arg(long, env = "TAZER_CLIENT_CACHE_SIZE", default_value_t = 64 * 1024 * 1024)]
    pub client_cache_size: u64,

    #[arg(long, env = "TAZER_CLIENT_BLOCK_SIZE", default_value_t = 1024 * 1024)]
    pub client_block_size: u64,

    #[arg(long, env = "TAZER_CLIENT_ASSOCIATIVITY", default_value_t = 8)]
    pub client_associativity: usize,

    #[arg(long, env = "TAZER_NUM_CLIENT_TRANS_THREADS", default_value_t = 4)]
    pub num_client_trans_threads: usize,

    #[arg(long, env = "TAZER_NUM_CLIENT_DECOMP_THREADS", default_value_t = 4)]
    pub num_client_decomp_threads: usize,

    #[arg(long, env = "TAZER_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "TAZER_INITIAL_PREFETCH_BLOCKS", default_value_t = 4)]
    pub initial_prefetch_blocks: u32,

    #[arg(long, env = "TAZER_LOG_FORMAT", default_value = "plain")]
    pub log_format: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults() {
        let cfg = ServerConfig::parse_from(["tazer-server"]);
        assert_eq!(cfg.listen_addr, "0.0.0.0:4242");
        assert_eq!(cfg.server_associativity, 8);
        assert!(!cfg.enable_shm_cache);
    }

    #[test]
    fn test_client_config_overrides() {
        let cfg = ClientConfig::parse_from(["tazer-client", "--max-retries", "5"]);
        assert_eq!(cfg.max_retries, 5);
        assert!(cfg.use_server_network_cache);
    }
}
