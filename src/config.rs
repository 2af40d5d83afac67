//! Environment/config constants (spec §6) promoted to a small runtime config
//! struct, in the same spirit as the teacher's named constants
//! (`MAX_PARENTS`, `GENE_COLORS`) but overridable via environment variables
//! where the spec calls for tunability (root directory, concurrency).

pub const SHARD_SIZE: u64 = 67_108_864;
pub const ALIGNMENT: u64 = 4096;
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const HEADER_READ: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Override for the per-origin persistent root. `None` resolves via
    /// `directories::ProjectDirs` at `init_root` time.
    pub root_override: Option<std::path::PathBuf>,
    pub concurrency: usize,
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let root_override = std::env::var_os("DOPPLER_MODELS_ROOT").map(std::path::PathBuf::from);
        let concurrency = std::env::var("DOPPLER_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CONCURRENCY);

        Self {
            root_override,
            concurrency,
            hash_algorithm: HashAlgorithm::Blake3,
        }
    }
}
