use serde::{Deserialize, Serialize};

use crate::{cache::Geometry, error::ConfigError};

/// Cache shape as given on the command line or in a JSON config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Total data capacity in kilobytes.
    pub size_kb: usize,
    pub ways: usize,
    pub block_size: usize,
}

impl CacheConfig {
    pub fn geometry(&self) -> Result<Geometry, ConfigError> {
        let total = self
            .size_kb
            .checked_mul(1024)
            .ok_or(ConfigError::TooLarge(self.size_kb))?;
        Geometry::new(total, self.ways, self.block_size)
    }
}
