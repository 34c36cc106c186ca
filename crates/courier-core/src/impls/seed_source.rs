//! WorkSource 実装
//!
//! - SeedFileSource: JSON 配列のファイル（毎回読み直す）
//! - VecSource: 固定のリスト（テスト・デモ用）

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::{SourceError, WorkSeed};
use crate::ports::WorkSource;

/// Seeds from a JSON file: `[{"target_identifier": .., "target_endpoint": .., "processed_subunits": [..]}]`.
#[derive(Debug, Clone)]
pub struct SeedFileSource {
    path: PathBuf,
}

impl SeedFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl WorkSource for SeedFileSource {
    async fn fetch_seeds(&self) -> Result<Vec<WorkSeed>, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Read {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct VecSource {
    seeds: Vec<WorkSeed>,
}

impl VecSource {
    pub fn new(seeds: Vec<WorkSeed>) -> Self {
        Self { seeds }
    }
}

#[async_trait]
impl WorkSource for VecSource {
    async fn fetch_seeds(&self) -> Result<Vec<WorkSeed>, SourceError> {
        Ok(self.seeds.clone())
    }
}
