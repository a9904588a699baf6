// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<NovaRocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = NovaRocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    CONFIG.get().ok_or_else(|| anyhow!("config not initialized"))
}

pub fn init_from_env_or_default() -> Result<&'static NovaRocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    init_from_path(path)
}

pub fn config() -> Result<&'static NovaRocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("NOVAROCKS_CONFIG")
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    let candidates = [PathBuf::from("novarocks.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $NOVAROCKS_CONFIG or create ./novarocks.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct NovaRocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "novarocks_join=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub join: JoinConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

impl NovaRocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: NovaRocksConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Tracing filter expression derived from `log_filter` or `log_level`.
    pub fn log_filter_expr(&self) -> &str {
        match self.log_filter.as_deref() {
            Some(filter) if !filter.trim().is_empty() => filter,
            _ => &self.log_level,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.chunk_size == 0 {
            return Err(anyhow!("runtime.chunk_size must be positive"));
        }
        if self.join.partition_count == 0 {
            return Err(anyhow!("join.partition_count must be positive"));
        }
        Ok(())
    }
}

impl Default for NovaRocksConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
            join: JoinConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    /// Upper bound on rows per chunk produced by join probes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Driver worker threads; 0 means one per available core.
    #[serde(default)]
    pub exec_threads: usize,
    #[serde(default = "default_driver_time_slice_ms")]
    pub driver_time_slice_ms: u64,
}

fn default_chunk_size() -> usize {
    4096
}

fn default_driver_time_slice_ms() -> u64 {
    100
}

impl RuntimeConfig {
    /// Get the actual number of driver threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            self.exec_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            exec_threads: 0,
            driver_time_slice_ms: default_driver_time_slice_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct JoinConfig {
    /// Build partitions used when a join node does not set its own.
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
    /// Sizing hint for build-side hash tables.
    #[serde(default = "default_expected_build_positions")]
    pub expected_build_positions: usize,
}

fn default_partition_count() -> usize {
    4
}

fn default_expected_build_positions() -> usize {
    1024
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            expected_build_positions: default_expected_build_positions(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemoryConfig {
    /// Hard limit for one task; negative means unlimited.
    #[serde(default = "default_task_mem_limit_bytes")]
    pub task_mem_limit_bytes: i64,
}

fn default_task_mem_limit_bytes() -> i64 {
    -1
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            task_mem_limit_bytes: default_task_mem_limit_bytes(),
        }
    }
}
