//! Refiner configuration stored as TOML (default `refiner.toml`).

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::analysis::AnalysisConfig;
use crate::core::reward::RewardWeights;
use crate::io::generator::GeneratorConfig;
use crate::io::sandbox::SandboxConfig;
use crate::refine::RefineConfig;

pub const DEFAULT_CONFIG_FILE: &str = "refiner.toml";

/// Refiner configuration (TOML).
///
/// Intended to be edited by humans. Every section and field is optional and
/// falls back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefinerConfig {
    pub sandbox: SandboxConfig,
    pub refine: RefineConfig,
    pub reward: RewardWeights,
    pub generator: GeneratorConfig,
    pub analysis: AnalysisConfig,
}

impl RefinerConfig {
    pub fn validate(&self) -> Result<()> {
        self.sandbox.validate().map_err(|e| anyhow!(e))?;
        self.refine.validate().map_err(|e| anyhow!(e))?;
        self.reward.validate().map_err(|e| anyhow!(e))?;
        self.generator.validate().map_err(|e| anyhow!(e))?;
        self.analysis.validate().map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

/// Read and validate the config at `path`; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<RefinerConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<RefinerConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => RefinerConfig::default(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Validate and write `cfg` as TOML, replacing `path` atomically.
pub fn write_config(path: &Path, cfg: &RefinerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config")?;
    buf.push('\n');

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(buf.as_bytes()).context("write temp config")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(cfg, RefinerConfig::default());
        assert_eq!(cfg.refine.max_iterations, 5);
        assert_eq!(cfg.sandbox.memory, "50m");
    }

    #[test]
    fn written_config_loads_back_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("refiner.toml");
        let mut cfg = RefinerConfig::default();
        cfg.refine.run_timeout_secs = Some(600);
        cfg.generator.command = vec!["llm".to_string(), "-m".to_string(), "local".to_string()];
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        fs::write(
            &path,
            "[refine]\nmax_iterations = 3\n\n[sandbox]\nimage = \"python-pytest:3.12\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.refine.max_iterations, 3);
        assert_eq!(cfg.refine.patience, 2);
        assert_eq!(cfg.sandbox.image, "python-pytest:3.12");
        assert_eq!(cfg.sandbox.timeout_secs, 30);
        assert_eq!(cfg.reward, RewardWeights::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("refiner.toml");
        fs::write(&path, "[refine]\nmax_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations"));
    }
}
