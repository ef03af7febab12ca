use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variable consulted when `engine.executable` is `auto`.
pub const ENGINE_PATH_ENV: &str = "LIBREOFFICE_PATH";

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub engine: Engine,
    #[serde(default)]
    pub batch: Batch,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.timeout_seconds == 0 {
            bail!("engine.timeout_seconds must be positive");
        }
        if self.engine.doctor_timeout_seconds == 0 {
            bail!("engine.doctor_timeout_seconds must be positive");
        }
        if self.batch.extensions.is_empty() {
            bail!("batch.extensions must list at least one extension");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub input_dir: String,
    pub output_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            input_dir: "input".into(),
            output_dir: "output".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Engine {
    /// Path to the soffice binary, or `auto` to read `LIBREOFFICE_PATH`.
    pub executable: String,
    pub timeout_seconds: u64,
    pub doctor_timeout_seconds: u64,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
impl Default for Engine {
    fn default() -> Self {
        Self {
            executable: "auto".into(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            doctor_timeout_seconds: 30,
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Batch {
    pub extensions: Vec<String>,
    pub fail_on_error: bool,
    pub report_path: String,
}
impl Default for Batch {
    fn default() -> Self {
        Self {
            extensions: crate::batch::DEFAULT_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fail_on_error: false,
            report_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}
