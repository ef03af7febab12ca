use crate::{
    engine::{ConversionRequest, Engine},
    util::{ensure_dir, now_rfc3339},
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_EXTENSIONS: [&str; 6] = ["doc", "docx", "ppt", "pptx", "xls", "xlsx"];

/// Case-insensitive set of file extensions the batch will hand to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedExtensions {
    exts: BTreeSet<String>,
}

impl SupportedExtensions {
    pub fn new<I, S>(exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let exts = exts
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { exts }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .is_some_and(|ext| self.exts.contains(&ext.to_ascii_lowercase()))
    }
}

impl Default for SupportedExtensions {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS)
    }
}

#[derive(Debug, Clone)]
pub struct Discovery {
    /// The input directory did not exist and was created empty.
    pub created: bool,
    pub files: Vec<PathBuf>,
}

/// Lists convertible files directly inside `input_dir`, creating it if absent.
pub fn discover(input_dir: &Path, exts: &SupportedExtensions) -> Result<Discovery> {
    if !input_dir.exists() {
        info!("input directory does not exist, creating {}", input_dir.display());
        ensure_dir(input_dir)?;
        return Ok(Discovery {
            created: true,
            files: Vec::new(),
        });
    }

    let mut files = Vec::new();
    let entries = std::fs::read_dir(input_dir)
        .with_context(|| format!("read_dir {}", input_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read_dir entry in {}", input_dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if exts.matches(&path) {
            files.push(path);
        }
    }

    Ok(Discovery {
        created: false,
        files,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub ok: bool,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn line(&self) -> String {
        match &self.error {
            None => format!("{}: succeeded", self.input.display()),
            Some(msg) => format!("{}: failed - {}", self.input.display(), msg),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub created_input_dir: bool,
    pub found: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started: String,
    pub finished: String,
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

pub struct Batch<'a, E: Engine> {
    engine: &'a E,
    exts: SupportedExtensions,
    timeout: Duration,
}

impl<'a, E: Engine> Batch<'a, E> {
    pub fn new(engine: &'a E, exts: SupportedExtensions, timeout: Duration) -> Self {
        Self {
            engine,
            exts,
            timeout,
        }
    }

    pub fn discover(&self, input_dir: &Path) -> Result<Discovery> {
        discover(input_dir, &self.exts)
    }

    /// Discovers and converts every supported file in `input_dir`.
    pub fn run(
        &self,
        input_dir: &Path,
        output_dir: &Path,
        on_outcome: impl FnMut(&FileOutcome),
    ) -> Result<BatchReport> {
        let discovery = self.discover(input_dir)?;
        Ok(self.convert_all(input_dir, discovery, output_dir, on_outcome))
    }

    /// Converts the discovered files one at a time.
    ///
    /// A failed file is recorded and the batch moves on. `on_outcome` sees each
    /// result as soon as it is known.
    pub fn convert_all(
        &self,
        input_dir: &Path,
        discovery: Discovery,
        output_dir: &Path,
        mut on_outcome: impl FnMut(&FileOutcome),
    ) -> BatchReport {
        let started = now_rfc3339();
        info!("found {} file(s) in {}", discovery.files.len(), input_dir.display());

        let mut outcomes = Vec::with_capacity(discovery.files.len());
        for input in discovery.files {
            let req = ConversionRequest::new(&input, output_dir).with_timeout(self.timeout);
            let outcome = match self.engine.convert(&req) {
                Ok(pdf) => FileOutcome {
                    input,
                    ok: true,
                    output: Some(pdf),
                    error: None,
                },
                Err(err) => {
                    // The engine already logged the diagnostic.
                    warn!("{}: conversion failed", input.display());
                    FileOutcome {
                        input,
                        ok: false,
                        output: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            on_outcome(&outcome);
            outcomes.push(outcome);
        }

        let succeeded = outcomes.iter().filter(|o| o.ok).count();
        BatchReport {
            input_dir: input_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            created_input_dir: discovery.created,
            found: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
            started,
            finished: now_rfc3339(),
            outcomes,
        }
    }
}
