use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::decoder::DecoderCommand;

pub const DEFAULT_CONFIG_FILE: &str = "mtcore.toml";
pub const CONFIG_ENV: &str = "MTCORE_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub decoder: DecoderSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub cluster: ClusterSection,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_source_lang")]
    pub source_lang: String,
    #[serde(default = "default_target_lang")]
    pub target_lang: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            source_lang: default_source_lang(),
            target_lang: default_target_lang(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DecoderSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    /// Working directory of the decoder processes.
    #[serde(default)]
    pub home: Option<PathBuf>,
    /// Relative paths are resolved against the config file directory.
    #[serde(default)]
    pub model: Option<PathBuf>,
    /// Zero-based GPU indices, one process each. Empty runs a single CPU process.
    #[serde(default)]
    pub gpus: Vec<usize>,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for DecoderSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            home: None,
            model: None,
            gpus: Vec::new(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContextSection {
    /// Directory of `<domain_id>.txt` corpora indexed at startup.
    #[serde(default)]
    pub corpora_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub boost: bool,
    #[serde(default = "default_context_limit")]
    pub limit: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            corpora_dir: None,
            boost: true,
            limit: default_context_limit(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ClusterSection {
    /// Job executor threads; hardware parallelism when unset.
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_source_lang() -> String {
    "en".to_string()
}

fn default_target_lang() -> String {
    "it".to_string()
}

fn default_program() -> String {
    "python".to_string()
}

fn default_program_args() -> Vec<String> {
    vec!["nmt_decoder.py".to_string()]
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_context_limit() -> usize {
    10
}

impl AppConfig {
    /// Loads `explicit`, else `$MTCORE_CONFIG`, else the first `mtcore.toml`
    /// found upwards. No file at all yields the defaults.
    pub fn discover(explicit: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let cfg_file = explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| {
                let cwd = std::env::current_dir().ok()?;
                find_default_config(&cwd, DEFAULT_CONFIG_FILE)
            });
        match cfg_file {
            Some(p) if p.exists() => {
                let mut cfg = load_config(&p)?;
                cfg.resolve_paths(p.parent().unwrap_or_else(|| Path::new(".")));
                Ok((cfg, Some(p)))
            }
            Some(p) => bail!("config file not found: {}", p.display()),
            None => Ok((AppConfig::default(), None)),
        }
    }

    fn resolve_paths(&mut self, config_dir: &Path) {
        for p in [
            self.decoder.model.as_mut(),
            self.decoder.home.as_mut(),
            self.context.corpora_dir.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        }
    }

    pub fn decoder_command(&self) -> anyhow::Result<DecoderCommand> {
        let d = &self.decoder;
        let model = d
            .model
            .clone()
            .context("no decoder model configured ([decoder] model)")?;
        let home = match d.home.clone() {
            Some(h) => h,
            None => std::env::current_dir().context("resolve decoder home")?,
        };
        Ok(DecoderCommand::new(home, model)
            .program(d.program.clone(), d.args.clone())
            .shutdown_grace(Duration::from_millis(d.shutdown_grace_ms)))
    }

    pub fn workers(&self) -> usize {
        self.cluster.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}
