// src/config/settings.rs: resolved run configuration

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cli::Arguments;
use crate::config::defs::{
    assembler_requirements, PipelineError, ReadType, DEFAULT_ASSEMBLERS, DEFAULT_FALLBACK_GENOME_SIZE,
    DEFAULT_KEEP_PERCENT, DEFAULT_MIN_READ_LENGTH, DEFAULT_SUBSAMPLE_COUNT,
};
use crate::utils::system::default_threads;

/// Keys accepted in a `--config` TOML file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub in_dir: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub threads: Option<usize>,
    pub read_type: Option<ReadType>,
    pub fallback_genome_size: Option<u64>,
    pub quality_db: Option<PathBuf>,
    pub subsample_count: Option<usize>,
    pub assemblers: Option<Vec<String>>,
    pub min_read_length: Option<u64>,
    pub keep_percent: Option<f64>,
    pub jobs: Option<usize>,
    pub retries: Option<u32>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        toml::from_str(text).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }
}

/// Immutable settings shared by every stage executor.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
    pub threads: usize,
    pub read_type: ReadType,
    pub fallback_genome_size: u64,
    pub quality_db: Option<PathBuf>,
    pub subsample_count: usize,
    pub assemblers: Vec<String>,
    pub min_read_length: u64,
    pub keep_percent: f64,
    pub jobs: usize,
    pub retries: u32,
    pub check_tools: bool,
}

impl RunConfig {
    /// Built-in defaults for the given directories.
    pub fn new(in_dir: PathBuf, out_dir: PathBuf) -> Self {
        RunConfig {
            in_dir,
            out_dir,
            threads: default_threads(),
            read_type: ReadType::default(),
            fallback_genome_size: DEFAULT_FALLBACK_GENOME_SIZE,
            quality_db: None,
            subsample_count: DEFAULT_SUBSAMPLE_COUNT,
            assemblers: DEFAULT_ASSEMBLERS.iter().map(|a| a.to_string()).collect(),
            min_read_length: DEFAULT_MIN_READ_LENGTH,
            keep_percent: DEFAULT_KEEP_PERCENT,
            jobs: 1,
            retries: 0,
            check_tools: true,
        }
    }

    /// Layers CLI flags over the optional config file over built-in defaults.
    pub fn resolve(args: &Arguments, cwd: &Path) -> Result<Self, PipelineError> {
        let file = match &args.config {
            Some(path) => ConfigFile::load(&absolutize(Path::new(path), cwd))?,
            None => ConfigFile::default(),
        };
        Self::merge(args, file, cwd)
    }

    pub fn merge(args: &Arguments, file: ConfigFile, cwd: &Path) -> Result<Self, PipelineError> {
        let in_dir = args
            .in_dir
            .as_ref()
            .map(PathBuf::from)
            .or(file.in_dir)
            .ok_or_else(|| PipelineError::InvalidConfig("an input directory (--in-dir) is required".to_string()))?;
        let out_dir = args
            .out_dir
            .as_ref()
            .map(PathBuf::from)
            .or(file.out_dir)
            .unwrap_or_else(|| cwd.to_path_buf());

        let mut config = RunConfig::new(absolutize(&in_dir, cwd), absolutize(&out_dir, cwd));

        if let Some(threads) = args.threads.or(file.threads) {
            config.threads = threads;
        }
        if let Some(read_type) = args.read_type.or(file.read_type) {
            config.read_type = read_type;
        }
        if let Some(size) = args.fallback_genome_size.or(file.fallback_genome_size) {
            config.fallback_genome_size = size;
        }
        config.quality_db = args
            .quality_db
            .as_ref()
            .map(PathBuf::from)
            .or(file.quality_db)
            .map(|db| absolutize(&db, cwd));
        if let Some(count) = args.subsample_count.or(file.subsample_count) {
            config.subsample_count = count;
        }
        if let Some(assemblers) = args.assemblers.clone().or(file.assemblers) {
            config.assemblers = assemblers
                .into_iter()
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
        }
        if let Some(len) = args.min_read_length.or(file.min_read_length) {
            config.min_read_length = len;
        }
        if let Some(pct) = args.keep_percent.or(file.keep_percent) {
            config.keep_percent = pct;
        }
        if let Some(jobs) = args.jobs.or(file.jobs) {
            config.jobs = jobs;
        }
        if let Some(retries) = args.retries.or(file.retries) {
            config.retries = retries;
        }
        config.check_tools = !args.skip_tool_check;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.threads == 0 {
            return Err(PipelineError::InvalidConfig("threads must be positive".to_string()));
        }
        if self.jobs == 0 {
            return Err(PipelineError::InvalidConfig("jobs must be positive".to_string()));
        }
        if self.subsample_count == 0 {
            return Err(PipelineError::InvalidConfig("subsample count must be positive".to_string()));
        }
        if self.fallback_genome_size == 0 {
            return Err(PipelineError::InvalidConfig("fallback genome size must be positive".to_string()));
        }
        if self.assemblers.is_empty() {
            return Err(PipelineError::InvalidConfig("at least one assembler is required".to_string()));
        }
        if let Some(unknown) = self.assemblers.iter().find(|a| assembler_requirements(a).is_none()) {
            return Err(PipelineError::InvalidConfig(format!("unsupported assembler '{}'", unknown)));
        }
        if !(self.keep_percent > 0.0 && self.keep_percent <= 100.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "keep percent must be in (0, 100], got {}",
                self.keep_percent
            )));
        }
        Ok(())
    }
}

fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
