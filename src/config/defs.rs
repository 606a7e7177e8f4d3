use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipelines::stage::StageId;

// External software
pub const SAMTOOLS_TAG: &str = "samtools";
pub const FILTLONG_TAG: &str = "filtlong";
pub const AUTOCYCLER_TAG: &str = "autocycler";
pub const MINIMAP2_TAG: &str = "minimap2";
pub const RACON_TAG: &str = "racon";
pub const CHECKM2_TAG: &str = "checkm2";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutocyclerSubcommand {
    Helper,
    Subsample,
    Compress,
    Cluster,
    Trim,
    Resolve,
    Combine,
}

impl AutocyclerSubcommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutocyclerSubcommand::Helper => "helper",
            AutocyclerSubcommand::Subsample => "subsample",
            AutocyclerSubcommand::Compress => "compress",
            AutocyclerSubcommand::Cluster => "cluster",
            AutocyclerSubcommand::Trim => "trim",
            AutocyclerSubcommand::Resolve => "resolve",
            AutocyclerSubcommand::Combine => "combine",
        }
    }
}

// Stage directories, in layout order
pub const FILTERED_READS_DIR: &str = "00_filtered_reads";
pub const SUBSAMPLED_READS_DIR: &str = "01_subsampled_reads";
pub const ASSEMBLIES_DIR: &str = "02_assemblies";
pub const CONSENSUS_DIR: &str = "03_consensus";
pub const POLISHED_DIR: &str = "04_polished";
pub const FINAL_ASSEMBLIES_DIR: &str = "05_final_assemblies";
pub const STAGE_DIRS: &[&str] = &[
    FILTERED_READS_DIR,
    SUBSAMPLED_READS_DIR,
    ASSEMBLIES_DIR,
    CONSENSUS_DIR,
    POLISHED_DIR,
    FINAL_ASSEMBLIES_DIR,
];

// Static Filenames
pub const CLUSTERING_DIR: &str = "clustering";
pub const QC_PASS_DIR: &str = "qc_pass";
pub const QUALITY_DIR: &str = "quality";
pub const QUALITY_REPORT: &str = "quality_report.tsv";
pub const CONSENSUS_FASTA: &str = "consensus_assembly.fasta";
pub const RESOLVED_GFA: &str = "5_final.gfa";
pub const TRIMMED_GFA_PATTERN: &str = "*_trimmed.gfa";
pub const SUBSAMPLE_PATTERN: &str = "sample_*.fastq";
pub const POLISHED_FASTA: &str = "polished.fasta";
pub const RUN_REPORT: &str = "pipeline_report.json";
pub const FINAL_EXT: &str = "fasta";

// Input extensions
pub const RAW_READ_EXTS: &[&'static str] = &["fastq.gz", "fq.gz", "fastq", "fq"];
pub const CONVERTED_READ_EXTS: &[&'static str] = &["bam"];

lazy_static! {
    /// Every recognized extension, longest first so that `fastq.gz` wins over `gz`-less forms.
    pub static ref RECOGNIZED_EXTS: Vec<&'static str> = {
        let mut exts: Vec<&'static str> = RAW_READ_EXTS
            .iter()
            .chain(CONVERTED_READ_EXTS.iter())
            .copied()
            .collect();
        exts.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        exts
    };
}

// Static Parameters
pub const DEFAULT_FALLBACK_GENOME_SIZE: u64 = 5_000_000;
pub const DEFAULT_SUBSAMPLE_COUNT: usize = 4;
pub const DEFAULT_MIN_READ_LENGTH: u64 = 1_000;
pub const DEFAULT_KEEP_PERCENT: f64 = 95.0;
pub const DEFAULT_ASSEMBLERS: &[&'static str] = &[
    "flye",
    "metamdbg",
    "miniasm",
    "necat",
    "nextdenovo",
    "plassembler",
    "raven",
];
pub const RETRY_BACKOFF_MS: u64 = 2_000;

/// Programs `autocycler helper <assembler>` shells out to. `a|b` accepts either.
pub fn assembler_requirements(assembler: &str) -> Option<&'static [&'static str]> {
    let programs: &'static [&'static str] = match assembler {
        "canu" => &["canu"],
        "flye" => &["flye"],
        "lja" => &["lja"],
        "metamdbg" => &["metaMDBG"],
        "miniasm" => &["miniasm", "minipolish", "minimap2", "racon", "any2fasta"],
        "myloasm" => &["myloasm"],
        "necat" => &["necat|necat.pl"],
        "nextdenovo" => &["nextDenovo", "nextPolish"],
        "plassembler" => &["plassembler"],
        "raven" => &["raven"],
        "redbean" => &["wtdbg2", "wtpoa-cns"],
        _ => return None,
    };
    Some(programs)
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq, Serialize, Deserialize)]
#[value(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReadType {
    OntR9,
    #[default]
    OntR10,
    PacbioClr,
    PacbioHifi,
}

impl ReadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadType::OntR9 => "ont_r9",
            ReadType::OntR10 => "ont_r10",
            ReadType::PacbioClr => "pacbio_clr",
            ReadType::PacbioHifi => "pacbio_hifi",
        }
    }

    /// minimap2 preset used when mapping reads back to a consensus.
    pub fn minimap2_preset(&self) -> &'static str {
        match self {
            ReadType::OntR9 | ReadType::OntR10 => "map-ont",
            ReadType::PacbioClr => "map-pb",
            ReadType::PacbioHifi => "map-hifi",
        }
    }
}

impl fmt::Display for ReadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no read files with a recognized extension found in {}", .0.display())]
    NoInputFound(PathBuf),

    #[error("input directory {} does not exist", .0.display())]
    InputDirMissing(PathBuf),

    #[error("genome size estimation failed for {item}: {reason}")]
    EstimationFailed { item: String, reason: String },

    #[error("{stage} skipped for {item}: upstream artifact {} is missing", .path.display())]
    UpstreamArtifactMissing {
        stage: StageId,
        item: String,
        path: PathBuf,
    },

    #[error("{stage} failed for {item}: {error}")]
    StageFailed {
        stage: StageId,
        item: String,
        error: String,
    },

    #[error("{stage} for {item} requires {requires} to be complete, but its artifact is absent")]
    DependencyUnsatisfied {
        stage: StageId,
        requires: StageId,
        item: String,
    },

    #[error("required tool '{0}' was not found on PATH")]
    ToolUnavailable(String),

    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

impl PipelineError {
    /// Soft errors stop an item's remaining stages with a warning instead of failing it.
    pub fn is_soft(&self) -> bool {
        matches!(self, PipelineError::UpstreamArtifactMissing { .. })
    }
}
