use clap::Parser;

use crate::config::defs::ReadType;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "cycler-pipeline",
    version,
    about = "Resumable long-read consensus assembly pipeline: filter, subsample, assemble, cluster, resolve, polish and assess every read file in a directory"
)]
pub struct Arguments {

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'c', long = "config", help = "Optional TOML file with the same keys as the long flags; flags take precedence")]
    pub config: Option<String>,

    #[arg(short = 'i', long = "in-dir", help = "Directory scanned for read files (.fastq, .fq, .fastq.gz, .fq.gz, .bam)")]
    pub in_dir: Option<String>,

    #[arg(short = 'o', long = "out-dir", help = "Root of the stage directories. Defaults to the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    #[arg(short = 'r', long = "read-type", value_enum, help = "Read technology [default: ont_r10]")]
    pub read_type: Option<ReadType>,

    #[arg(long = "fallback-genome-size", help = "Genome size used when estimation yields nothing [default: 5000000]")]
    pub fallback_genome_size: Option<u64>,

    #[arg(short = 'd', long = "quality-db", help = "Database for the final quality assessment; assessment is skipped without it")]
    pub quality_db: Option<String>,

    #[arg(long = "subsample-count", help = "Number of read subsets per sample [default: 4]")]
    pub subsample_count: Option<usize>,

    #[arg(long, value_delimiter = ',', help = "Comma-separated assemblers [default: flye,metamdbg,miniasm,necat,nextdenovo,plassembler,raven]")]
    pub assemblers: Option<Vec<String>>,

    #[arg(long = "min-read-length", help = "Read filter minimum length [default: 1000]")]
    pub min_read_length: Option<u64>,

    #[arg(long = "keep-percent", help = "Read filter percentage of bases kept [default: 95]")]
    pub keep_percent: Option<f64>,

    #[arg(short = 'j', long, help = "Concurrent samples, assemblies and clusters [default: 1]")]
    pub jobs: Option<usize>,

    #[arg(long, help = "Extra attempts for a failing tool invocation [default: 0]")]
    pub retries: Option<u32>,

    #[arg(long = "skip-tool-check", default_value_t = false)]
    pub skip_tool_check: bool,
}
