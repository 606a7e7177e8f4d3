/// Functions and structs for building and running external tool command lines

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use tokio::process::Command;
use tokio::time::sleep;

use crate::config::defs::{PipelineError, RETRY_BACKOFF_MS};
use crate::utils::file::ensure_parent;

const STDERR_TAIL_LINES: usize = 20;


/// One external program call. `stdout_to` captures standard output into a file.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdout_to: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: &str, args: Vec<String>) -> Self {
        ToolInvocation {
            program: program.to_string(),
            args,
            stdout_to: None,
        }
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout_to = Some(path);
        self
    }

    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        if let Some(path) = &self.stdout_to {
            line.push_str(" > ");
            line.push_str(&path.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
}


/// Runs tool invocations. Stage executors only talk to tools through this seam.
pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, invocation: &'a ToolInvocation) -> BoxFuture<'a, Result<ToolOutput, PipelineError>>;

    /// Resolves a program on PATH, failing with `ToolUnavailable`.
    fn locate(&self, program: &str) -> Result<PathBuf, PipelineError>;
}


/// Checks every tool up front so a missing binary fails the run before any stage starts.
/// An entry of the form `a|b` accepts either program.
pub fn check_tools(runner: &dyn ToolRunner, tools: &[&str]) -> Result<(), PipelineError> {
    let mut missing = Vec::new();
    for tool in tools {
        let found = tool.split('|').find_map(|program| runner.locate(program).ok());
        match found {
            Some(path) => debug!("Found {} at {}", tool, path.display()),
            None => missing.push(tool.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ToolUnavailable(missing.join(", ")))
    }
}


/// Spawns real child processes with tokio.
pub struct ProcessRunner {
    retries: u32,
    backoff: Duration,
}

impl ProcessRunner {
    pub fn new(retries: u32) -> Self {
        ProcessRunner {
            retries,
            backoff: Duration::from_millis(RETRY_BACKOFF_MS),
        }
    }

    async fn run_once(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
        let tool = invocation.program.clone();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped());

        // Captured stdout goes to a hidden sibling and is renamed into place only on success.
        let partial = match &invocation.stdout_to {
            Some(path) => {
                ensure_parent(path)?;
                let parent = path.parent().unwrap_or_else(|| Path::new("."));
                let tmp = tempfile::Builder::new()
                    .prefix(".")
                    .suffix(".partial")
                    .tempfile_in(parent)?;
                cmd.stdout(Stdio::from(tmp.reopen()?));
                Some(tmp)
            }
            None => {
                cmd.stdout(Stdio::piped());
                None
            }
        };

        // output() would re-pipe stdout, so spawn and wait to keep the file handle set above.
        let child = cmd.spawn().map_err(|e| PipelineError::ToolExecution {
            tool: tool.clone(),
            error: format!("failed to spawn: {}. Is {} installed?", e, tool),
        })?;
        let output = child.wait_with_output().await.map_err(|e| PipelineError::ToolExecution {
            tool: tool.clone(),
            error: format!("failed waiting for exit: {}", e),
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(PipelineError::ToolExecution {
                tool,
                error: format!("{}; stderr: {}", output.status, stderr_tail(&stderr)),
            });
        }

        if let (Some(tmp), Some(path)) = (partial, &invocation.stdout_to) {
            tmp.persist(path)
                .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e.error)))?;
        }

        let tail = stderr_tail(&stderr);
        if !tail.is_empty() {
            debug!("{} stderr: {}", tool, tail);
        }
        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

impl ToolRunner for ProcessRunner {
    fn run<'a>(&'a self, invocation: &'a ToolInvocation) -> BoxFuture<'a, Result<ToolOutput, PipelineError>> {
        async move {
            let mut attempt = 0;
            loop {
                debug!("Running: {}", invocation.command_line());
                match self.run_once(invocation).await {
                    Ok(output) => return Ok(output),
                    Err(e) if attempt < self.retries => {
                        attempt += 1;
                        warn!(
                            "{} (attempt {} of {}), retrying in {} ms",
                            e,
                            attempt,
                            self.retries + 1,
                            self.backoff.as_millis()
                        );
                        sleep(self.backoff).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        .boxed()
    }

    fn locate(&self, program: &str) -> Result<PathBuf, PipelineError> {
        which::which(program).map_err(|_| PipelineError::ToolUnavailable(program.to_string()))
    }
}


fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}


pub mod samtools {
    use std::path::Path;
    use crate::config::RunConfig;

    /// `samtools fastq` converting an unaligned BAM to FASTQ on stdout.
    pub fn fastq_args(config: &RunConfig, bam: &Path) -> Vec<String> {
        vec![
            "fastq".to_string(),
            "-@".to_string(),
            config.threads.to_string(),
            bam.to_string_lossy().to_string(),
        ]
    }
}

pub mod filtlong {
    use std::path::Path;
    use crate::config::RunConfig;

    pub fn arg_generator(config: &RunConfig, reads: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--min_length".to_string());
        args_vec.push(config.min_read_length.to_string());
        args_vec.push("--keep_percent".to_string());
        args_vec.push(config.keep_percent.to_string());
        args_vec.push(reads.to_string_lossy().to_string());
        args_vec
    }
}

pub mod autocycler {
    use std::path::{Path, PathBuf};
    use crate::config::RunConfig;
    use crate::config::defs::AutocyclerSubcommand;

    fn path_arg(path: &Path) -> String {
        path.to_string_lossy().to_string()
    }

    pub fn genome_size_args(config: &RunConfig, reads: &Path) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Helper.as_str().to_string(),
            "genome_size".to_string(),
            "--reads".to_string(),
            path_arg(reads),
            "--threads".to_string(),
            config.threads.to_string(),
        ]
    }

    pub fn subsample_args(config: &RunConfig, reads: &Path, out_dir: &Path, genome_size: u64) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Subsample.as_str().to_string(),
            "--reads".to_string(),
            path_arg(reads),
            "--out_dir".to_string(),
            path_arg(out_dir),
            "--genome_size".to_string(),
            genome_size.to_string(),
            "--count".to_string(),
            config.subsample_count.to_string(),
        ]
    }

    pub fn assembler_args(
        config: &RunConfig,
        assembler: &str,
        reads: &Path,
        out_prefix: &Path,
        genome_size: u64,
    ) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Helper.as_str().to_string(),
            assembler.to_string(),
            "--reads".to_string(),
            path_arg(reads),
            "--out_prefix".to_string(),
            path_arg(out_prefix),
            "--threads".to_string(),
            config.threads.to_string(),
            "--genome_size".to_string(),
            genome_size.to_string(),
            "--read_type".to_string(),
            config.read_type.as_str().to_string(),
        ]
    }

    pub fn compress_args(config: &RunConfig, assemblies_dir: &Path, autocycler_dir: &Path) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Compress.as_str().to_string(),
            "-i".to_string(),
            path_arg(assemblies_dir),
            "-a".to_string(),
            path_arg(autocycler_dir),
            "--threads".to_string(),
            config.threads.to_string(),
        ]
    }

    pub fn cluster_args(autocycler_dir: &Path) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Cluster.as_str().to_string(),
            "-a".to_string(),
            path_arg(autocycler_dir),
        ]
    }

    pub fn trim_args(config: &RunConfig, cluster_dir: &Path) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Trim.as_str().to_string(),
            "-c".to_string(),
            path_arg(cluster_dir),
            "--threads".to_string(),
            config.threads.to_string(),
        ]
    }

    pub fn resolve_args(cluster_dir: &Path) -> Vec<String> {
        vec![
            AutocyclerSubcommand::Resolve.as_str().to_string(),
            "-c".to_string(),
            path_arg(cluster_dir),
        ]
    }

    pub fn combine_args(autocycler_dir: &Path, cluster_gfas: &[PathBuf]) -> Vec<String> {
        let mut args_vec = vec![
            AutocyclerSubcommand::Combine.as_str().to_string(),
            "-a".to_string(),
            path_arg(autocycler_dir),
            "-i".to_string(),
        ];
        args_vec.extend(cluster_gfas.iter().map(|p| path_arg(p)));
        args_vec
    }
}

pub mod minimap2 {
    use std::path::Path;
    use crate::config::RunConfig;

    /// SAM output of `reads` mapped onto `target` with the read-type preset.
    pub fn arg_generator(config: &RunConfig, target: &Path, reads: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-t".to_string());
        args_vec.push(config.threads.to_string());
        args_vec.push("-ax".to_string());
        args_vec.push(config.read_type.minimap2_preset().to_string());
        args_vec.push(target.to_string_lossy().to_string());
        args_vec.push(reads.to_string_lossy().to_string());
        args_vec
    }
}

pub mod racon {
    use std::path::Path;
    use crate::config::RunConfig;

    pub fn arg_generator(config: &RunConfig, reads: &Path, overlaps: &Path, target: &Path) -> Vec<String> {
        vec![
            "-t".to_string(),
            config.threads.to_string(),
            reads.to_string_lossy().to_string(),
            overlaps.to_string_lossy().to_string(),
            target.to_string_lossy().to_string(),
        ]
    }
}

pub mod checkm2 {
    use std::path::Path;
    use crate::config::RunConfig;
    use crate::config::defs::FINAL_EXT;

    pub fn predict_args(config: &RunConfig, input_dir: &Path, out_dir: &Path, database: &Path) -> Vec<String> {
        vec![
            "predict".to_string(),
            "-i".to_string(),
            input_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            out_dir.to_string_lossy().to_string(),
            "-x".to_string(),
            FINAL_EXT.to_string(),
            "--database_path".to_string(),
            database.to_string_lossy().to_string(),
            "--threads".to_string(),
            config.threads.to_string(),
            "--force".to_string(),
        ]
    }
}
