//! Long-read consensus assembly: the stage table and one executor per stage.
//!
//! Reads are filtered, subsampled, assembled by several assemblers, clustered and
//! resolved into a consensus, polished, and finally scored as a set.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::config::RunConfig;
use crate::config::defs::{
    assembler_requirements, PipelineError, AUTOCYCLER_TAG, ASSEMBLIES_DIR, CHECKM2_TAG, CLUSTERING_DIR, CONSENSUS_DIR,
    CONSENSUS_FASTA, FILTERED_READS_DIR, FILTLONG_TAG, FINAL_ASSEMBLIES_DIR, FINAL_EXT, MINIMAP2_TAG,
    POLISHED_DIR, POLISHED_FASTA, QC_PASS_DIR, QUALITY_DIR, QUALITY_REPORT, RACON_TAG, RESOLVED_GFA,
    SAMTOOLS_TAG, SUBSAMPLED_READS_DIR, SUBSAMPLE_PATTERN, TRIMMED_GFA_PATTERN,
};
use crate::pipelines::driver::Pipeline;
use crate::pipelines::predicate::{CompletionPredicate, PathTemplate};
use crate::pipelines::stage::{
    FailurePolicy, InputFrom, Phase, RunPolicy, Stage, StageContext, StageExecutor, StageId, StageOutcome,
};
use crate::utils::command::{autocycler, checkm2, filtlong, minimap2, racon, samtools, ToolInvocation, ToolRunner};
use crate::utils::discovery::InputKind;
use crate::utils::file::{copy_atomically, matching_entries, subdirectories};

lazy_static! {
    static ref GENOME_SIZE_LINE: Regex = Regex::new(r"^\s*(\d+)\s*$").unwrap();
}

fn converted_reads() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}_converted.fastq", FILTERED_READS_DIR))
}

fn filtered_reads() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}_filtered.fastq", FILTERED_READS_DIR))
}

fn genome_size_cache() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}_genome_size.txt", FILTERED_READS_DIR))
}

fn subsample_dir() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}", SUBSAMPLED_READS_DIR))
}

fn assemblies_dir() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}", ASSEMBLIES_DIR))
}

fn consensus_dir() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}", CONSENSUS_DIR))
}

fn clustering_dir() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}/{}", CONSENSUS_DIR, CLUSTERING_DIR))
}

/// Parent of one directory per QC-passing cluster.
pub fn cluster_root() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}/{}/{}", CONSENSUS_DIR, CLUSTERING_DIR, QC_PASS_DIR))
}

fn cluster_dir() -> PathTemplate {
    PathTemplate::new(format!("{}/{{cluster}}", cluster_root()))
}

fn resolved_gfa() -> PathTemplate {
    PathTemplate::new(format!("{}/{{cluster}}/{}", cluster_root(), RESOLVED_GFA))
}

fn consensus_fasta() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}/{}", CONSENSUS_DIR, CONSENSUS_FASTA))
}

fn polished_fasta() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}/{}", POLISHED_DIR, POLISHED_FASTA))
}

fn final_fasta() -> PathTemplate {
    PathTemplate::new(format!("{}/{{id}}.{}", FINAL_ASSEMBLIES_DIR, FINAL_EXT))
}

fn quality_report() -> PathTemplate {
    PathTemplate::new(format!("{}/{}/{}", FINAL_ASSEMBLIES_DIR, QUALITY_DIR, QUALITY_REPORT))
}


/// The ordered stage table.
pub fn stages(config: &RunConfig) -> Vec<Stage> {
    let mut quality_tools = Vec::new();
    if config.quality_db.is_some() {
        quality_tools.push(CHECKM2_TAG);
    }
    let mut assemble_tools = vec![AUTOCYCLER_TAG];
    for assembler in &config.assemblers {
        for &program in assembler_requirements(assembler).unwrap_or_default() {
            if !assemble_tools.contains(&program) {
                assemble_tools.push(program);
            }
        }
    }

    vec![
        Stage::new(
            StageId::Normalize,
            Phase::Item,
            converted_reads(),
            CompletionPredicate::FileExists(converted_reads()),
            Box::new(NormalizeReads),
        )
        .only_for(InputKind::Converted)
        .tools(&[SAMTOOLS_TAG]),
        Stage::new(
            StageId::Filter,
            Phase::Item,
            filtered_reads(),
            CompletionPredicate::FileExists(filtered_reads()),
            Box::new(FilterReads),
        )
        .input_from(InputFrom::Stage(StageId::Normalize))
        .requires(&[StageId::Normalize])
        .tools(&[FILTLONG_TAG]),
        Stage::new(
            StageId::SizeEstimate,
            Phase::Item,
            genome_size_cache(),
            CompletionPredicate::FileExists(genome_size_cache()),
            Box::new(EstimateGenomeSize),
        )
        .input_from(InputFrom::Stage(StageId::Filter))
        .requires(&[StageId::Filter])
        .run_policy(RunPolicy::WhenPending(StageId::Subsample))
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Subsample,
            Phase::Item,
            subsample_dir(),
            CompletionPredicate::FileCount {
                dir: subsample_dir(),
                pattern: SUBSAMPLE_PATTERN,
                count: config.subsample_count,
            },
            Box::new(SubsampleReads { genome_size: genome_size_cache() }),
        )
        .input_from(InputFrom::Stage(StageId::Filter))
        .requires(&[StageId::Filter])
        .tools(&[AUTOCYCLER_TAG]),
        // Coarse check: any assembly counts as done, even if some combinations failed.
        Stage::new(
            StageId::Assemble,
            Phase::Item,
            assemblies_dir(),
            CompletionPredicate::DirNonEmpty(assemblies_dir()),
            Box::new(AssembleSubsamples { genome_size: genome_size_cache() }),
        )
        .input_from(InputFrom::Stage(StageId::Subsample))
        .requires(&[StageId::Subsample])
        .tools(&assemble_tools),
        Stage::new(
            StageId::Compress,
            Phase::Item,
            consensus_dir(),
            CompletionPredicate::DirNonEmpty(consensus_dir()),
            Box::new(CompressAssemblies),
        )
        .input_from(InputFrom::Stage(StageId::Assemble))
        .requires(&[StageId::Assemble])
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Cluster,
            Phase::Item,
            clustering_dir(),
            CompletionPredicate::DirNonEmpty(clustering_dir()),
            Box::new(ClusterContigs),
        )
        .input_from(InputFrom::Stage(StageId::Compress))
        .requires(&[StageId::Compress])
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Trim,
            Phase::Cluster,
            cluster_dir(),
            CompletionPredicate::AnyMatch {
                dir: cluster_dir(),
                pattern: TRIMMED_GFA_PATTERN,
            },
            Box::new(TrimCluster),
        )
        .requires(&[StageId::Cluster])
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Resolve,
            Phase::Cluster,
            resolved_gfa(),
            CompletionPredicate::FileExists(resolved_gfa()),
            Box::new(ResolveCluster),
        )
        .input_from(InputFrom::Stage(StageId::Trim))
        .requires(&[StageId::Trim])
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Combine,
            Phase::Consensus,
            consensus_fasta(),
            CompletionPredicate::FileExists(consensus_fasta()),
            Box::new(CombineClusters),
        )
        .input_from(InputFrom::Stage(StageId::Cluster))
        .requires(&[StageId::Cluster])
        .tools(&[AUTOCYCLER_TAG]),
        Stage::new(
            StageId::Polish,
            Phase::Consensus,
            polished_fasta(),
            CompletionPredicate::FileExists(polished_fasta()),
            Box::new(PolishConsensus { reads: filtered_reads() }),
        )
        .input_from(InputFrom::Stage(StageId::Combine))
        .requires(&[StageId::Filter])
        .run_policy(RunPolicy::WhenPending(StageId::Finalize))
        .on_failure(FailurePolicy::Continue)
        .tools(&[MINIMAP2_TAG, RACON_TAG]),
        Stage::new(
            StageId::Finalize,
            Phase::Consensus,
            final_fasta(),
            CompletionPredicate::FileExists(final_fasta()),
            Box::new(FinalizeAssembly { consensus: consensus_fasta() }),
        )
        .input_from(InputFrom::Stage(StageId::Polish)),
        Stage::new(
            StageId::QualityAssess,
            Phase::Run,
            quality_report(),
            CompletionPredicate::FileExists(quality_report()),
            Box::new(AssessQuality),
        )
        .tools(&quality_tools),
    ]
}

/// Wires the stage table to a runner.
pub fn build(config: Arc<RunConfig>, runner: Arc<dyn ToolRunner>) -> Pipeline {
    let table = stages(&config);
    Pipeline::new(config, runner, table, cluster_root())
}


/// Accepts the last all-digit line of the estimator's stdout; zero counts as no estimate.
pub fn parse_genome_size(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| GENOME_SIZE_LINE.captures(line))
        .and_then(|caps| caps[1].parse::<u64>().ok())
        .filter(|&size| size > 0)
}

/// Cached estimate if one was written, otherwise the configured fallback.
async fn genome_size_for(ctx: &StageContext<'_>, cache: &PathTemplate) -> u64 {
    let path = ctx.render(cache);
    let cached = tokio::fs::read_to_string(&path).await.ok();
    match cached.and_then(|text| parse_genome_size(&text)) {
        Some(size) => size,
        None => {
            debug!(
                "{}: no cached genome size at {}, using fallback {}",
                ctx.target.label(),
                path.display(),
                ctx.config.fallback_genome_size
            );
            ctx.config.fallback_genome_size
        }
    }
}

fn prepare_dir(ctx: &StageContext<'_>, dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dir).map_err(|e| ctx.stage_failed(format!("cannot create {}: {}", dir.display(), e)))
}


struct NormalizeReads;

impl StageExecutor for NormalizeReads {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let args = samtools::fastq_args(ctx.config, &ctx.input);
            ctx.run_tool(&ToolInvocation::new(SAMTOOLS_TAG, args).stdout_to(ctx.output.clone()))
                .await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


struct FilterReads;

impl StageExecutor for FilterReads {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            if !ctx.input.is_file() {
                return Err(ctx.stage_failed(format!("input reads {} not found", ctx.input.display())));
            }
            let args = filtlong::arg_generator(ctx.config, &ctx.input);
            ctx.run_tool(&ToolInvocation::new(FILTLONG_TAG, args).stdout_to(ctx.output.clone()))
                .await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


/// Only a successful estimate is cached; a fallback is recomputed on the next run.
struct EstimateGenomeSize;

impl StageExecutor for EstimateGenomeSize {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let args = autocycler::genome_size_args(ctx.config, &ctx.input);
            let estimate = match ctx.runner.run(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await {
                Ok(output) => parse_genome_size(&output.stdout).ok_or_else(|| "estimator printed no size".to_string()),
                Err(e) => Err(e.to_string()),
            };

            match estimate {
                Ok(size) => {
                    prepare_dir(ctx, ctx.output.parent().unwrap_or_else(|| Path::new(".")))?;
                    tokio::fs::write(&ctx.output, format!("{}\n", size))
                        .await
                        .map_err(|e| ctx.stage_failed(format!("cannot cache genome size: {}", e)))?;
                    info!("{}: estimated genome size {} bp", ctx.target.label(), size);
                    Ok(StageOutcome::Produced)
                }
                Err(reason) => {
                    let e = PipelineError::EstimationFailed {
                        item: ctx.target.label(),
                        reason,
                    };
                    Ok(StageOutcome::Recovered(format!(
                        "{}; using fallback genome size {} (not cached)",
                        e, ctx.config.fallback_genome_size
                    )))
                }
            }
        }
        .boxed()
    }
}


struct SubsampleReads {
    genome_size: PathTemplate,
}

impl StageExecutor for SubsampleReads {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let genome_size = genome_size_for(ctx, &self.genome_size).await;
            prepare_dir(ctx, &ctx.output)?;
            let args = autocycler::subsample_args(ctx.config, &ctx.input, &ctx.output, genome_size);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


/// One independent run per (assembler, subsample) pair.
struct AssembleSubsamples {
    genome_size: PathTemplate,
}

/// `sample_03.fastq` -> `03`; anything else falls back to the 1-based position.
fn subsample_tag(path: &Path, index: usize) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("sample_"))
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:02}", index + 1))
}

impl StageExecutor for AssembleSubsamples {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let subsamples = matching_entries(&ctx.input, SUBSAMPLE_PATTERN).map_err(|e| ctx.stage_failed(e))?;
            if subsamples.is_empty() {
                return Err(ctx.stage_failed(format!("no subsampled reads in {}", ctx.input.display())));
            }
            let genome_size = genome_size_for(ctx, &self.genome_size).await;
            prepare_dir(ctx, &ctx.output)?;

            let mut jobs: Vec<ToolInvocation> = Vec::new();
            for assembler in &ctx.config.assemblers {
                for (index, reads) in subsamples.iter().enumerate() {
                    let prefix = ctx.output.join(format!("{}_{}", assembler, subsample_tag(reads, index)));
                    let args = autocycler::assembler_args(ctx.config, assembler, reads, &prefix, genome_size);
                    jobs.push(ToolInvocation::new(AUTOCYCLER_TAG, args));
                }
            }
            info!("{}: {} assembly runs", ctx.target.label(), jobs.len());

            let results: Vec<Result<(), PipelineError>> = stream::iter(jobs)
                .map(|job| async move { ctx.run_tool(&job).await.map(|_| ()) })
                .buffer_unordered(ctx.config.jobs)
                .collect()
                .await;
            if let Some(e) = results.into_iter().find_map(Result::err) {
                return Err(e);
            }
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


struct CompressAssemblies;

impl StageExecutor for CompressAssemblies {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            prepare_dir(ctx, &ctx.output)?;
            let args = autocycler::compress_args(ctx.config, &ctx.input, &ctx.output);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


struct ClusterContigs;

impl StageExecutor for ClusterContigs {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            // The clusterer takes the compress directory and writes clustering/ inside it.
            let args = autocycler::cluster_args(&ctx.input);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


struct TrimCluster;

impl StageExecutor for TrimCluster {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let args = autocycler::trim_args(ctx.config, &ctx.input);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


struct ResolveCluster;

impl StageExecutor for ResolveCluster {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let args = autocycler::resolve_args(&ctx.input);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


/// Merges every resolved cluster graph. No passing cluster is a soft stop, not a failure.
struct CombineClusters;

impl StageExecutor for CombineClusters {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let qc_pass = ctx.input.join(QC_PASS_DIR);
            let clusters = subdirectories(&qc_pass).map_err(|e| ctx.stage_failed(e))?;
            let resolved: Vec<PathBuf> = clusters
                .iter()
                .map(|dir| dir.join(RESOLVED_GFA))
                .filter(|gfa| gfa.is_file())
                .collect();
            if resolved.is_empty() {
                return Err(ctx.upstream_missing(&qc_pass));
            }

            let autocycler_dir = ctx.output.parent().unwrap_or_else(|| Path::new("."));
            let args = autocycler::combine_args(autocycler_dir, &resolved);
            ctx.run_tool(&ToolInvocation::new(AUTOCYCLER_TAG, args)).await?;
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


/// Maps reads onto the consensus and corrects it. The alignment only lives for this call.
struct PolishConsensus {
    reads: PathTemplate,
}

impl StageExecutor for PolishConsensus {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let consensus = &ctx.input;
            if !consensus.is_file() {
                return Err(ctx.upstream_missing(consensus));
            }
            let reads = ctx.render(&self.reads);
            let polish_dir = ctx.output.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            prepare_dir(ctx, &polish_dir)?;

            let alignment = tempfile::Builder::new()
                .prefix("alignment")
                .suffix(".sam")
                .tempfile_in(&polish_dir)
                .map_err(|e| ctx.stage_failed(e))?;

            let map_args = minimap2::arg_generator(ctx.config, consensus, &reads);
            ctx.run_tool(&ToolInvocation::new(MINIMAP2_TAG, map_args).stdout_to(alignment.path().to_path_buf()))
                .await?;

            let polish_args = racon::arg_generator(ctx.config, &reads, alignment.path(), consensus);
            ctx.run_tool(&ToolInvocation::new(RACON_TAG, polish_args).stdout_to(ctx.output.clone()))
                .await?;

            drop(alignment);
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}


/// Copies the best artifact available: polished, else the unpolished consensus.
struct FinalizeAssembly {
    consensus: PathTemplate,
}

impl StageExecutor for FinalizeAssembly {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let polished = &ctx.input;
            let consensus = ctx.render(&self.consensus);

            let (source, outcome) = if polished.is_file() {
                (polished.clone(), StageOutcome::Produced)
            } else if consensus.is_file() {
                let note = format!(
                    "polished assembly {} missing, using unpolished consensus",
                    polished.display()
                );
                (consensus, StageOutcome::Recovered(note))
            } else {
                return Err(ctx.upstream_missing(&consensus));
            };

            let (from, to) = (source.clone(), ctx.output.clone());
            tokio::task::spawn_blocking(move || copy_atomically(&from, &to))
                .await
                .map_err(|e| ctx.stage_failed(e))?
                .map_err(|e| ctx.stage_failed(format!("cannot copy {}: {}", source.display(), e)))?;
            info!("{}: final assembly at {}", ctx.target.label(), ctx.output.display());
            Ok(outcome)
        }
        .boxed()
    }
}


struct AssessQuality;

impl StageExecutor for AssessQuality {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>> {
        async move {
            let Some(database) = &ctx.config.quality_db else {
                return Ok(StageOutcome::Skipped("no quality database configured".to_string()));
            };
            let assemblies = matching_entries(&ctx.input, &format!("*.{}", FINAL_EXT)).map_err(|e| ctx.stage_failed(e))?;
            if assemblies.is_empty() {
                return Err(ctx.upstream_missing(&ctx.input));
            }

            let report_dir = ctx.output.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
            let args = checkm2::predict_args(ctx.config, &ctx.input, &report_dir, database);
            ctx.run_tool(&ToolInvocation::new(CHECKM2_TAG, args)).await?;
            info!("Quality report for {} assemblies at {}", assemblies.len(), ctx.output.display());
            Ok(StageOutcome::Produced)
        }
        .boxed()
    }
}
