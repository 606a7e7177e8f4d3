mod common;

use std::fs;
use std::sync::Arc;

use anyhow::Result;

use common::{pipeline, pipeline_with, ShellTools, SimulatedTools, Workspace, CAT_LAST_ARG, CONSENSUS_BODY, POLISHED_BODY};
use cycler_pipeline::config::defs::PipelineError;
use cycler_pipeline::pipelines::report::{EventStatus, ItemStatus};
use cycler_pipeline::pipelines::stage::StageId;
use cycler_pipeline::utils::command::ToolRunner;
use cycler_pipeline::utils::discovery::InputKind;


#[tokio::test]
async fn test_mixed_inputs_normalize_only_alignment_files() -> Result<()> {
    let ws = Workspace::new(&["sample1.fastq.gz", "sample2.bam", "notes.txt"]);
    let tools = Arc::new(SimulatedTools::new());
    let summary = pipeline(ws.config(), &tools).run().await?;

    assert_eq!(summary.items.len(), 2);
    assert_eq!(summary.items[0].kind, InputKind::RawReads);
    assert_eq!(summary.items[1].kind, InputKind::Converted);

    let samtools = tools.calls_of("samtools", Some("fastq"));
    assert_eq!(samtools.len(), 1);
    assert!(samtools[0].args.last().unwrap().ends_with("sample2.bam"));
    assert!(ws.out("00_filtered_reads/sample2_converted.fastq").is_file());
    assert!(!ws.out("00_filtered_reads/sample1_converted.fastq").exists());

    let filtlong = tools.calls_of("filtlong", None);
    assert_eq!(filtlong.len(), 2);
    let inputs: Vec<&String> = filtlong.iter().map(|c| c.args.last().unwrap()).collect();
    assert!(inputs.iter().any(|i| i.ends_with("reads/sample1.fastq.gz")));
    assert!(inputs.iter().any(|i| i.ends_with("00_filtered_reads/sample2_converted.fastq")));

    let sample1 = summary.item("sample1").unwrap();
    assert_eq!(sample1.status_of(StageId::Normalize), vec![EventStatus::NotApplicable]);
    assert_eq!(sample1.status, ItemStatus::Completed);
    assert!(ws.out("05_final_assemblies/sample1.fasta").is_file());
    assert!(ws.out("05_final_assemblies/sample2.fasta").is_file());
    assert!(ws.out("pipeline_report.json").is_file());
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[tokio::test]
async fn test_every_assembler_runs_on_every_subsample() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let tools = Arc::new(SimulatedTools::new());
    pipeline(ws.config(), &tools).run().await?;

    let assemblies = tools
        .calls_of("autocycler", Some("helper"))
        .into_iter()
        .filter(|c| c.args[1] != "genome_size")
        .count();
    assert_eq!(assemblies, 4);
    for name in ["flye_01", "flye_02", "raven_01", "raven_02"] {
        assert!(ws.out(&format!("02_assemblies/s1/{}.fasta", name)).is_file(), "{} missing", name);
    }
    assert_eq!(tools.calls_of("autocycler", Some("trim")).len(), 2);
    assert_eq!(tools.calls_of("autocycler", Some("resolve")).len(), 2);
    let combine = tools.calls_of("autocycler", Some("combine"));
    assert_eq!(combine.len(), 1);
    assert_eq!(combine[0].args.iter().filter(|a| a.ends_with("5_final.gfa")).count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_estimated_genome_size_is_cached_and_used() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let tools = Arc::new(SimulatedTools::new());
    pipeline(ws.config(), &tools).run().await?;

    assert_eq!(fs::read_to_string(ws.out("00_filtered_reads/s1_genome_size.txt"))?.trim(), "4200000");
    let subsample = tools.calls_of("autocycler", Some("subsample"));
    assert!(subsample[0].args.windows(2).any(|w| w[0] == "--genome_size" && w[1] == "4200000"));
    Ok(())
}

#[tokio::test]
async fn test_failed_estimate_falls_back_without_caching() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.genome_size_stdout = Some("could not estimate\n".to_string());
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    assert!(!ws.out("00_filtered_reads/s1_genome_size.txt").exists());
    let subsample = tools.calls_of("autocycler", Some("subsample"));
    assert!(subsample[0].args.windows(2).any(|w| w[0] == "--genome_size" && w[1] == "5000000"));
    let item = summary.item("s1").unwrap();
    assert_eq!(item.status_of(StageId::SizeEstimate), vec![EventStatus::Recovered]);
    assert_eq!(item.status, ItemStatus::Completed);

    // Estimation is retried while subsampling still has to run.
    fs::remove_dir_all(ws.out("01_subsampled_reads/s1"))?;
    let retry = Arc::new(SimulatedTools::new());
    pipeline(ws.config(), &retry).run().await?;
    assert_eq!(fs::read_to_string(ws.out("00_filtered_reads/s1_genome_size.txt"))?.trim(), "4200000");
    assert_eq!(retry.calls_of("autocycler", Some("subsample")).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_zero_clusters_leaves_item_incomplete() -> Result<()> {
    let ws = Workspace::new(&["good.fastq", "empty.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.clusters.insert("empty".to_string(), 0);
    let tools = Arc::new(sim);
    let mut config = ws.config();
    config.quality_db = Some(ws.tmp.path().join("checkm2_db.dmnd"));
    let summary = pipeline(config, &tools).run().await?;

    let empty = summary.item("empty").unwrap();
    assert_eq!(empty.status, ItemStatus::Incomplete);
    assert_eq!(empty.stopped_at, Some(StageId::Combine));
    assert_eq!(empty.status_of(StageId::Combine), vec![EventStatus::Skipped]);
    assert_eq!(empty.status_of(StageId::Polish), vec![EventStatus::Skipped]);
    assert_eq!(empty.status_of(StageId::Finalize), vec![EventStatus::Skipped]);
    assert!(!ws.out("03_consensus/empty/consensus_assembly.fasta").exists());
    assert!(!ws.out("05_final_assemblies/empty.fasta").exists());

    assert_eq!(summary.item("good").unwrap().status, ItemStatus::Completed);
    assert_eq!(tools.calls_of("checkm2", Some("predict")).len(), 1);
    assert!(ws.out("05_final_assemblies/quality/quality_report.tsv").is_file());
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[tokio::test]
async fn test_polished_assembly_is_finalized() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let tools = Arc::new(SimulatedTools::new());
    pipeline(ws.config(), &tools).run().await?;

    assert_eq!(fs::read_to_string(ws.out("05_final_assemblies/s1.fasta"))?, POLISHED_BODY);
    let minimap2 = tools.calls_of("minimap2", None);
    assert_eq!(minimap2.len(), 1);
    assert!(minimap2[0].args.contains(&"map-ont".to_string()));
    let leftovers: Vec<_> = fs::read_dir(ws.out("04_polished/s1"))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["polished.fasta".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_polish_failure_falls_back_to_consensus() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.failures.push(("racon", String::new()));
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    let item = summary.item("s1").unwrap();
    assert_eq!(item.status_of(StageId::Polish), vec![EventStatus::Failed]);
    assert_eq!(item.status_of(StageId::Finalize), vec![EventStatus::Recovered]);
    assert_eq!(item.status, ItemStatus::Completed);
    assert!(!ws.out("04_polished/s1/polished.fasta").exists());
    assert_eq!(fs::read_to_string(ws.out("05_final_assemblies/s1.fasta"))?, CONSENSUS_BODY);
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[tokio::test]
async fn test_second_run_invokes_nothing() -> Result<()> {
    let ws = Workspace::new(&["sample1.fastq.gz", "sample2.bam"]);
    let mut config = ws.config();
    config.quality_db = Some(ws.tmp.path().join("checkm2_db.dmnd"));

    let first = Arc::new(SimulatedTools::new());
    let summary = pipeline(config.clone(), &first).run().await?;
    assert!(summary.executed_count() > 0);

    let second = Arc::new(SimulatedTools::new());
    let rerun = pipeline(config, &second).run().await?;
    assert!(second.calls().is_empty(), "unexpected calls: {:?}", second.calls());
    assert_eq!(rerun.executed_count(), 0);
    let sample2 = rerun.item("sample2").unwrap();
    assert_eq!(sample2.status_of(StageId::Normalize), vec![EventStatus::Cached]);
    assert_eq!(sample2.status_of(StageId::SizeEstimate), vec![EventStatus::Cached]);
    assert_eq!(rerun.exit_code(), 0);
    Ok(())
}

#[tokio::test]
async fn test_existing_artifact_skips_its_stage() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    fs::create_dir_all(ws.out("00_filtered_reads"))?;
    fs::write(ws.out("00_filtered_reads/s1_filtered.fastq"), b"@r\nACGT\n+\nIIII\n")?;
    let tools = Arc::new(SimulatedTools::new());
    let summary = pipeline(ws.config(), &tools).run().await?;

    assert!(tools.calls_of("filtlong", None).is_empty());
    assert_eq!(summary.item("s1").unwrap().status_of(StageId::Filter), vec![EventStatus::Cached]);
    assert_eq!(tools.calls_of("autocycler", Some("subsample")).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stage_failure_is_isolated_to_its_item() -> Result<()> {
    let ws = Workspace::new(&["bad.fastq", "good.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.failures.push(("autocycler", "02_assemblies/bad/".to_string()));
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    let bad = summary.item("bad").unwrap();
    assert_eq!(bad.status, ItemStatus::Failed);
    assert_eq!(bad.stopped_at, Some(StageId::Assemble));
    assert!(bad.error.as_deref().unwrap().contains("assemble failed for bad"));
    assert!(bad.status_of(StageId::Compress).is_empty());

    assert_eq!(summary.item("good").unwrap().status, ItemStatus::Completed);
    assert!(ws.out("05_final_assemblies/good.fasta").is_file());
    assert_eq!(summary.exit_code(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_dependency_artifact_fails_item() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.silent.insert("flye".to_string());
    sim.silent.insert("raven".to_string());
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    let item = summary.item("s1").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.stopped_at, Some(StageId::Compress));
    assert_eq!(item.status_of(StageId::Assemble), vec![EventStatus::Executed]);
    assert!(item.error.as_deref().unwrap().contains("requires assemble"));
    assert!(tools.calls_of("autocycler", Some("compress")).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_quality_skipped_without_database() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let tools = Arc::new(SimulatedTools::new());
    let summary = pipeline(ws.config(), &tools).run().await?;

    assert!(tools.calls_of("checkm2", None).is_empty());
    assert_eq!(summary.aggregate.len(), 1);
    assert_eq!(summary.aggregate[0].status, EventStatus::Skipped);
    assert!(summary.aggregate_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_quality_failure_sets_exit_code() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.failures.push(("checkm2", String::new()));
    let tools = Arc::new(sim);
    let mut config = ws.config();
    config.quality_db = Some(ws.tmp.path().join("checkm2_db.dmnd"));
    let summary = pipeline(config, &tools).run().await?;

    assert_eq!(summary.item("s1").unwrap().status, ItemStatus::Completed);
    assert!(summary.aggregate_error.is_some());
    assert_eq!(summary.exit_code(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_tool_stops_before_any_stage() {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.missing.insert("racon".to_string());
    let tools = Arc::new(sim);
    let result = pipeline(ws.config(), &tools).run().await;

    assert!(matches!(result, Err(PipelineError::ToolUnavailable(ref t)) if t == "racon"));
    assert!(tools.calls().is_empty());
    assert!(!ws.out_dir.exists());
}

#[tokio::test]
async fn test_samtools_not_required_without_alignment_inputs() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.missing.insert("samtools".to_string());
    sim.missing.insert("checkm2".to_string());
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;
    assert_eq!(summary.exit_code(), 0);
    Ok(())
}

#[tokio::test]
async fn test_input_errors() {
    let ws = Workspace::new(&["readme.md"]);
    let tools = Arc::new(SimulatedTools::new());
    let result = pipeline(ws.config(), &tools).run().await;
    assert!(matches!(result, Err(PipelineError::NoInputFound(_))));

    let mut config = ws.config();
    config.in_dir = ws.tmp.path().join("absent");
    let result = pipeline(config, &tools).run().await;
    assert!(matches!(result, Err(PipelineError::InputDirMissing(_))));
}

#[tokio::test]
async fn test_captured_outputs_reach_disk_through_process_runner() -> Result<()> {
    let ws = Workspace::new(&["s1.bam"]);
    let shell = Arc::new(ShellTools::new(&[
        ("samtools", CAT_LAST_ARG),
        ("filtlong", CAT_LAST_ARG),
        ("minimap2", r#"printf '@HD\tVN:1.6\n'"#),
        ("racon", CAT_LAST_ARG),
    ]));
    let runner: Arc<dyn ToolRunner> = shell.clone();
    let summary = pipeline_with(ws.config(), runner).run().await?;

    let item = summary.item("s1").unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.status_of(StageId::Polish), vec![EventStatus::Executed]);
    assert_eq!(fs::read_to_string(ws.out("00_filtered_reads/s1_converted.fastq"))?, "reads");
    assert_eq!(fs::read_to_string(ws.out("00_filtered_reads/s1_filtered.fastq"))?, "reads");
    assert_eq!(fs::read_to_string(ws.out("04_polished/s1/polished.fasta"))?, CONSENSUS_BODY);
    assert_eq!(fs::read_to_string(ws.out("05_final_assemblies/s1.fasta"))?, CONSENSUS_BODY);

    for dir in ["00_filtered_reads", "04_polished/s1"] {
        let hidden: Vec<_> = fs::read_dir(ws.out(dir))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(hidden.is_empty(), "temporary files left in {}", dir);
    }
    assert_eq!(fs::read_dir(ws.out("04_polished/s1"))?.count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_fallback_final_assembly_is_not_repolished() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.failures.push(("racon", String::new()));
    let failing = Arc::new(sim);
    pipeline(ws.config(), &failing).run().await?;
    assert_eq!(fs::read_to_string(ws.out("05_final_assemblies/s1.fasta"))?, CONSENSUS_BODY);

    let rerun_tools = Arc::new(SimulatedTools::new());
    let rerun = pipeline(ws.config(), &rerun_tools).run().await?;
    assert!(rerun_tools.calls().is_empty());
    assert_eq!(rerun.item("s1").unwrap().status_of(StageId::Polish), vec![EventStatus::NotNeeded]);
    assert!(!ws.out("04_polished/s1/polished.fasta").exists());

    // Removing the final copy lets polishing run again, and the polished result wins.
    fs::remove_file(ws.out("05_final_assemblies/s1.fasta"))?;
    let repolish = Arc::new(SimulatedTools::new());
    let summary = pipeline(ws.config(), &repolish).run().await?;
    assert_eq!(repolish.calls_of("racon", None).len(), 1);
    assert_eq!(summary.item("s1").unwrap().status_of(StageId::Finalize), vec![EventStatus::Executed]);
    assert_eq!(fs::read_to_string(ws.out("05_final_assemblies/s1.fasta"))?, POLISHED_BODY);
    Ok(())
}

#[tokio::test]
async fn test_missing_assembler_binary_fails_setup() {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.missing.insert("flye".to_string());
    let tools = Arc::new(sim);
    let result = pipeline(ws.config(), &tools).run().await;

    assert!(matches!(result, Err(PipelineError::ToolUnavailable(ref t)) if t == "flye"));
    assert!(tools.calls().is_empty());
    assert!(!ws.out_dir.exists());
}

#[tokio::test]
async fn test_cluster_failure_stops_item_but_not_sibling_cluster() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.failures.push(("autocycler", "cluster_002 --threads".to_string()));
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    let item = summary.item("s1").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.stopped_at, Some(StageId::Trim));
    assert!(item.error.as_deref().unwrap().contains("trim failed for s1/cluster_002"));
    assert_eq!(item.status_of(StageId::Trim), vec![EventStatus::Executed, EventStatus::Failed]);
    assert_eq!(item.status_of(StageId::Resolve), vec![EventStatus::Executed]);
    assert!(ws.out("03_consensus/s1/clustering/qc_pass/cluster_001/5_final.gfa").is_file());
    assert!(tools.calls_of("autocycler", Some("combine")).is_empty());
    assert_eq!(summary.exit_code(), 2);

    let retry = Arc::new(SimulatedTools::new());
    let rerun = pipeline(ws.config(), &retry).run().await?;
    assert_eq!(retry.calls_of("autocycler", Some("trim")).len(), 1);
    assert_eq!(retry.calls_of("autocycler", Some("resolve")).len(), 1);
    assert_eq!(rerun.item("s1").unwrap().status, ItemStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn test_cluster_stage_dependency_is_verified() -> Result<()> {
    let ws = Workspace::new(&["s1.fastq"]);
    let mut sim = SimulatedTools::new();
    sim.silent.insert("trim".to_string());
    let tools = Arc::new(sim);
    let summary = pipeline(ws.config(), &tools).run().await?;

    let item = summary.item("s1").unwrap();
    assert_eq!(item.status, ItemStatus::Failed);
    assert_eq!(item.stopped_at, Some(StageId::Resolve));
    assert!(item.error.as_deref().unwrap().contains("resolve for s1/cluster_001 requires trim"));
    assert!(tools.calls_of("autocycler", Some("resolve")).is_empty());
    assert!(tools.calls_of("autocycler", Some("combine")).is_empty());
    Ok(())
}
