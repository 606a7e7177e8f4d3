//! Generic stage-table driver.
//!
//! Each work item walks an explicit phase sequence: item stages, cluster discovery,
//! per-cluster stages, consensus stages. Run-wide stages start once every item is done.
//! The filesystem is the only state: a stage whose completion predicate holds is never
//! invoked again.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::config::defs::{PipelineError, RUN_REPORT, STAGE_DIRS};
use crate::pipelines::predicate::PathTemplate;
use crate::pipelines::report::{timestamp, EventStatus, ItemReport, RunSummary, StageEvent};
use crate::pipelines::stage::{
    Cluster, FailurePolicy, InputFrom, Phase, RunPolicy, Stage, StageContext, StageId, StageOutcome, Target,
};
use crate::utils::command::{check_tools, ToolRunner};
use crate::utils::discovery::{discover_work_items, WorkItem};
use crate::utils::file::subdirectories;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    ItemStages,
    ClusterDiscovery,
    ClusterStages,
    ConsensusStages,
    Done,
}

impl DriverPhase {
    pub fn next(self) -> Self {
        match self {
            DriverPhase::ItemStages => DriverPhase::ClusterDiscovery,
            DriverPhase::ClusterDiscovery => DriverPhase::ClusterStages,
            DriverPhase::ClusterStages => DriverPhase::ConsensusStages,
            DriverPhase::ConsensusStages | DriverPhase::Done => DriverPhase::Done,
        }
    }
}

/// Error from a stage together with the stage that raised it.
type StageStop = (Option<StageId>, PipelineError);

pub struct Pipeline {
    config: Arc<RunConfig>,
    runner: Arc<dyn ToolRunner>,
    stages: Vec<Stage>,
    cluster_root: PathTemplate,
}

impl Pipeline {
    /// `cluster_root` names the directory whose subdirectories become clusters.
    pub fn new(
        config: Arc<RunConfig>,
        runner: Arc<dyn ToolRunner>,
        stages: Vec<Stage>,
        cluster_root: PathTemplate,
    ) -> Self {
        Pipeline { config, runner, stages, cluster_root }
    }

    fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    fn out(&self) -> &Path {
        &self.config.out_dir
    }

    /// Tools needed by at least one stage that applies to at least one item.
    pub fn required_tools(&self, items: &[WorkItem]) -> Vec<&'static str> {
        let mut tools = BTreeSet::new();
        for stage in &self.stages {
            let used = match stage.phase {
                Phase::Run => true,
                _ => items.iter().any(|item| stage.applies_to(item)),
            };
            if used {
                tools.extend(stage.tools.iter().copied());
            }
        }
        tools.into_iter().collect()
    }

    /// Discovers work items, drives every stage, and writes the run report.
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let started_at = timestamp();
        let items = discover_work_items(&self.config.in_dir)?;
        info!(
            "Found {} samples in {}: {}",
            items.len(),
            self.config.in_dir.display(),
            items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        if self.config.check_tools {
            check_tools(self.runner.as_ref(), &self.required_tools(&items))?;
        }

        for dir in STAGE_DIRS {
            fs::create_dir_all(self.out().join(dir))?;
        }

        let mut reports: Vec<(usize, ItemReport)> = stream::iter(items.iter().enumerate())
            .map(|(index, item)| async move { (index, self.drive_item(item).await) })
            .buffer_unordered(self.config.jobs)
            .collect()
            .await;
        reports.sort_by_key(|(index, _)| *index);

        let mut aggregate = Vec::new();
        let aggregate_error = match self.drive_phase(Phase::Run, Target::Run, &mut aggregate).await {
            Ok(()) => None,
            Err((_, e)) if e.is_soft() => {
                warn!("{}", e);
                None
            }
            Err((_, e)) => {
                error!("{}", e);
                Some(e.to_string())
            }
        };

        let summary = RunSummary {
            started_at,
            finished_at: timestamp(),
            out_dir: self.config.out_dir.clone(),
            items: reports.into_iter().map(|(_, report)| report).collect(),
            aggregate,
            aggregate_error,
        };
        let report_path = self.out().join(RUN_REPORT);
        summary.write_json(&report_path)?;
        info!("Run report written to {}", report_path.display());
        summary.log();
        Ok(summary)
    }

    /// Walks one item through its phases. Never fails: problems land in the report.
    pub async fn drive_item(&self, item: &WorkItem) -> ItemReport {
        let mut report = ItemReport::new(item);
        let mut phase = DriverPhase::ItemStages;
        let mut clusters: Vec<Cluster> = Vec::new();

        while phase != DriverPhase::Done {
            let step = match phase {
                DriverPhase::ItemStages => {
                    self.drive_phase(Phase::Item, Target::Item(item), &mut report.events).await
                }
                DriverPhase::ClusterDiscovery => match self.discover_clusters(item) {
                    Ok(found) => {
                        clusters = found;
                        Ok(())
                    }
                    Err(e) => Err((None, e)),
                },
                DriverPhase::ClusterStages => self.drive_clusters(item, &clusters, &mut report.events).await,
                DriverPhase::ConsensusStages => {
                    self.drive_phase(Phase::Consensus, Target::Item(item), &mut report.events).await
                }
                DriverPhase::Done => Ok(()),
            };

            match step {
                Ok(()) => phase = phase.next(),
                Err((stage, e)) => {
                    if e.is_soft() {
                        warn!("{}", e);
                        self.skip_remaining(item, stage, &mut report.events);
                    } else {
                        error!("{}: {}", item.id, e);
                    }
                    report.stop(stage, &e);
                    break;
                }
            }
        }

        if report.error.is_none() {
            info!("{}: all stages complete", item.id);
        }
        report
    }

    fn discover_clusters(&self, item: &WorkItem) -> Result<Vec<Cluster>, PipelineError> {
        let root = self.cluster_root.render(Target::Item(item).vars(self.out()));
        let clusters: Vec<Cluster> = subdirectories(&root)?
            .into_iter()
            .filter_map(|dir| {
                let name = dir.file_name()?.to_string_lossy().into_owned();
                Some(Cluster { name, dir })
            })
            .collect();
        if clusters.is_empty() {
            warn!("{}: no QC-passing clusters under {}", item.id, root.display());
        } else {
            info!("{}: {} QC-passing clusters", item.id, clusters.len());
        }
        Ok(clusters)
    }

    async fn drive_clusters(
        &self,
        item: &WorkItem,
        clusters: &[Cluster],
        events: &mut Vec<StageEvent>,
    ) -> Result<(), StageStop> {
        let results: Vec<(Vec<StageEvent>, Result<(), StageStop>)> = stream::iter(clusters.iter())
            .map(|cluster| async move {
                let mut cluster_events = Vec::new();
                let result = self
                    .drive_phase(Phase::Cluster, Target::Cluster(item, cluster), &mut cluster_events)
                    .await;
                (cluster_events, result)
            })
            .buffered(self.config.jobs)
            .collect()
            .await;

        let mut first_error = None;
        for (cluster_events, result) in results {
            events.extend(cluster_events);
            if let Err(stop) = result {
                if first_error.is_none() {
                    first_error = Some(stop);
                }
            }
        }
        match first_error {
            Some(stop) => Err(stop),
            None => Ok(()),
        }
    }

    /// Runs every stage of `phase` for `target` in table order.
    async fn drive_phase(
        &self,
        phase: Phase,
        target: Target<'_>,
        events: &mut Vec<StageEvent>,
    ) -> Result<(), StageStop> {
        let label = target.label();

        for stage in self.stages.iter().filter(|s| s.phase == phase) {
            if let Some(item) = target.item() {
                if !stage.applies_to(item) {
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::NotApplicable, None));
                    continue;
                }
            }

            if stage.is_complete(target, self.out()) {
                info!("{}: {} already complete, skipping", label, stage.id);
                events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Cached, None));
                continue;
            }

            if let RunPolicy::WhenPending(consumer) = stage.run_policy {
                let consumer_done = self
                    .stage(consumer)
                    .is_some_and(|c| c.is_complete(target, self.out()));
                if consumer_done {
                    debug!("{}: {} not needed, {} is complete", label, stage.id, consumer);
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::NotNeeded, None));
                    continue;
                }
            }

            if let Err(e) = self.verify_dependencies(stage, target) {
                events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Failed, Some(e.to_string())));
                return Err((Some(stage.id), e));
            }

            let ctx = StageContext {
                stage: stage.id,
                config: &self.config,
                runner: self.runner.as_ref(),
                target,
                input: self.resolve_input(stage, target),
                output: stage.output.render(target.vars(self.out())),
            };
            info!("{}: running {}", label, stage.id);

            match stage.executor.execute(&ctx).await {
                Ok(StageOutcome::Produced) => {
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Executed, None));
                }
                Ok(StageOutcome::Recovered(message)) => {
                    warn!("{}: {}: {}", label, stage.id, message);
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Recovered, Some(message)));
                }
                Ok(StageOutcome::Skipped(message)) => {
                    warn!("{}: {} skipped: {}", label, stage.id, message);
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Skipped, Some(message)));
                }
                Err(e) if e.is_soft() => {
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Skipped, Some(e.to_string())));
                    return Err((Some(stage.id), e));
                }
                Err(e) => {
                    let e = match e {
                        PipelineError::StageFailed { .. } | PipelineError::DependencyUnsatisfied { .. } => e,
                        other => ctx.stage_failed(other),
                    };
                    events.push(StageEvent::new(stage.id, label.clone(), EventStatus::Failed, Some(e.to_string())));
                    match stage.on_failure {
                        FailurePolicy::Continue => warn!("{}; continuing", e),
                        FailurePolicy::FailItem => return Err((Some(stage.id), e)),
                    }
                }
            }
        }
        Ok(())
    }

    fn verify_dependencies(&self, stage: &Stage, target: Target<'_>) -> Result<(), PipelineError> {
        for &required in &stage.requires {
            let Some(dependency) = self.stage(required) else {
                return Err(PipelineError::InvalidConfig(format!(
                    "{} requires unknown stage {}",
                    stage.id, required
                )));
            };
            let dependency_target = match (dependency.phase, target) {
                (Phase::Cluster, Target::Cluster(..)) => target,
                (Phase::Run, _) => Target::Run,
                (_, Target::Cluster(item, _)) => Target::Item(item),
                _ => target,
            };
            if let Some(item) = dependency_target.item() {
                if !dependency.applies_to(item) {
                    continue;
                }
            }
            if !dependency.is_complete(dependency_target, self.out()) {
                debug!(
                    "{}: {} unmet: expected {}",
                    target.label(),
                    required,
                    dependency.completion.describe(dependency_target.vars(self.out()))
                );
                return Err(PipelineError::DependencyUnsatisfied {
                    stage: stage.id,
                    requires: required,
                    item: target.label(),
                });
            }
        }
        Ok(())
    }

    /// Follows `input_from` links, skipping stages that do not apply to the item.
    fn resolve_input(&self, stage: &Stage, target: Target<'_>) -> std::path::PathBuf {
        let mut link = stage.input_from;
        loop {
            match link {
                InputFrom::Source => return target.source(self.out()),
                InputFrom::Stage(id) => match self.stage(id) {
                    Some(upstream) => {
                        let applies = target.item().is_none_or(|item| upstream.applies_to(item));
                        if applies {
                            return upstream.output.render(target.vars(self.out()));
                        }
                        link = upstream.input_from;
                    }
                    None => return target.source(self.out()),
                },
            }
        }
    }

    /// Records the item-scoped stages after `stopped` as skipped.
    fn skip_remaining(&self, item: &WorkItem, stopped: Option<StageId>, events: &mut Vec<StageEvent>) {
        let Some(stopped) = stopped else {
            return;
        };
        for stage in &self.stages {
            if stage.phase == Phase::Run || stage.id <= stopped || !stage.applies_to(item) {
                continue;
            }
            let reason = format!("not run because {} stopped", stopped);
            warn!("{}: {} skipped, {}", item.id, stage.id, reason);
            events.push(StageEvent::new(stage.id, item.id.clone(), EventStatus::Skipped, Some(reason)));
        }
    }
}
