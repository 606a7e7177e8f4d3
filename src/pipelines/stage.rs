//! Stage descriptors: what a stage reads, writes, requires, and how it runs.

use std::fmt;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;

use crate::config::RunConfig;
use crate::config::defs::{PipelineError, FINAL_ASSEMBLIES_DIR};
use crate::pipelines::predicate::{CompletionPredicate, PathTemplate, TemplateVars};
use crate::utils::command::{ToolInvocation, ToolOutput, ToolRunner};
use crate::utils::discovery::{InputKind, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Normalize,
    Filter,
    SizeEstimate,
    Subsample,
    Assemble,
    Compress,
    Cluster,
    Trim,
    Resolve,
    Combine,
    Polish,
    Finalize,
    QualityAssess,
}

impl StageId {
    pub fn name(&self) -> &'static str {
        match self {
            StageId::Normalize => "normalize",
            StageId::Filter => "filter",
            StageId::SizeEstimate => "size_estimate",
            StageId::Subsample => "subsample",
            StageId::Assemble => "assemble",
            StageId::Compress => "compress",
            StageId::Cluster => "cluster",
            StageId::Trim => "trim",
            StageId::Resolve => "resolve",
            StageId::Combine => "combine",
            StageId::Polish => "polish",
            StageId::Finalize => "finalize",
            StageId::QualityAssess => "quality_assess",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which driver phase a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Per work item, before clusters exist.
    Item,
    /// Per QC-passing cluster of a work item.
    Cluster,
    /// Per work item, after all its clusters resolved.
    Consensus,
    /// Once over the whole run.
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFrom {
    /// The target itself: the input file, the cluster directory, or the final output directory.
    Source,
    /// Another stage's artifact. A stage that does not apply forwards its own input.
    Stage(StageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    Always,
    /// Run only while the named stage still has to run for the same target.
    WhenPending(StageId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    FailItem,
    /// Log the failure and carry on with the next stage.
    Continue,
}

/// A QC-passing partition discovered under the clustering output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    Item(&'a WorkItem),
    Cluster(&'a WorkItem, &'a Cluster),
    Run,
}

impl<'a> Target<'a> {
    pub fn item(&self) -> Option<&'a WorkItem> {
        match *self {
            Target::Item(item) | Target::Cluster(item, _) => Some(item),
            Target::Run => None,
        }
    }

    pub fn label(&self) -> String {
        match *self {
            Target::Item(item) => item.id.clone(),
            Target::Cluster(item, cluster) => format!("{}/{}", item.id, cluster.name),
            Target::Run => "run".to_string(),
        }
    }

    pub fn vars(&self, out: &'a Path) -> TemplateVars<'a> {
        match *self {
            Target::Item(item) => TemplateVars { out, id: Some(item.id.as_str()), cluster: None },
            Target::Cluster(item, cluster) => TemplateVars {
                out,
                id: Some(item.id.as_str()),
                cluster: Some(cluster.name.as_str()),
            },
            Target::Run => TemplateVars { out, id: None, cluster: None },
        }
    }

    /// Input of an `InputFrom::Source` stage.
    pub fn source(&self, out: &Path) -> PathBuf {
        match *self {
            Target::Item(item) => item.path.clone(),
            Target::Cluster(_, cluster) => cluster.dir.clone(),
            Target::Run => out.join(FINAL_ASSEMBLIES_DIR),
        }
    }
}

/// What a stage reported back when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Produced,
    /// Produced something, but only through a documented fallback.
    Recovered(String),
    /// Deliberately did nothing.
    Skipped(String),
}

/// Everything an executor may look at. Built fresh for each invocation.
pub struct StageContext<'a> {
    pub stage: StageId,
    pub config: &'a RunConfig,
    pub runner: &'a dyn ToolRunner,
    pub target: Target<'a>,
    pub input: PathBuf,
    pub output: PathBuf,
}

impl<'a> StageContext<'a> {
    pub fn render(&self, template: &PathTemplate) -> PathBuf {
        template.render(self.target.vars(&self.config.out_dir))
    }

    pub async fn run_tool(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
        self.runner
            .run(invocation)
            .await
            .map_err(|e| self.stage_failed(e))
    }

    pub fn stage_failed(&self, e: impl fmt::Display) -> PipelineError {
        PipelineError::StageFailed {
            stage: self.stage,
            item: self.target.label(),
            error: e.to_string(),
        }
    }

    pub fn upstream_missing(&self, path: &Path) -> PipelineError {
        PipelineError::UpstreamArtifactMissing {
            stage: self.stage,
            item: self.target.label(),
            path: path.to_path_buf(),
        }
    }
}

/// The external action behind a stage.
pub trait StageExecutor: Send + Sync {
    fn execute<'a>(&'a self, ctx: &'a StageContext<'a>) -> BoxFuture<'a, Result<StageOutcome, PipelineError>>;
}

pub struct Stage {
    pub id: StageId,
    pub phase: Phase,
    pub input_from: InputFrom,
    pub output: PathTemplate,
    pub completion: CompletionPredicate,
    pub requires: Vec<StageId>,
    pub only_for: Option<InputKind>,
    pub run_policy: RunPolicy,
    pub on_failure: FailurePolicy,
    pub tools: Vec<&'static str>,
    pub executor: Box<dyn StageExecutor>,
}

impl Stage {
    pub fn new(
        id: StageId,
        phase: Phase,
        output: PathTemplate,
        completion: CompletionPredicate,
        executor: Box<dyn StageExecutor>,
    ) -> Self {
        Stage {
            id,
            phase,
            input_from: InputFrom::Source,
            output,
            completion,
            requires: Vec::new(),
            only_for: None,
            run_policy: RunPolicy::Always,
            on_failure: FailurePolicy::FailItem,
            tools: Vec::new(),
            executor,
        }
    }

    pub fn input_from(mut self, input_from: InputFrom) -> Self {
        self.input_from = input_from;
        self
    }

    pub fn requires(mut self, requires: &[StageId]) -> Self {
        self.requires = requires.to_vec();
        self
    }

    pub fn only_for(mut self, kind: InputKind) -> Self {
        self.only_for = Some(kind);
        self
    }

    pub fn run_policy(mut self, policy: RunPolicy) -> Self {
        self.run_policy = policy;
        self
    }

    pub fn on_failure(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn tools(mut self, tools: &[&'static str]) -> Self {
        self.tools = tools.to_vec();
        self
    }

    pub fn applies_to(&self, item: &WorkItem) -> bool {
        self.only_for.map_or(true, |kind| kind == item.kind)
    }

    pub fn is_complete(&self, target: Target<'_>, out: &Path) -> bool {
        self.completion.is_satisfied(target.vars(out))
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("input_from", &self.input_from)
            .field("output", &self.output)
            .field("requires", &self.requires)
            .finish()
    }
}
