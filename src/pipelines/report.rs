//! Per-run outcome ledger, logged at the end and written as JSON next to the stage directories.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;

use crate::config::defs::PipelineError;
use crate::pipelines::stage::StageId;
use crate::utils::discovery::{InputKind, WorkItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Completion predicate already held.
    Cached,
    Executed,
    NotApplicable,
    /// Deferred stage whose consumer was already complete.
    NotNeeded,
    Skipped,
    Recovered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEvent {
    pub stage: StageId,
    pub target: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageEvent {
    pub fn new(stage: StageId, target: String, status: EventStatus, message: Option<String>) -> Self {
        StageEvent { stage, target, status, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Completed,
    /// Stopped early on a missing upstream artifact; not an error.
    Incomplete,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub id: String,
    pub input: PathBuf,
    pub kind: InputKind,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<StageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<StageEvent>,
}

impl ItemReport {
    pub fn new(item: &WorkItem) -> Self {
        ItemReport {
            id: item.id.clone(),
            input: item.path.clone(),
            kind: item.kind,
            status: ItemStatus::Completed,
            stopped_at: None,
            error: None,
            events: Vec::new(),
        }
    }

    pub fn stop(&mut self, stage: Option<StageId>, e: &PipelineError) {
        self.status = if e.is_soft() {
            ItemStatus::Incomplete
        } else {
            ItemStatus::Failed
        };
        self.stopped_at = stage;
        self.error = Some(e.to_string());
    }

    pub fn status_of(&self, stage: StageId) -> Vec<EventStatus> {
        self.events
            .iter()
            .filter(|e| e.stage == stage)
            .map(|e| e.status)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub out_dir: PathBuf,
    pub items: Vec<ItemReport>,
    pub aggregate: Vec<StageEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_error: Option<String>,
}

impl RunSummary {
    pub fn item(&self, id: &str) -> Option<&ItemReport> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn failed_items(&self) -> Vec<&ItemReport> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect()
    }

    /// Number of stage executions across the run, cached stages excluded.
    pub fn executed_count(&self) -> usize {
        self.items
            .iter()
            .flat_map(|i| i.events.iter())
            .chain(self.aggregate.iter())
            .filter(|e| matches!(e.status, EventStatus::Executed | EventStatus::Recovered | EventStatus::Failed))
            .count()
    }

    /// 0 when nothing failed, 2 when an item or the run-wide stage failed.
    pub fn exit_code(&self) -> i32 {
        if self.failed_items().is_empty() && self.aggregate_error.is_none() {
            0
        } else {
            2
        }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PipelineError::IOError(format!("cannot serialize run report: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn log(&self) {
        let completed = self.items.iter().filter(|i| i.status == ItemStatus::Completed).count();
        let incomplete: Vec<&ItemReport> = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Incomplete)
            .collect();
        let failed = self.failed_items();

        info!(
            "Summary: {} samples, {} completed, {} incomplete, {} failed",
            self.items.len(),
            completed,
            incomplete.len(),
            failed.len()
        );
        for item in incomplete {
            warn!("  {} incomplete: {}", item.id, item.error.as_deref().unwrap_or("unknown reason"));
        }
        for item in failed {
            error!("  {} failed: {}", item.id, item.error.as_deref().unwrap_or("unknown error"));
        }
        if let Some(e) = &self.aggregate_error {
            error!("  quality assessment: {}", e);
        }
    }
}

pub fn timestamp() -> String {
    Local::now().to_rfc3339()
}
