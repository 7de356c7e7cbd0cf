//! Session task handler: `monitor`, `otf` and `archive` actions.
//!
//! Session updates are read-modify-write on one `extra` sub-section at a
//! time: fetch the current record, merge, push the sub-section back. Two
//! tasks racing on the same sub-section are last-writer-wins.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::StoreConfig;
use crate::coordinator::{OtfWorkflow, SectionName, SessionRecord, Task, TaskUpdate};
use crate::error::{TaskError, TransferError};
use crate::handlers::pipeline::{PipelineConfig, PipelineLaunch};
use crate::handlers::{Flow, HandlerDeps, HandlerKind, TaskHandler, TaskReporter};
use crate::scan::FileScanner;
use crate::transfer::{TransferReport, TransferStore};

/// Action carried in a session task's `args.action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Monitor,
    Otf,
    Archive,
}

impl SessionAction {
    pub fn parse(raw: &str) -> Result<Self, TaskError> {
        match raw {
            "monitor" => Ok(Self::Monitor),
            "otf" => Ok(Self::Otf),
            "archive" | "copy_to_irods" => Ok(Self::Archive),
            other => Err(TaskError::UnknownAction(other.to_string())),
        }
    }
}

pub struct SessionHandler {
    task: Task,
    action: String,
    session: SessionRecord,
    deps: HandlerDeps,
    reporter: TaskReporter,
    scanner: Option<FileScanner>,
}

impl SessionHandler {
    /// Resolve the task's session. The action is only checked on `process()`.
    pub async fn new(
        task: Task,
        deps: HandlerDeps,
        reporter: TaskReporter,
    ) -> Result<Self, TaskError> {
        let raw_id = task.require_arg("session_id")?;
        let session_id: i64 = raw_id
            .trim()
            .parse()
            .map_err(|e| TaskError::InvalidArgument {
                task_id: task.id.clone(),
                name: "session_id".to_string(),
                reason: format!("{raw_id:?}: {e}"),
            })?;
        let action = task.arg_str("action").unwrap_or_default();

        info!(task_id = %task.id, session_id, action = %action, "Retrieving session");
        let session = deps.records.get_session(session_id).await?;

        Ok(Self {
            task,
            action,
            session,
            deps,
            reporter,
            scanner: None,
        })
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    async fn refresh(&mut self) -> Result<(), TaskError> {
        self.session = self.deps.records.get_session(self.session.id).await?;
        Ok(())
    }

    fn raw_path(&self) -> Result<String, TaskError> {
        self.session
            .raw_data_path()
            .ok_or_else(|| TaskError::InvalidArgument {
                task_id: self.task.id.clone(),
                name: "acquisition.raw_path".to_string(),
                reason: format!("session {} has no raw data path", self.session.id),
            })
    }

    async fn monitor(&mut self, count: u32) -> Result<Flow, TaskError> {
        let raw_path = self.raw_path()?;
        // an unrepresentable end means the horizon is never reached
        let monitor_until = self
            .session
            .start
            .checked_add_signed(self.deps.config.monitor_horizon);
        info!(session_id = self.session.id, path = %raw_path, "Monitoring files");

        let mut scanner = match self.scanner.take() {
            Some(scanner) if count > 1 => scanner,
            _ => FileScanner::new().with_pattern(self.session.acquisition.images_pattern.as_deref()),
        };
        let scan_root = raw_path.clone();
        let (scanner, info) = tokio::task::spawn_blocking(move || {
            scanner.scan(Path::new(&scan_root));
            let info = scanner.info();
            (scanner, info)
        })
        .await
        .map_err(|e| TaskError::Panicked(format!("file scan: {e}")))?;
        self.scanner = Some(scanner);

        self.refresh().await?;
        let mut raw = self.session.extra.raw.clone();
        raw.merge(info.to_map());
        raw.set_path(raw_path);
        self.deps
            .records
            .update_session_extra(self.session.id, SectionName::Raw, &raw)
            .await?;
        self.session.extra.raw = raw;

        let mut update = TaskUpdate::new().extend(info.summary()).with("count", count);
        let flow = if monitor_until.is_some_and(|until| Utc::now() > until) {
            info!(session_id = self.session.id, "Monitoring horizon reached");
            update = update.done();
            Flow::Stop
        } else {
            Flow::Continue
        };
        self.reporter.report(update).await?;
        Ok(flow)
    }

    async fn otf(&mut self, count: u32) -> Result<Flow, TaskError> {
        let raw_path = self.raw_path()?;
        let mut otf = self.session.extra.otf.clone();

        match otf.otf_workflow() {
            Some(OtfWorkflow::Scipion) => {}
            Some(OtfWorkflow::Unsupported(name)) => {
                return Err(TaskError::Pipeline(format!(
                    "unsupported on-the-fly workflow '{name}'"
                )));
            }
            None => {
                return Err(TaskError::Pipeline(
                    "no on-the-fly workflow configured for session".to_string(),
                ));
            }
        }

        let template = otf
            .get_str("scipion_workflow")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| TaskError::Pipeline("no workflow template configured".to_string()))?
            .to_string();

        let section = &self.deps.config.pipeline_section;
        let values = self.deps.records.get_config(section).await?;
        let config = PipelineConfig::from_section(section, values)?;

        let launch = PipelineLaunch::scipion(&config, &template, &self.session, &raw_path);
        launch.spawn()?;

        otf.set("status", "created");
        otf.set_path(launch.project_path.clone());
        self.deps
            .records
            .update_session_extra(self.session.id, SectionName::Otf, &otf)
            .await?;
        self.session.extra.otf = otf;

        self.reporter
            .report(
                TaskUpdate::new()
                    .with("otf_path", launch.project_path)
                    .with("otf_status", "created")
                    .with("count", count)
                    .done(),
            )
            .await?;
        Ok(Flow::Stop)
    }

    async fn archive(&mut self) -> Result<Flow, TaskError> {
        self.refresh().await?;

        let section = &self.deps.config.store_section;
        let values = self.deps.records.get_config(section).await?;
        let store_config = StoreConfig::from_section(section, values)?;
        let connector = self
            .deps
            .connectors
            .connector(&store_config)
            .map_err(|source| TransferError::Store {
                collection: store_config.parent_collection.clone(),
                source,
            })?;
        let transfer = TransferStore::new(store_config, connector);

        let mut update = TaskUpdate::new();
        let mut failures = Vec::new();

        for name in SectionName::ALL {
            let archived = match self.archive_section(&transfer, name).await {
                Ok(Some(report)) => {
                    update = update
                        .with(&format!("{name}_uploaded"), report.uploaded)
                        .with(&format!("{name}_failed"), report.failed.len());
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    error!(session_id = self.session.id, section = %name, error = %e, "Archive failed");
                    failures.push(format!("{name}: {e}"));
                    false
                }
            };
            update = update.with(&format!("{name}_archived"), archived);
        }

        if !failures.is_empty() {
            update = update.error(failures.join("; "));
        }
        self.reporter.report(update.done()).await?;
        Ok(Flow::Stop)
    }

    /// Copy one sub-section's data. `None` when the section has no path.
    async fn archive_section(
        &mut self,
        transfer: &TransferStore,
        name: SectionName,
    ) -> Result<Option<TransferReport>, TaskError> {
        let section = self.session.extra.section(name);
        let Some(path) = section.path().map(str::to_string) else {
            return Ok(None);
        };
        let create_ticket = !section.has_retrieval();
        info!(
            session_id = self.session.id,
            section = %name,
            path = %path,
            create_ticket,
            "Archiving"
        );

        let collection = format!("{}_{}", self.session.name, name);
        let info = transfer
            .copy_tree(&collection, Path::new(&path), create_ticket)
            .await?;
        if !info.report.is_complete() {
            warn!(
                section = %name,
                failed = info.report.failed.len(),
                "Archive finished with failed files"
            );
        }

        if let Some(scripts) = &info.retrieval {
            self.refresh().await?;
            let mut fresh = self.session.extra.section(name).clone();
            fresh.set_retrieval(&scripts.linux, &scripts.windows);
            self.deps
                .records
                .update_session_extra(self.session.id, name, &fresh)
                .await?;
            *self.session.extra.section_mut(name) = fresh;
        }

        Ok(Some(info.report))
    }
}

#[async_trait]
impl TaskHandler for SessionHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Session
    }

    fn task(&self) -> &Task {
        &self.task
    }

    async fn process(&mut self, count: u32) -> Result<Flow, TaskError> {
        match SessionAction::parse(&self.action)? {
            SessionAction::Monitor => self.monitor(count).await,
            SessionAction::Otf => self.otf(count).await,
            SessionAction::Archive => self.archive().await,
        }
    }
}
