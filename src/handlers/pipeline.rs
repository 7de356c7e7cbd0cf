//! On-the-fly processing pipeline launch.
//!
//! The pipeline is started from a workflow template with the acquisition
//! parameters as `key=value` arguments. The child runs detached from the
//! handler: its exit is only logged.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{info, warn};

use crate::coordinator::{JsonMap, SessionRecord};
use crate::error::{ConfigError, TaskError};

/// Pipeline installation, from the coordinator's named config section.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Launcher executable.
    pub scipion_path: String,
    /// Directory holding one project per session.
    pub scipion_user_data_path: String,
}

impl PipelineConfig {
    pub fn from_section(section: &str, values: JsonMap) -> Result<Self, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(values)).map_err(|e| {
            ConfigError::ParseError {
                section: section.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Where the project for `session_name` is created.
    pub fn project_path(&self, session_name: &str) -> String {
        format!(
            "{}/{}",
            self.scipion_user_data_path.trim_end_matches('/'),
            session_name
        )
    }
}

/// A fully resolved pipeline command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub project_path: String,
}

impl PipelineLaunch {
    /// Build the launch for `session` from a workflow template.
    ///
    /// Acquisition parameters that are not recorded are left out.
    pub fn scipion(
        config: &PipelineConfig,
        template: &str,
        session: &SessionRecord,
        raw_path: &str,
    ) -> Self {
        let acq = &session.acquisition;
        let mut args = vec![
            "template".to_string(),
            template.to_string(),
            format!("project_name={}", session.name),
            format!("moviesPath={raw_path}"),
        ];

        if let Some(pattern) = acq.images_pattern.as_deref() {
            args.push(format!("filesPattern={pattern}"));
        }
        let numeric = [
            ("voltage", acq.voltage),
            ("spherical", acq.cs),
            ("magnification", acq.magnification),
            ("sampling", acq.pixel_size),
            ("dosePerFrame", acq.dose),
        ];
        for (key, value) in numeric {
            if let Some(value) = value {
                args.push(format!("{key}={value}"));
            }
        }
        if let Some(gain) = find_gain_file(Path::new(raw_path)) {
            args.push(format!("gainPath={}", gain.display()));
        }

        Self {
            program: config.scipion_path.clone(),
            args,
            project_path: config.project_path(&session.name),
        }
    }

    /// Start the pipeline without waiting for it. Returns the child's pid.
    pub fn spawn(&self) -> Result<Option<u32>, TaskError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TaskError::Pipeline(format!("failed to start {}: {e}", self.program)))?;

        let pid = child.id();
        info!(program = %self.program, pid, project = %self.project_path, "Pipeline launched");

        let program = self.program.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => info!(program = %program, "Pipeline exited"),
                Ok(status) => warn!(program = %program, %status, "Pipeline exited with failure"),
                Err(e) => warn!(program = %program, error = %e, "Lost track of pipeline process"),
            }
        });

        Ok(pid)
    }
}

/// First `*.gain` file directly inside `dir`, by name.
fn find_gain_file(dir: &Path) -> Option<PathBuf> {
    let mut gains: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "gain"))
        .collect();
    gains.sort();
    gains.into_iter().next()
}
