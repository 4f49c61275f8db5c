//! Annotation runner: executes one job end to end.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, error, info, instrument, warn};

use annotator_core::{Clock, DomainError, JobId, JobStatus, JobUpdate, ObjectKey};
use annotator_events::{ChannelError, CompletionEvent, EventPublisher};
use annotator_infra::{JobRecordStore, ObjectStore, RecordStoreError, StorageError, ThreadLauncher};

use crate::dispatcher::AnnotationTask;

/// Local files produced by an annotator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationOutput {
    pub result: PathBuf,
    pub log: PathBuf,
}

impl AnnotationOutput {
    /// Output locations for `input`: `<stem>.annot.vcf` and `<input>.count.log`
    /// next to the input.
    pub fn for_input(input: &Path) -> Self {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name.strip_suffix(".vcf").unwrap_or(&name);
        Self {
            result: input.with_file_name(format!("{stem}.annot.vcf")),
            log: input.with_file_name(format!("{name}.count.log")),
        }
    }
}

/// Produces annotated output for an input file.
pub trait Annotator: Send + Sync {
    fn annotate(&self, input: &Path) -> Result<AnnotationOutput, RunError>;
}

/// Runs an external annotator program as `<program> [args..] <input>` in the
/// input's directory and expects the standard output files afterwards.
#[derive(Debug, Clone)]
pub struct CommandAnnotator {
    program: String,
    args: Vec<String>,
}

impl CommandAnnotator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// From a program-plus-arguments list; `None` when empty.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }
}

impl Annotator for CommandAnnotator {
    fn annotate(&self, input: &Path) -> Result<AnnotationOutput, RunError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(input);
        if let Some(dir) = input.parent() {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .map_err(|e| RunError::Annotator(format!("failed to start {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RunError::Annotator(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let expected = AnnotationOutput::for_input(input);
        for path in [&expected.result, &expected.log] {
            if !path.is_file() {
                return Err(RunError::Annotator(format!(
                    "{} did not produce {}",
                    self.program,
                    path.display()
                )));
            }
        }
        Ok(expected)
    }
}

/// Built-in annotator for local runs: tags the VCF header and counts records.
#[derive(Debug, Clone, Default)]
pub struct CountingAnnotator;

impl Annotator for CountingAnnotator {
    fn annotate(&self, input: &Path) -> Result<AnnotationOutput, RunError> {
        let content = fs::read_to_string(input).map_err(|e| RunError::io(input, e))?;
        let output = AnnotationOutput::for_input(input);

        let mut annotated = String::with_capacity(content.len() + 64);
        let mut tagged = false;
        let mut records = 0usize;
        for line in content.lines() {
            if !tagged && !line.starts_with("##") {
                annotated.push_str("##annotation=annotator-counting\n");
                tagged = true;
            }
            if !line.starts_with('#') && !line.trim().is_empty() {
                records += 1;
            }
            annotated.push_str(line);
            annotated.push('\n');
        }
        if !tagged {
            annotated.push_str("##annotation=annotator-counting\n");
        }

        fs::write(&output.result, annotated).map_err(|e| RunError::io(&output.result, e))?;
        fs::write(&output.log, format!("records\t{records}\n")).map_err(|e| RunError::io(&output.log, e))?;
        Ok(output)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("annotator failed: {0}")]
    Annotator(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("invalid output key: {0}")]
    Key(#[source] DomainError),

    #[error("failed to upload {key}: {source}")]
    Upload {
        key: ObjectKey,
        #[source]
        source: StorageError,
    },

    #[error("failed to record completion: {0}")]
    Record(#[source] RecordStoreError),

    #[error("failed to publish completion: {0}")]
    Publish(#[source] ChannelError),
}

impl RunError {
    pub fn io(path: &Path, err: io::Error) -> Self {
        RunError::Io(format!("{}: {err}", path.display()))
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub job_id: JobId,
    pub result_ref: ObjectKey,
    pub log_ref: ObjectKey,
    pub complete_time: DateTime<Utc>,
}

/// C2: annotate, upload, mark COMPLETED, notify, clean up.
pub struct Runner {
    records: Arc<dyn JobRecordStore>,
    results: Arc<dyn ObjectStore>,
    completions: Arc<dyn EventPublisher<CompletionEvent>>,
    annotator: Arc<dyn Annotator>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl Runner {
    pub fn new(
        records: Arc<dyn JobRecordStore>,
        results: Arc<dyn ObjectStore>,
        completions: Arc<dyn EventPublisher<CompletionEvent>>,
        annotator: Arc<dyn Annotator>,
        clock: Arc<dyn Clock>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            records,
            results,
            completions,
            annotator,
            clock,
            key_prefix: key_prefix.into(),
        }
    }

    /// Launcher that runs each task on a detached thread with this runner.
    pub fn into_launcher(self) -> ThreadLauncher<impl Fn(AnnotationTask) + Send + Sync + 'static> {
        let runner = Arc::new(self);
        ThreadLauncher::new("annotation-runner", move |task: AnnotationTask| {
            if let Err(err) = runner.run(&task) {
                error!(job_id = %task.job_id, error = %err, "annotation run failed");
            }
        })
    }

    #[instrument(skip(self, task), fields(job_id = %task.job_id))]
    pub fn run(&self, task: &AnnotationTask) -> Result<RunReport, RunError> {
        let output = self.annotator.annotate(&task.input_path)?;

        let result_ref = self.upload(task, &output.result)?;
        let log_ref = self.upload(task, &output.log)?;

        let complete_time = self.clock.now().trunc_subsecs(0);
        let update = JobUpdate::new()
            .result_ref(result_ref.clone())
            .log_ref(log_ref.clone())
            .complete_time(complete_time)
            .status(JobStatus::Completed);
        self.records
            .update(task.job_id, &update, None)
            .map_err(RunError::Record)?;

        let event = CompletionEvent {
            job_id: task.job_id,
            s3_key_result_file: result_ref.clone(),
            user_id: task.user.user_id.clone(),
            complete_time,
            user_email: task.user.user_email.clone(),
            user_name: task.user.user_name.clone(),
        };
        self.completions.publish(&event).map_err(RunError::Publish)?;
        info!(result = %result_ref, "job completed");

        cleanup(task, &output);

        Ok(RunReport {
            job_id: task.job_id,
            result_ref,
            log_ref,
            complete_time,
        })
    }

    fn upload(&self, task: &AnnotationTask, path: &Path) -> Result<ObjectKey, RunError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RunError::Io(format!("{} has no file name", path.display())))?;
        let key = ObjectKey::for_user(&self.key_prefix, &task.user.user_id, &file_name).map_err(RunError::Key)?;

        let size = self
            .results
            .upload_from(path, &key)
            .map_err(|source| RunError::Upload {
                key: key.clone(),
                source,
            })?;
        debug!(key = %key, size, "uploaded");
        Ok(key)
    }
}

/// Remove the job's local files and its working directory; failures are
/// logged only.
fn cleanup(task: &AnnotationTask, output: &AnnotationOutput) {
    for path in [&task.input_path, &output.result, &output.log] {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to remove local file");
        }
    }
    if let Err(err) = fs::remove_dir(&task.work_dir) {
        warn!(path = %task.work_dir.display(), error = %err, "failed to remove working directory");
    }
}
