//! Runs the whole pipeline in one process and annotates the files given on
//! the command line.
//!
//! Inputs and results live under `ANNOTATOR_DATA_DIR`; cold storage is in
//! memory, so archives do not outlive the process.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use annotator_core::{JobId, JobStatus, SubscriptionTier, SystemClock, UserId, UserIdentity};
use annotator_infra::{
    FsObjectStore, InMemoryColdStorage, JobRecordStore, PipelineConfig, PollWorker, ProfileDirectory,
    RetrievalLatency, WorkerHandle,
};
use annotator_pipeline::{Annotator, CommandAnnotator, CountingAnnotator, LocalPipeline};

const USER_VAR: &str = "ANNOTATOR_USER";
const RUN_TIMEOUT: Duration = Duration::from_secs(600);

fn main() -> anyhow::Result<()> {
    annotator_observability::init();

    let files: Vec<String> = std::env::args().skip(1).collect();
    if files.is_empty() {
        bail!("usage: annotator-node <input.vcf>...");
    }

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let clock = Arc::new(SystemClock);
    let objects = Arc::new(FsObjectStore::new(&config.data_dir).context("failed to open data directory")?);
    let vault = Arc::new(InMemoryColdStorage::new(clock.clone(), RetrievalLatency::default()));
    let pipeline = LocalPipeline::new(config, clock, objects, vault);

    let command = pipeline
        .config
        .annotator_cmd
        .as_deref()
        .and_then(CommandAnnotator::from_parts);
    let annotator: Arc<dyn Annotator> = match command {
        Some(cmd) => Arc::new(cmd),
        None => Arc::new(CountingAnnotator),
    };
    let launcher = Arc::new(pipeline.runner(annotator).into_launcher());

    let wait = pipeline.config.poll_wait;
    let workers = vec![
        PollWorker::spawn(pipeline.dispatcher(launcher), wait)?,
        PollWorker::spawn(pipeline.archive_worker(), wait)?,
        PollWorker::spawn(pipeline.restore_initiator(), wait)?,
        PollWorker::spawn(pipeline.thaw_worker(), wait)?,
    ];

    let user_id = UserId::new(std::env::var(USER_VAR).unwrap_or_else(|_| "local".to_string()))?;
    pipeline.profiles.set_tier(&user_id, SubscriptionTier::Free)?;
    let user = UserIdentity {
        user_id: user_id.clone(),
        user_name: user_id.to_string(),
        user_email: format!("{user_id}@localhost"),
    };

    let intake = pipeline.intake();
    let mut jobs = Vec::with_capacity(files.len());
    for file in &files {
        let path = Path::new(file);
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {file}"))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("not a file name: {file}"))?;
        let record = intake.submit_job(&user, name, &bytes)?;
        jobs.push(record.job_id);
    }

    let outcome = wait_for_completion(pipeline.records.as_ref(), &jobs);
    shutdown(workers);
    outcome?;

    for job_id in jobs {
        if let Some(record) = pipeline.records.get(job_id)? {
            if let Some(result) = record.result_ref {
                tracing::info!(%job_id, result = %result, "job completed");
            }
        }
    }
    Ok(())
}

fn wait_for_completion(records: &dyn JobRecordStore, jobs: &[JobId]) -> anyhow::Result<()> {
    let started = Instant::now();
    loop {
        let mut done = 0;
        for job_id in jobs {
            let record = records.get(*job_id)?.with_context(|| format!("job {job_id} vanished"))?;
            if record.status == JobStatus::Completed {
                done += 1;
            }
        }
        if done == jobs.len() {
            return Ok(());
        }
        if started.elapsed() > RUN_TIMEOUT {
            bail!("{} of {} jobs still unfinished after {:?}", jobs.len() - done, jobs.len(), RUN_TIMEOUT);
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn shutdown(workers: Vec<WorkerHandle>) {
    for worker in workers {
        let name = worker.name();
        let stats = worker.shutdown();
        tracing::info!(
            worker = name,
            polls = stats.polls,
            processed = stats.processed,
            failed = stats.failed,
            poisoned = stats.poisoned,
            "worker stopped"
        );
    }
}
