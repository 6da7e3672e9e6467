//! Background job registry.
//!
//! Jobs stream interleaved stdout/stderr into a sliding byte window: the
//! most recent 1 MiB is retained and the head is dropped on overflow.
//! Consumers poll with a byte offset into the conceptual full stream and
//! advance it by the returned total size, so successive polls never
//! overlap. Completed jobs linger for an hour before the sweeper removes
//! them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::terminate_child;
use crate::config::ShellProfile;
use crate::sanitize::sanitize_io_error;

pub const MAX_JOB_OUTPUT: usize = 1024 * 1024;
pub const DEFAULT_MAX_JOBS: usize = 20;

const SWEEP_PERIOD: Duration = Duration::from_secs(10 * 60);
const COMPLETED_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Error)]
pub enum JobError {
    #[error("Job registry is full ({max} jobs); delete finished jobs first")]
    RegistryFull { max: usize },

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' is still running; terminate it first")]
    StillRunning(String),

    #[error("Job '{0}' is not running")]
    NotRunning(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub shell: String,
    pub command: String,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// One poll of a job's output window.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutput {
    pub output: String,
    /// Cumulative bytes ever produced; pass back as the next offset.
    pub total_size: usize,
    /// True once the job has left `running`: no more output will arrive.
    pub complete: bool,
}

/// Sliding byte window. `dropped` counts head bytes discarded on overflow,
/// keeping offsets into the conceptual full stream meaningful.
struct OutputRing {
    buf: Vec<u8>,
    dropped: usize,
    capacity: usize,
}

impl OutputRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::new(),
            dropped: 0,
            capacity,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.capacity {
            let excess = self.buf.len() - self.capacity;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn total(&self) -> usize {
        self.dropped + self.buf.len()
    }

    /// Bytes from `offset` (full-stream coordinates) to the end of the
    /// window. Offsets below the window clamp to its start.
    fn since(&self, offset: usize) -> &[u8] {
        let start = offset.saturating_sub(self.dropped).min(self.buf.len());
        &self.buf[start..]
    }
}

enum StopReason {
    Timeout { after: Duration },
    Terminate,
}

struct Job {
    record: JobRecord,
    output: OutputRing,
    stop: Option<mpsc::Sender<StopReason>>,
}

type JobMap = Arc<Mutex<HashMap<String, Job>>>;

#[derive(Clone)]
pub struct JobRegistry {
    jobs: JobMap,
    next_id: Arc<AtomicU64>,
    max_jobs: usize,
}

impl JobRegistry {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_jobs,
        }
    }

    /// Spawn a background job. When the registry is full, expired finished
    /// jobs are collected first; a registry still full after that refuses.
    ///
    /// A spawn failure still yields a job id: the record is inserted as
    /// `failed` with synthetic exit -1 and the sanitized cause in its
    /// output, so pollers observe the failure the same way as any exit.
    pub async fn start(
        &self,
        shell_name: &str,
        profile: &ShellProfile,
        command: &str,
        working_dir: PathBuf,
        env: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<String, JobError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() >= self.max_jobs {
            Self::collect_expired(&mut jobs);
        }
        if jobs.len() >= self.max_jobs {
            return Err(JobError::RegistryFull { max: self.max_jobs });
        }

        let id = format!("job_{}", self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut cmd = Command::new(&profile.command);
        cmd.args(&profile.args)
            .arg(command)
            .current_dir(&working_dir)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut record = JobRecord {
            id: id.clone(),
            shell: shell_name.to_string(),
            command: command.to_string(),
            status: JobStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            pid: None,
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                record.status = JobStatus::Failed;
                record.exit_code = Some(-1);
                record.end_time = Some(Utc::now());
                let mut output = OutputRing::new(MAX_JOB_OUTPUT);
                output.push(format!("Failed to start job: {}\n", sanitize_io_error(&err)).as_bytes());
                jobs.insert(
                    id.clone(),
                    Job {
                        record,
                        output,
                        stop: None,
                    },
                );
                return Ok(id);
            }
        };

        record.pid = child.id();
        let (stop_tx, mut stop_rx) = mpsc::channel::<StopReason>(1);

        jobs.insert(
            id.clone(),
            Job {
                record,
                output: OutputRing::new(MAX_JOB_OUTPUT),
                stop: Some(stop_tx.clone()),
            },
        );
        drop(jobs);

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = spawn_reader(Arc::clone(&self.jobs), id.clone(), stdout_pipe);
        let stderr_reader = spawn_reader(Arc::clone(&self.jobs), id.clone(), stderr_pipe);

        // Per-job timeout timer; a no-op if the job finishes first.
        let timer_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if stop_tx.try_send(StopReason::Timeout { after: timeout }).is_ok() {
                trace!(job = %timer_id, "timeout timer fired");
            }
        });

        // Monitor owns the child: races exit against stop requests, drains
        // the readers, then finalizes the record exactly once.
        let jobs = Arc::clone(&self.jobs);
        let monitor_id = id.clone();
        tokio::spawn(async move {
            enum Ending {
                Exited(std::io::Result<std::process::ExitStatus>),
                Stopped(StopReason),
            }
            // Resolve the race first; the losing future is dropped before
            // the child handle is touched again.
            let ending = tokio::select! {
                status = child.wait() => Ending::Exited(status),
                Some(reason) = stop_rx.recv() => Ending::Stopped(reason),
            };

            let (status, marker, exit_code) = match ending {
                Ending::Exited(Ok(status)) => {
                    let code = status.code().unwrap_or(-1);
                    let status = if code == 0 {
                        JobStatus::Completed
                    } else {
                        JobStatus::Failed
                    };
                    (status, None, Some(code))
                }
                Ending::Exited(Err(err)) => (
                    JobStatus::Failed,
                    Some(format!("\n[Job wait failed: {}]\n", sanitize_io_error(&err))),
                    Some(-1),
                ),
                Ending::Stopped(reason) => {
                    terminate_child(&mut child).await;
                    match reason {
                        StopReason::Timeout { after } => (
                            JobStatus::Timeout,
                            Some(format!(
                                "\n[Job timed out after {} seconds]\n",
                                after.as_secs()
                            )),
                            None,
                        ),
                        StopReason::Terminate => (
                            JobStatus::Failed,
                            Some("\n[Job terminated by request]\n".to_string()),
                            Some(-1),
                        ),
                    }
                }
            };

            let _ = stdout_reader.await;
            let _ = stderr_reader.await;

            let mut jobs = jobs.lock().await;
            if let Some(job) = jobs.get_mut(&monitor_id) {
                if let Some(marker) = &marker {
                    job.output.push(marker.as_bytes());
                }
                job.record.status = status;
                job.record.exit_code = exit_code;
                job.record.end_time = Some(Utc::now());
                job.stop = None;
            }
            debug!(job = %monitor_id, status = ?status, "job finished");
        });

        Ok(id)
    }

    pub async fn output(&self, id: &str, offset: usize) -> Result<JobOutput, JobError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(JobOutput {
            output: String::from_utf8_lossy(job.output.since(offset)).into_owned(),
            total_size: job.output.total(),
            complete: job.record.status != JobStatus::Running,
        })
    }

    pub async fn terminate(&self, id: &str) -> Result<(), JobError> {
        let jobs = self.jobs.lock().await;
        let job = jobs.get(id).ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if job.record.status != JobStatus::Running {
            return Err(JobError::NotRunning(id.to_string()));
        }
        if let Some(stop) = &job.stop {
            let _ = stop.try_send(StopReason::Terminate);
        }
        Ok(())
    }

    /// Remove a finished job. Running jobs must be terminated first.
    pub async fn delete(&self, id: &str) -> Result<JobRecord, JobError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(id) {
            None => Err(JobError::NotFound(id.to_string())),
            Some(job) if job.record.status == JobStatus::Running => {
                Err(JobError::StillRunning(id.to_string()))
            }
            Some(_) => {
                let job = jobs
                    .remove(id)
                    .ok_or_else(|| JobError::NotFound(id.to_string()))?;
                Ok(job.record)
            }
        }
    }

    pub async fn list(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<_> = jobs.values().map(|job| job.record.clone()).collect();
        records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        records
    }

    pub async fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().await.get(id).map(|job| job.record.clone())
    }

    fn collect_expired(jobs: &mut HashMap<String, Job>) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(COMPLETED_RETENTION).unwrap_or(chrono::Duration::hours(1));
        jobs.retain(|_, job| {
            job.record.status == JobStatus::Running
                || job.record.end_time.is_none_or(|end| end > cutoff)
        });
    }

    /// Periodic sweeper for completed jobs older than the retention window.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        let mut jobs = jobs.lock().await;
                        let before = jobs.len();
                        Self::collect_expired(&mut jobs);
                        if before != jobs.len() {
                            debug!(removed = before - jobs.len(), "job sweeper collected finished jobs");
                        }
                    }
                }
            }
        })
    }
}

fn spawn_reader<R>(
    jobs: JobMap,
    id: String,
    pipe: Option<R>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = vec![0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut jobs = jobs.lock().await;
                    if let Some(job) = jobs.get_mut(&id) {
                        job.output.push(&chunk[..n]);
                    } else {
                        break;
                    }
                }
            }
        }
    })
}
