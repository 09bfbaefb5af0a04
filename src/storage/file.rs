//! JSON Lines file driver.
//!
//! Each queue lives in `<path>/<queue>.jsonl`, one job record per line.
//! Dead-letter entries live in `<dead_letter_path>/<queue>.jsonl`. Every
//! mutation rewrites the affected file through a temporary file and a rename,
//! so a crash leaves either the old or the new contents on disk.
//!
//! All operations on one driver instance are serialized by an async mutex.
//! Two driver instances (or processes) pointed at the same directory are not
//! coordinated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    DriverStats, FileConfig, PushOutcome, StorageDriver, StorageError, ensure_held,
    reservation_deadline,
};
use crate::core::{DeadLetterEntry, Job};

const EXTENSION: &str = "jsonl";

/// Driver persisting queues as JSON Lines files
#[derive(Debug)]
pub struct FileDriver {
    root: PathBuf,
    dead_root: PathBuf,
    // Guards every read-modify-write; holds the last assigned sequence
    sequence: Mutex<u64>,
}

impl FileDriver {
    /// Open (creating if needed) the directories named by `config`.
    pub async fn open(config: FileConfig) -> Result<Self, StorageError> {
        let root = config.path.clone();
        let dead_root = config.dead_letter_dir();

        fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;
        fs::create_dir_all(&dead_root)
            .await
            .map_err(|e| StorageError::io(&dead_root, e))?;

        let driver = Self {
            root,
            dead_root,
            sequence: Mutex::new(0),
        };

        let mut last = 0;
        for queue in driver.queue_names().await? {
            for job in driver.read_queue(&queue).await? {
                last = last.max(job.sequence);
            }
        }
        *driver.sequence.lock().await = last;

        debug!(
            "Opened file driver at {} (last sequence {})",
            driver.root.display(),
            last
        );
        Ok(driver)
    }

    /// Directory holding queue files
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn queue_file(dir: &Path, queue: &str) -> Result<PathBuf, StorageError> {
        let valid = !queue.is_empty()
            && !queue.starts_with('.')
            && queue
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::configuration(format!(
                "queue name '{}' cannot be used as a file name",
                queue
            )));
        }
        Ok(dir.join(format!("{}.{}", queue, EXTENSION)))
    }

    async fn list_names(dir: &Path) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| StorageError::io(dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn queue_names(&self) -> Result<Vec<String>, StorageError> {
        Self::list_names(&self.root).await
    }

    async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(path, e)),
        };

        let mut records = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn trailing line from a crash mid-append is skipped
                    warn!(
                        "Skipping unreadable record at {}:{}: {}",
                        path.display(),
                        number + 1,
                        e
                    );
                }
            }
        }
        Ok(records)
    }

    async fn write_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StorageError> {
        if records.is_empty() {
            return match fs::remove_file(path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::io(path, e)),
            };
        }

        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }

        let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::io(path, e))
    }

    async fn read_queue(&self, queue: &str) -> Result<Vec<Job>, StorageError> {
        Self::read_lines(&Self::queue_file(&self.root, queue)?).await
    }

    async fn write_queue(&self, queue: &str, jobs: &[Job]) -> Result<(), StorageError> {
        Self::write_lines(&Self::queue_file(&self.root, queue)?, jobs).await
    }

    async fn read_dead(&self, queue: &str) -> Result<Vec<DeadLetterEntry>, StorageError> {
        Self::read_lines(&Self::queue_file(&self.dead_root, queue)?).await
    }

    async fn write_dead(&self, queue: &str, entries: &[DeadLetterEntry]) -> Result<(), StorageError> {
        Self::write_lines(&Self::queue_file(&self.dead_root, queue)?, entries).await
    }

    /// Find the queue holding `job_id` and load it.
    async fn locate(&self, job_id: &str) -> Result<Option<(String, Vec<Job>, usize)>, StorageError> {
        for queue in self.queue_names().await? {
            let jobs = self.read_queue(&queue).await?;
            if let Some(index) = jobs.iter().position(|job| job.id == job_id) {
                return Ok(Some((queue, jobs, index)));
            }
        }
        Ok(None)
    }

    /// Like `locate`, but only while `job` still holds its reservation.
    async fn locate_held(&self, job: &Job) -> Result<(String, Vec<Job>, usize), StorageError> {
        let now = Utc::now();
        let (queue, jobs, index) = self
            .locate(&job.id)
            .await?
            .ok_or_else(|| StorageError::job_not_found(&job.id))?;
        ensure_held(&jobs[index], job, now)?;
        Ok((queue, jobs, index))
    }

    async fn locate_dead(
        &self,
        job_id: &str,
    ) -> Result<Option<(String, Vec<DeadLetterEntry>, usize)>, StorageError> {
        for queue in Self::list_names(&self.dead_root).await? {
            let entries = self.read_dead(&queue).await?;
            if let Some(index) = entries.iter().position(|entry| entry.id() == job_id) {
                return Ok(Some((queue, entries, index)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl StorageDriver for FileDriver {
    fn name(&self) -> &str {
        "file"
    }

    async fn push(&self, mut job: Job) -> Result<PushOutcome, StorageError> {
        let mut sequence = self.sequence.lock().await;
        let mut jobs = self.read_queue(&job.queue).await?;

        job.sequence = *sequence + 1;
        job.clear_reservation();
        let queue = job.queue.clone();
        jobs.push(job);

        self.write_queue(&queue, &jobs).await?;
        *sequence += 1;
        Ok(PushOutcome::Queued)
    }

    async fn reserve(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Job>, StorageError> {
        let _guard = self.sequence.lock().await;
        let now = Utc::now();
        let until = reservation_deadline(now, visibility_timeout)?;
        let mut jobs = self.read_queue(queue).await?;

        let best = jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.is_eligible(now))
            .min_by(|(_, a), (_, b)| a.reservation_order(b))
            .map(|(index, _)| index);

        let Some(index) = best else {
            return Ok(None);
        };

        jobs[index]
            .mark_reserved(until)
            .map_err(|e| StorageError::operation_failed("reserve", e.to_string()))?;
        let reserved = jobs[index].clone();
        self.write_queue(queue, &jobs).await?;

        Ok(Some(reserved))
    }

    async fn ack(&self, job: &Job) -> Result<(), StorageError> {
        let _guard = self.sequence.lock().await;
        let (queue, mut jobs, index) = self.locate_held(job).await?;

        jobs.remove(index);
        self.write_queue(&queue, &jobs).await
    }

    async fn release(
        &self,
        job: &Job,
        available_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<(), StorageError> {
        let _guard = self.sequence.lock().await;
        let (queue, mut jobs, index) = self.locate_held(job).await?;

        let stored = &mut jobs[index];
        stored
            .mark_released(available_at)
            .map_err(|e| StorageError::operation_failed("release", e.to_string()))?;
        if let Some(error) = last_error {
            stored.last_error = Some(error.to_string());
        }

        self.write_queue(&queue, &jobs).await
    }

    async fn move_to_dlq(
        &self,
        job: &Job,
        reason: &str,
    ) -> Result<DeadLetterEntry, StorageError> {
        let _guard = self.sequence.lock().await;
        let (queue, mut jobs, index) = self.locate_held(job).await?;

        let entry = DeadLetterEntry::new(job, reason);
        let mut dead = self.read_dead(entry.queue()).await?;
        dead.push(entry.clone());

        // Write the DLQ first: a crash in between duplicates rather than loses
        self.write_dead(entry.queue(), &dead).await?;
        jobs.remove(index);
        self.write_queue(&queue, &jobs).await?;

        Ok(entry)
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        let _guard = self.sequence.lock().await;
        Ok(self
            .locate(job_id)
            .await?
            .map(|(_, mut jobs, index)| jobs.swap_remove(index)))
    }

    async fn stats(&self, queue: &str) -> Result<DriverStats, StorageError> {
        let _guard = self.sequence.lock().await;
        let now = Utc::now();
        let mut stats = DriverStats::default();

        for job in self.read_queue(queue).await? {
            if job.is_reserved_at(now) {
                stats.reserved += 1;
            } else {
                stats.pending += 1;
            }
        }
        stats.dead_letter_count = self.read_dead(queue).await?.len();

        Ok(stats)
    }

    async fn clear(&self, queue: &str) -> Result<usize, StorageError> {
        let _guard = self.sequence.lock().await;
        let removed = self.read_queue(queue).await?.len();
        self.write_queue(queue, &[]).await?;
        Ok(removed)
    }

    async fn add_dead(&self, entry: DeadLetterEntry) -> Result<(), StorageError> {
        let _guard = self.sequence.lock().await;
        let queue = entry.queue().to_string();
        let mut dead = self.read_dead(&queue).await?;
        dead.retain(|existing| existing.id() != entry.id());
        dead.push(entry);
        self.write_dead(&queue, &dead).await
    }

    async fn list_dead(&self, queue: Option<&str>) -> Result<Vec<DeadLetterEntry>, StorageError> {
        let _guard = self.sequence.lock().await;
        let queues = match queue {
            Some(queue) => vec![queue.to_string()],
            None => Self::list_names(&self.dead_root).await?,
        };

        let mut entries = Vec::new();
        for queue in queues {
            entries.extend(self.read_dead(&queue).await?);
        }
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(entries)
    }

    async fn get_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        let _guard = self.sequence.lock().await;
        Ok(self
            .locate_dead(job_id)
            .await?
            .map(|(_, mut entries, index)| entries.swap_remove(index)))
    }

    async fn remove_dead(&self, job_id: &str) -> Result<Option<DeadLetterEntry>, StorageError> {
        let _guard = self.sequence.lock().await;
        let Some((queue, mut entries, index)) = self.locate_dead(job_id).await? else {
            return Ok(None);
        };

        let entry = entries.remove(index);
        self.write_dead(&queue, &entries).await?;
        Ok(Some(entry))
    }
}
