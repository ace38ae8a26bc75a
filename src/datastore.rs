use std::{fs, path::PathBuf};

use anyhow::{Context, Error};
use log::warn;

use hostutils::files;
use updater_api::job::Job;

/// Persists job records under `state/jobs/`, one JSON file per job.
///
/// Every write goes through a temp file, fsync and rename, so the record on
/// disk is always parseable and always reflects a step boundary.
pub struct Datastore {
    jobs_dir: PathBuf,
}

impl Datastore {
    pub fn open(jobs_dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let jobs_dir = jobs_dir.into();
        files::create_dirs(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    fn job_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{job_id}.json"))
    }

    /// Persist the job record. This is the engine's checkpoint primitive.
    pub fn save_job(&self, job: &Job) -> Result<(), Error> {
        let contents =
            serde_json::to_vec_pretty(job).context("Failed to serialize job record")?;
        files::atomic_write(&self.job_path(&job.job_id), &contents)?;
        files::fsync_dir(&self.jobs_dir)?;
        Ok(())
    }

    pub fn load_job(&self, job_id: &str) -> Result<Job, Error> {
        let path = self.job_path(job_id);
        let contents =
            fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents).context(format!("Failed to parse {}", path.display()))
    }

    /// All job records, oldest first. Unparseable files are skipped with a
    /// warning rather than failing the listing.
    pub fn list_jobs(&self) -> Result<Vec<Job>, Error> {
        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.jobs_dir).context("Failed to read jobs directory")? {
            let entry = entry?;
            if entry.path().extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(entry.path())
                .map_err(Error::from)
                .and_then(|contents| serde_json::from_str::<Job>(&contents).map_err(Error::from))
            {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(
                    "Skipping unreadable job record {}: {e}",
                    entry.path().display()
                ),
            }
        }
        jobs.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(jobs)
    }

    /// Jobs that never reached a terminal status, i.e. were interrupted.
    pub fn non_terminal_jobs(&self) -> Result<Vec<Job>, Error> {
        Ok(self
            .list_jobs()?
            .into_iter()
            .filter(|job| !job.is_terminal())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use updater_api::job::{FailureKind, JobStatus};

    use super::*;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = Datastore::open(dir.path().join("jobs")).unwrap();

        let mut job = Job::new("roundtrip", 3, true);
        job.status = JobStatus::Running;
        job.push_log("starting", 100);
        store.save_job(&job).unwrap();

        let loaded = store.load_job(&job.job_id).unwrap();
        assert_eq!(loaded, job);
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = TempDir::new().unwrap();
        let store = Datastore::open(dir.path().join("jobs")).unwrap();

        let mut job = Job::new("checkpointing", 2, false);
        store.save_job(&job).unwrap();

        job.progress.completed_actions = 1;
        job.status = JobStatus::Running;
        store.save_job(&job).unwrap();

        let loaded = store.load_job(&job.job_id).unwrap();
        assert_eq!(loaded.progress.completed_actions, 1);

        // Exactly one file per job.
        assert_eq!(fs::read_dir(dir.path().join("jobs")).unwrap().count(), 1);
    }

    #[test]
    fn test_list_and_non_terminal() {
        let dir = TempDir::new().unwrap();
        let store = Datastore::open(dir.path().join("jobs")).unwrap();

        let mut done = Job::new("done", 0, false);
        done.status = JobStatus::Completed;
        store.save_job(&done).unwrap();

        let mut interrupted = Job::new("interrupted", 2, true);
        interrupted.status = JobStatus::Running;
        store.save_job(&interrupted).unwrap();

        let mut failed = Job::new("failed", 1, false);
        failed.status = JobStatus::Failed;
        failed.fail(FailureKind::ActionFailed, "boom", Some(0));
        store.save_job(&failed).unwrap();

        assert_eq!(store.list_jobs().unwrap().len(), 3);

        let non_terminal = store.non_terminal_jobs().unwrap();
        assert_eq!(non_terminal.len(), 1);
        assert_eq!(non_terminal[0].job_id, interrupted.job_id);
    }

    #[test]
    fn test_unreadable_record_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = Datastore::open(dir.path().join("jobs")).unwrap();
        fs::write(dir.path().join("jobs/garbage.json"), "{not json").unwrap();

        let job = Job::new("ok", 0, false);
        store.save_job(&job).unwrap();
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }
}
