use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{bail, Context, Error};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use hostutils::{checksum, files};

const TEMP_PREFIX: &str = ".tmp-";
const MANIFEST_NAME: &str = "manifest.json";
const DATA_DIR: &str = "data";

/// Persisted description of one backup: which absolute paths were captured,
/// where they live inside the backup tree, and the MD5 of every file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: String,
    pub job_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// The captured paths, in declaration order. Source `i` is stored under
    /// `data/<i>` inside the backup directory.
    pub sources: Vec<PathBuf>,
    /// Backup-relative path -> MD5, for every regular file captured.
    pub checksums: BTreeMap<String, String>,
}

static BACKUP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Owns `<base>/backups/`. Backups are assembled under a `.tmp-<id>`
/// directory and renamed into place only once every file and the manifest
/// have landed, so a crash can never leave a half backup addressable.
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    /// Open the backup store, creating it if needed and removing any partial
    /// temp directory a previous crash left behind.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        files::create_dirs(&root)?;
        for entry in fs::read_dir(&root).context("Failed to read backup store")? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(TEMP_PREFIX)
            {
                warn!(
                    "Removing partial backup left by a previous run: {}",
                    entry.path().display()
                );
                files::remove_path_if_exists(&entry.path())?;
            }
        }
        Ok(Self { root })
    }

    /// Capture `sources` into a new backup and return its record.
    pub fn create(
        &self,
        job_id: &str,
        name: &str,
        sources: &[PathBuf],
    ) -> Result<BackupRecord, Error> {
        let id = format!(
            "{name}-{}-{}",
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            BACKUP_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let staging = self.root.join(format!("{TEMP_PREFIX}{id}"));
        files::create_dirs(&staging)?;

        let result = self.assemble(&staging, &id, job_id, name, sources);
        if result.is_err() {
            let _ = files::remove_path_if_exists(&staging);
        }
        let record = result?;

        fs::rename(&staging, self.backup_dir(&id))
            .context("Failed to move assembled backup into place")?;
        files::fsync_dir(&self.root)?;
        info!("Created backup '{id}' ({} sources)", sources.len());
        Ok(record)
    }

    fn assemble(
        &self,
        staging: &Path,
        id: &str,
        job_id: &str,
        name: &str,
        sources: &[PathBuf],
    ) -> Result<BackupRecord, Error> {
        for (index, source) in sources.iter().enumerate() {
            let target = staging.join(DATA_DIR).join(index.to_string());
            if source.is_dir() {
                files::copy_tree(source, &target)?;
            } else if source.is_file() {
                if let Some(parent) = target.parent() {
                    files::create_dirs(parent)?;
                }
                fs::copy(source, &target).context(format!(
                    "Failed to capture {} into backup",
                    source.display()
                ))?;
            } else {
                bail!("Backup source does not exist: {}", source.display());
            }
        }

        let mut checksums = BTreeMap::new();
        for file in files::list_files(staging)? {
            checksums.insert(
                file.display().to_string(),
                checksum::file_md5(&staging.join(&file))?,
            );
        }

        let record = BackupRecord {
            id: id.to_string(),
            job_id: job_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            sources: sources.to_vec(),
            checksums,
        };
        files::atomic_write(
            &staging.join(MANIFEST_NAME),
            &serde_json::to_vec_pretty(&record).context("Failed to serialize backup manifest")?,
        )?;
        Ok(record)
    }

    fn backup_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// All finalized backups, oldest first.
    pub fn list(&self) -> Result<Vec<BackupRecord>, Error> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root).context("Failed to read backup store")? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(TEMP_PREFIX) || !entry.path().is_dir() {
                continue;
            }
            let manifest = entry.path().join(MANIFEST_NAME);
            match fs::read_to_string(&manifest) {
                Ok(contents) => records.push(
                    serde_json::from_str(&contents)
                        .context(format!("Failed to parse {}", manifest.display()))?,
                ),
                Err(e) => warn!("Skipping unreadable backup '{file_name}': {e}"),
            }
        }
        records.sort_by(|a: &BackupRecord, b: &BackupRecord| {
            a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// The most recent backup across all jobs.
    pub fn latest(&self) -> Result<Option<BackupRecord>, Error> {
        Ok(self.list()?.pop())
    }

    /// The most recent backup of the given job.
    pub fn latest_for_job(&self, job_id: &str) -> Result<Option<BackupRecord>, Error> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.job_id == job_id)
            .next_back())
    }

    /// Resolve a backup by id or by name, preferring the most recent match.
    pub fn find(&self, name: &str) -> Result<Option<BackupRecord>, Error> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.id == name || record.name == name)
            .next_back())
    }

    /// Copy a backup's contents back to the recorded source paths. Every file
    /// is MD5-verified against the backup manifest before it is written, and
    /// each write is atomic.
    pub fn restore(&self, record: &BackupRecord) -> Result<(), Error> {
        let backup_dir = self.backup_dir(&record.id);
        if !backup_dir.is_dir() {
            bail!("Backup '{}' is missing from the store", record.id);
        }

        for (index, source) in record.sources.iter().enumerate() {
            let stored = backup_dir.join(DATA_DIR).join(index.to_string());
            if stored.is_dir() {
                for file in files::list_files(&stored)? {
                    let from = stored.join(&file);
                    self.verify_stored_file(record, &backup_dir, &from)?;
                    files::atomic_copy(&from, &source.join(&file))?;
                }
            } else {
                self.verify_stored_file(record, &backup_dir, &stored)?;
                files::atomic_copy(&stored, source)?;
            }
            debug!("Restored {}", source.display());
        }
        Ok(())
    }

    fn verify_stored_file(
        &self,
        record: &BackupRecord,
        backup_dir: &Path,
        stored: &Path,
    ) -> Result<(), Error> {
        let relative = stored
            .strip_prefix(backup_dir)
            .context("Stored file escapes the backup directory")?
            .display()
            .to_string();
        let expected = record
            .checksums
            .get(&relative)
            .with_context(|| format!("Backup manifest has no checksum for '{relative}'"))?;
        let found = checksum::file_md5(stored)?;
        if &found != expected {
            bail!(
                "Backup file '{relative}' is corrupt: expected MD5 {expected}, found {found}"
            );
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), Error> {
        files::remove_path_if_exists(&self.backup_dir(id))
    }

    /// Apply the retention policy: keep the `keep_last_n` newest backups,
    /// regardless of job. Zero keeps everything. Returns the removed ids.
    pub fn prune(&self, keep_last_n: usize) -> Result<Vec<String>, Error> {
        if keep_last_n == 0 {
            return Ok(Vec::new());
        }
        let mut records = self.list()?;
        records.reverse(); // newest first
        let mut removed = Vec::new();
        for record in records.into_iter().skip(keep_last_n) {
            self.delete(&record.id)?;
            removed.push(record.id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    struct Fixture {
        _base: TempDir,
        manager: BackupManager,
        source_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let base = TempDir::new().unwrap();
        let manager = BackupManager::open(base.path().join("backups")).unwrap();
        let source_dir = base.path().join("etc");
        fs::create_dir_all(&source_dir).unwrap();
        Fixture {
            _base: base,
            manager,
            source_dir,
        }
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let fx = fixture();
        let file = fx.source_dir.join("app.conf");
        fs::write(&file, "v1\n").unwrap();

        let record = fx
            .manager
            .create("job-1", "pre-rollout", &[file.clone()])
            .unwrap();
        assert_eq!(record.job_id, "job-1");
        assert_eq!(record.checksums.len(), 1);

        // Mutate, then restore bit-identically.
        fs::write(&file, "v2 broken\n").unwrap();
        fx.manager.restore(&record).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "v1\n");
    }

    #[test]
    fn test_backup_restore_directory_tree() {
        let fx = fixture();
        let tree = fx.source_dir.join("conf.d");
        fs::create_dir_all(tree.join("nested")).unwrap();
        fs::write(tree.join("a.conf"), "a").unwrap();
        fs::write(tree.join("nested/b.conf"), "b").unwrap();

        let record = fx.manager.create("job-1", "tree", &[tree.clone()]).unwrap();

        fs::write(tree.join("a.conf"), "changed").unwrap();
        fs::remove_file(tree.join("nested/b.conf")).unwrap();

        fx.manager.restore(&record).unwrap();
        assert_eq!(fs::read_to_string(tree.join("a.conf")).unwrap(), "a");
        assert_eq!(fs::read_to_string(tree.join("nested/b.conf")).unwrap(), "b");
    }

    #[test]
    fn test_restore_detects_corrupt_backup() {
        let fx = fixture();
        let file = fx.source_dir.join("app.conf");
        fs::write(&file, "v1\n").unwrap();
        let record = fx.manager.create("job-1", "b", &[file.clone()]).unwrap();

        // Corrupt the stored copy behind the manager's back.
        let stored = fx.manager.backup_dir(&record.id).join("data/0");
        fs::write(&stored, "tampered").unwrap();

        fx.manager.restore(&record).unwrap_err();
    }

    #[test]
    fn test_missing_source_fails_and_leaves_no_partial() {
        let fx = fixture();
        fx.manager
            .create("job-1", "bad", &[fx.source_dir.join("absent")])
            .unwrap_err();
        assert!(fx.manager.list().unwrap().is_empty());
        // No temp directory left behind either.
        let leftovers: Vec<_> = fs::read_dir(&fx.manager.root).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_latest_spans_jobs_and_find_by_name() {
        let fx = fixture();
        let file = fx.source_dir.join("f");
        fs::write(&file, "x").unwrap();

        fx.manager.create("job-1", "first", &[file.clone()]).unwrap();
        let second = fx.manager.create("job-2", "second", &[file.clone()]).unwrap();

        assert_eq!(fx.manager.latest().unwrap().unwrap().id, second.id);
        assert_eq!(
            fx.manager.find("first").unwrap().unwrap().job_id,
            "job-1"
        );
        assert!(fx.manager.find("nope").unwrap().is_none());
        assert_eq!(
            fx.manager.latest_for_job("job-1").unwrap().unwrap().name,
            "first"
        );
    }

    #[test]
    fn test_prune_retention() {
        let fx = fixture();
        let file = fx.source_dir.join("f");
        fs::write(&file, "x").unwrap();

        for i in 0..4 {
            fx.manager
                .create("job-1", &format!("b{i}"), &[file.clone()])
                .unwrap();
        }

        // Zero keeps everything.
        assert!(fx.manager.prune(0).unwrap().is_empty());
        assert_eq!(fx.manager.list().unwrap().len(), 4);

        let removed = fx.manager.prune(2).unwrap();
        assert_eq!(removed.len(), 2);
        let remaining = fx.manager.list().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].name, "b2");
        assert_eq!(remaining[1].name, "b3");
    }

    #[test]
    fn test_open_collects_stale_temp_dirs() {
        let base = TempDir::new().unwrap();
        let root = base.path().join("backups");
        fs::create_dir_all(root.join(".tmp-crashed")).unwrap();
        fs::write(root.join(".tmp-crashed/partial"), "x").unwrap();

        let manager = BackupManager::open(&root).unwrap();
        assert!(!root.join(".tmp-crashed").exists());
        assert!(manager.list().unwrap().is_empty());
    }
}
