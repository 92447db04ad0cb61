//! Transactional in-memory persistence for the jobs domain
//!
//! Single source of truth for jobs, tasks, event logs, assets and projects.
//! A reader-writer lock guards the whole store: reads take the shared lock,
//! mutations take the exclusive lock, and no lock is ever held across an
//! await point. `append_job_event` assigns a totally ordered, gap-free `seq`
//! per job; `replace_job_tasks` swaps the whole task slice atomically so
//! readers see either the old or the new set.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use uuid::Uuid;

use storyreel_common::{Error, Result};
use storyreel_provider::AssetType;

use crate::domain::entities::{Asset, Job, JobEventRecord, JobTask, NewJobEvent, Project};

#[derive(Default)]
struct StoreInner {
    projects: HashMap<Uuid, Project>,

    jobs: HashMap<Uuid, Job>,
    tasks_by_job: HashMap<Uuid, Vec<JobTask>>,
    events_by_job: HashMap<Uuid, Vec<JobEventRecord>>,
    event_seq_by_job: HashMap<Uuid, i64>,
    /// (user_id, idempotency_key) -> job_id
    idempotency_to_job: HashMap<(Uuid, String), Uuid>,

    assets: HashMap<Uuid, Asset>,
}

/// In-memory store backing the job engine
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn create_project(&self, project: Project) -> Result<Project> {
        let mut inner = self.inner.write().unwrap();
        if inner.projects.contains_key(&project.id) {
            return Err(Error::Conflict(format!("project {} already exists", project.id)));
        }
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    pub fn get_project(&self, project_id: Uuid) -> Result<Project> {
        let inner = self.inner.read().unwrap();
        inner
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))
    }

    pub fn update_project(&self, project: Project) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.projects.contains_key(&project.id) {
            return Err(Error::NotFound(format!("project {}", project.id)));
        }
        inner.projects.insert(project.id, project);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Jobs & tasks
    // ------------------------------------------------------------------

    /// Insert a job with its tasks and a fresh event log.
    ///
    /// If `(user_id, idempotency_key)` already maps to a job, the existing
    /// job is returned unchanged and nothing is inserted; callers detect the
    /// hit by comparing ids. Check and insert happen under one write lock, so
    /// concurrent creates with the same key collapse to a single job.
    pub fn create_job(
        &self,
        job: Job,
        tasks: Vec<JobTask>,
        idempotency_key: Option<&str>,
    ) -> Result<Job> {
        let mut inner = self.inner.write().unwrap();
        if let Some(key) = idempotency_key.filter(|k| !k.is_empty()) {
            let index_key = (job.user_id, key.to_string());
            if let Some(existing_id) = inner.idempotency_to_job.get(&index_key) {
                return inner
                    .jobs
                    .get(existing_id)
                    .cloned()
                    .ok_or_else(|| Error::Internal("idempotency index points at missing job".into()));
            }
            inner.idempotency_to_job.insert(index_key, job.id);
        }
        inner.tasks_by_job.insert(job.id, tasks);
        inner.events_by_job.insert(job.id, Vec::new());
        inner.event_seq_by_job.insert(job.id, 0);
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get_job_by_idempotency(&self, user_id: Uuid, key: &str) -> Option<Job> {
        if key.is_empty() {
            return None;
        }
        let inner = self.inner.read().unwrap();
        let job_id = inner.idempotency_to_job.get(&(user_id, key.to_string()))?;
        inner.jobs.get(job_id).cloned()
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Job> {
        let inner = self.inner.read().unwrap();
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    pub fn update_job(&self, job: Job) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.jobs.contains_key(&job.id) {
            return Err(Error::NotFound(format!("job {}", job.id)));
        }
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn get_job_tasks(&self, job_id: Uuid) -> Result<Vec<JobTask>> {
        let inner = self.inner.read().unwrap();
        inner
            .tasks_by_job
            .get(&job_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    /// Atomic whole-slice replace of a job's tasks
    pub fn replace_job_tasks(&self, job_id: Uuid, tasks: Vec<JobTask>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.tasks_by_job.contains_key(&job_id) {
            return Err(Error::NotFound(format!("job {job_id}")));
        }
        inner.tasks_by_job.insert(job_id, tasks);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Append an event, assigning `seq = previous + 1` and a fresh event id.
    /// Fails only if the job does not exist.
    pub fn append_job_event(&self, job_id: Uuid, event: NewJobEvent) -> Result<JobEventRecord> {
        let mut inner = self.inner.write().unwrap();
        if !inner.jobs.contains_key(&job_id) {
            return Err(Error::NotFound(format!("job {job_id}")));
        }
        let seq = inner.event_seq_by_job.get(&job_id).copied().unwrap_or(0) + 1;
        inner.event_seq_by_job.insert(job_id, seq);
        let record = JobEventRecord {
            event_id: Uuid::new_v4(),
            seq,
            trace_id: event.trace_id,
            job_id,
            project_id: event.project_id,
            event_type: event.event_type,
            ts: Utc::now(),
            payload: event.payload,
        };
        inner.events_by_job.entry(job_id).or_default().push(record.clone());
        Ok(record)
    }

    /// All events with `seq > from_seq`; `from_seq <= 0` returns everything
    pub fn list_job_events_from_seq(
        &self,
        job_id: Uuid,
        from_seq: i64,
    ) -> Result<Vec<JobEventRecord>> {
        let inner = self.inner.read().unwrap();
        let events = inner
            .events_by_job
            .get(&job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if from_seq <= 0 {
            return Ok(events.clone());
        }
        Ok(events.iter().filter(|e| e.seq > from_seq).cloned().collect())
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    pub fn create_asset(&self, asset: Asset) -> Result<Asset> {
        let mut inner = self.inner.write().unwrap();
        if inner.assets.contains_key(&asset.id) {
            return Err(Error::Conflict(format!("asset {} already exists", asset.id)));
        }
        inner.assets.insert(asset.id, asset.clone());
        Ok(asset)
    }

    pub fn get_asset(&self, asset_id: Uuid) -> Result<Asset> {
        let inner = self.inner.read().unwrap();
        inner
            .assets
            .get(&asset_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("asset {asset_id}")))
    }

    /// List a user's assets, newest first, optionally filtered by project
    /// and type. Returns the page plus the total match count.
    pub fn list_assets(
        &self,
        user_id: Uuid,
        project_id: Option<Uuid>,
        asset_type: Option<AssetType>,
        page: usize,
        page_size: usize,
    ) -> (Vec<Asset>, usize) {
        let page = page.max(1);
        let page_size = if page_size >= 1 { page_size } else { 20 };

        let inner = self.inner.read().unwrap();
        let mut items: Vec<Asset> = inner
            .assets
            .values()
            .filter(|a| a.user_id == user_id)
            .filter(|a| project_id.map_or(true, |p| a.project_id == p))
            .filter(|a| asset_type.map_or(true, |t| a.asset_type == t))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = items.len();
        let start = (page - 1) * page_size;
        if start >= total {
            return (Vec::new(), total);
        }
        let end = (start + page_size).min(total);
        (items[start..end].to_vec(), total)
    }
}
