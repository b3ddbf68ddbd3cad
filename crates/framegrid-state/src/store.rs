//! StateStore: redb-backed persistence for framegrid.
//!
//! Provides typed CRUD operations over clusters, render jobs and render
//! tasks. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record helpers ─────────────────────────────────────

    fn put_records<'a, T, I>(&self, table: Table, records: I) -> StateResult<usize>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (&'a str, &'a T)>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut written = 0;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            for (key, record) in records {
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                t.insert(key, value.as_slice()).map_err(map_err!(Write))?;
                written += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(written)
    }

    fn get_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn list_records<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    fn delete_record(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster together with its nodes.
    pub fn put_cluster(&self, cluster: &Cluster) -> StateResult<()> {
        self.put_records(CLUSTERS, [(cluster.id.as_str(), cluster)])?;
        debug!(cluster_id = %cluster.id, nodes = cluster.nodes.len(), "cluster stored");
        Ok(())
    }

    /// Get a cluster by ID.
    pub fn get_cluster(&self, cluster_id: &str) -> StateResult<Option<Cluster>> {
        self.get_record(CLUSTERS, cluster_id)
    }

    /// List all clusters, ordered by ID.
    pub fn list_clusters(&self) -> StateResult<Vec<Cluster>> {
        self.list_records(CLUSTERS)
    }

    /// Delete a cluster by ID. Returns true if it existed.
    pub fn delete_cluster(&self, cluster_id: &str) -> StateResult<bool> {
        let existed = self.delete_record(CLUSTERS, cluster_id)?;
        debug!(%cluster_id, existed, "cluster deleted");
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a render job.
    pub fn put_job(&self, job: &RenderJob) -> StateResult<()> {
        self.put_records(JOBS, [(job.id.as_str(), job)])?;
        Ok(())
    }

    /// Get a render job by ID.
    pub fn get_job(&self, job_id: &str) -> StateResult<Option<RenderJob>> {
        self.get_record(JOBS, job_id)
    }

    /// List all render jobs.
    pub fn list_jobs(&self) -> StateResult<Vec<RenderJob>> {
        self.list_records(JOBS)
    }

    /// Delete a render job by ID. Returns true if it existed.
    pub fn delete_job(&self, job_id: &str) -> StateResult<bool> {
        self.delete_record(JOBS, job_id)
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Insert or update a render task.
    pub fn put_task(&self, task: &RenderTask) -> StateResult<()> {
        self.put_records(TASKS, [(task.id.as_str(), task)])?;
        Ok(())
    }

    /// Insert or update several tasks in a single transaction.
    pub fn put_tasks(&self, tasks: &[RenderTask]) -> StateResult<usize> {
        self.put_records(TASKS, tasks.iter().map(|t| (t.id.as_str(), t)))
    }

    /// Get a render task by ID.
    pub fn get_task(&self, task_id: &str) -> StateResult<Option<RenderTask>> {
        self.get_record(TASKS, task_id)
    }

    /// List all render tasks.
    pub fn list_tasks(&self) -> StateResult<Vec<RenderTask>> {
        self.list_records(TASKS)
    }

    /// List the tasks belonging to a job.
    pub fn list_tasks_for_job(&self, job_id: &str) -> StateResult<Vec<RenderTask>> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.job_id == job_id)
            .collect())
    }

    /// Delete a render task by ID. Returns true if it existed.
    pub fn delete_task(&self, task_id: &str) -> StateResult<bool> {
        self.delete_record(TASKS, task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            location: "eu-west-1".to_string(),
            status: NodeStatus::Online,
            capabilities: NodeCapabilities {
                cpu_cores: 16,
                gpu_count: 1,
                gpu_memory_gb: 24,
                ram_gb: 64,
                storage_gb: 500,
                supported_codecs: vec!["h264".to_string(), "h265".to_string()],
                max_resolution: Resolution::UHD,
                specializations: vec![Specialization::GpuAcceleration],
            },
            current_load: 0,
            max_load: 4,
            performance: NodePerformance::default(),
            usage: NodeUsage::default(),
            last_heartbeat: 1000,
            task_queue: vec![],
        }
    }

    fn test_cluster(id: &str) -> Cluster {
        let mut cluster = Cluster::new(id, format!("{id}-name"), "eu-west-1");
        cluster.nodes.push(test_node(&format!("{id}-n1")));
        cluster
    }

    fn test_job(id: &str) -> RenderJob {
        RenderJob {
            id: id.to_string(),
            name: "deck".to_string(),
            project_id: "proj-1".to_string(),
            status: JobStatus::Queued,
            task_ids: vec![],
            total_frames: 300,
            completed_frames: 0,
            progress: 0.0,
            estimated_completion: None,
            cost: JobCost::default(),
            priority: TaskPriority::Normal,
            created_at: 1000,
            started_at: None,
            completed_at: None,
        }
    }

    fn test_task(id: &str, job_id: &str) -> RenderTask {
        RenderTask {
            id: id.to_string(),
            job_id: job_id.to_string(),
            project_id: "proj-1".to_string(),
            task_type: TaskType::VideoRender,
            priority: TaskPriority::Normal,
            status: TaskStatus::Queued,
            frame_range: FrameRange { start: 0, end: 299 },
            settings: RenderSettings::default(),
            requirements: TaskRequirements::default(),
            target_cluster: None,
            assigned_node: None,
            assigned_cluster: None,
            progress: 0.0,
            created_at: 1000,
            started_at: None,
            completed_at: None,
            estimated_duration_ms: 30_000,
            actual_duration_ms: None,
            retry_count: 0,
            max_retries: 3,
            dependencies: vec![],
            outputs: vec![],
            metadata: TaskMetadata::default(),
            error: None,
            cost: 0.0,
        }
    }

    // ── Cluster CRUD ───────────────────────────────────────────────

    #[test]
    fn cluster_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = test_cluster("c1");

        store.put_cluster(&cluster).unwrap();
        let retrieved = store.get_cluster("c1").unwrap();

        assert_eq!(retrieved, Some(cluster));
    }

    #[test]
    fn cluster_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut cluster = test_cluster("c1");
        store.put_cluster(&cluster).unwrap();

        cluster.nodes[0].current_load = 3;
        cluster.autoscaling.max_nodes = 20;
        store.put_cluster(&cluster).unwrap();

        let retrieved = store.get_cluster("c1").unwrap().unwrap();
        assert_eq!(retrieved.nodes[0].current_load, 3);
        assert_eq!(retrieved.autoscaling.max_nodes, 20);
        assert_eq!(store.list_clusters().unwrap().len(), 1);
    }

    #[test]
    fn cluster_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_cluster(&test_cluster("c1")).unwrap();

        assert!(store.delete_cluster("c1").unwrap());
        assert!(!store.delete_cluster("c1").unwrap());
        assert!(store.get_cluster("c1").unwrap().is_none());
    }

    // ── Job / task CRUD ────────────────────────────────────────────

    #[test]
    fn job_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let job = test_job("job-1");

        store.put_job(&job).unwrap();
        assert_eq!(store.get_job("job-1").unwrap(), Some(job));
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn tasks_batch_insert_and_list_for_job() {
        let store = StateStore::open_in_memory().unwrap();
        let tasks = vec![
            test_task("t1", "job-1"),
            test_task("t2", "job-1"),
            test_task("t3", "job-2"),
        ];

        assert_eq!(store.put_tasks(&tasks).unwrap(), 3);
        assert_eq!(store.list_tasks_for_job("job-1").unwrap().len(), 2);
        assert_eq!(store.list_tasks_for_job("job-2").unwrap().len(), 1);
        assert_eq!(store.get_task("t3").unwrap(), Some(tasks[2].clone()));
    }

    #[test]
    fn task_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_task(&test_task("t1", "job-1")).unwrap();

        assert!(store.delete_task("t1").unwrap());
        assert!(store.get_task("t1").unwrap().is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_cluster(&test_cluster("c1")).unwrap();
            store.put_task(&test_task("t1", "job-1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let cluster = store.get_cluster("c1").unwrap();
        assert_eq!(cluster.unwrap().nodes.len(), 1);
        assert!(store.get_task("t1").unwrap().is_some());
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_clusters().unwrap().is_empty());
        assert!(store.list_jobs().unwrap().is_empty());
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.list_tasks_for_job("any").unwrap().is_empty());
        assert!(!store.delete_cluster("nope").unwrap());
        assert!(!store.delete_job("nope").unwrap());
        assert!(!store.delete_task("nope").unwrap());
    }
}
