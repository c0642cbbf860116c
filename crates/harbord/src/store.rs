//! SQLite-backed control-plane store.
//!
//! Holds clusters, nodes, backups, restore jobs, trusted host keys, and the
//! task outbox. Progress and status writes are single short statements so a
//! poller observing state sees live updates mid-task. Rows that trigger
//! background work are inserted in the same transaction as their outbox task,
//! so a task can never observe a not-yet-visible record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use harbor_common::model::{
    Backup, BackupOrigin, BackupStatus, BackupStep, BackupType, Cluster, ClusterStatus, Node,
    NodeSize, NodeStatus, PostgresVersion, RestoreJob, RestoreStatus, RestoreType, Role,
    TrustedHostKey,
};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// A unit of background work, released only after its triggering write
/// committed.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub kind: TaskKind,
    pub entity_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    ProvisionCluster,
    TeardownCluster,
    RunBackup,
    RunRestore,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ProvisionCluster => "PROVISION_CLUSTER",
            TaskKind::TeardownCluster => "TEARDOWN_CLUSTER",
            TaskKind::RunBackup => "RUN_BACKUP",
            TaskKind::RunRestore => "RUN_RESTORE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROVISION_CLUSTER" => Some(TaskKind::ProvisionCluster),
            "TEARDOWN_CLUSTER" => Some(TaskKind::TeardownCluster),
            "RUN_BACKUP" => Some(TaskKind::RunBackup),
            "RUN_RESTORE" => Some(TaskKind::RunRestore),
            _ => None,
        }
    }
}

/// SQLite-backed store. Safe to share behind an `Arc`; the connection is
/// guarded by a mutex and every call holds it only for one short statement.
pub struct Store {
    conn: Mutex<Connection>,
}

fn conv_err(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conv_err(idx, e.to_string()))
}

fn get_opt_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Ok(Some(
            Uuid::parse_str(&s).map_err(|e| conv_err(idx, e.to_string()))?,
        )),
        None => Ok(None),
    }
}

fn get_enum<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    parse(&s).ok_or_else(|| conv_err(idx, format!("unrecognized value: {}", s)))
}

fn get_opt_enum<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Ok(Some(
            parse(&s).ok_or_else(|| conv_err(idx, format!("unrecognized value: {}", s)))?,
        )),
        None => Ok(None),
    }
}

const CLUSTER_COLS: &str = "id, slug, name, owner_id, status, node_count, node_size, region, \
     postgres_version, hostname, port, admin_password, provisioning_step, \
     provisioning_progress, error_message, created_at, updated_at";

const NODE_COLS: &str = "id, cluster_id, name, public_ip, private_ip, status, provider_id, \
     role_hint, created_at";

const BACKUP_COLS: &str = "id, cluster_id, origin, requested_type, backup_type, status, step, \
     progress, label, size_bytes, wal_start, wal_stop, recovery_window_start, \
     recovery_window_stop, expires_at, error_message, created_at, completed_at";

const RESTORE_COLS: &str = "id, cluster_id, target_cluster_id, backup_id, restore_type, \
     target_time, status, step, progress, error_message, created_at";

fn map_cluster(row: &Row<'_>) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        id: get_uuid(row, 0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        owner_id: get_uuid(row, 3)?,
        status: get_enum(row, 4, ClusterStatus::parse)?,
        node_count: row.get::<_, i64>(5)? as u32,
        node_size: get_enum(row, 6, NodeSize::parse)?,
        region: row.get(7)?,
        postgres_version: get_enum(row, 8, PostgresVersion::parse)?,
        hostname: row.get(9)?,
        port: row.get::<_, i64>(10)? as u16,
        admin_password: row.get(11)?,
        provisioning_step: row.get(12)?,
        provisioning_progress: row.get::<_, i64>(13)? as u8,
        error_message: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn map_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: get_uuid(row, 0)?,
        cluster_id: get_uuid(row, 1)?,
        name: row.get(2)?,
        public_ip: row.get(3)?,
        private_ip: row.get(4)?,
        status: get_enum(row, 5, NodeStatus::parse)?,
        provider_id: row.get(6)?,
        role_hint: get_opt_enum(row, 7, |s| match s {
            "leader" => Some(Role::Leader),
            "replica" => Some(Role::Replica),
            "unknown" => Some(Role::Unknown),
            _ => None,
        })?,
        created_at: row.get(8)?,
    })
}

fn map_backup(row: &Row<'_>) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: get_uuid(row, 0)?,
        cluster_id: get_uuid(row, 1)?,
        origin: get_enum(row, 2, BackupOrigin::parse)?,
        requested_type: get_opt_enum(row, 3, BackupType::parse)?,
        backup_type: get_opt_enum(row, 4, BackupType::parse)?,
        status: get_enum(row, 5, BackupStatus::parse)?,
        step: get_opt_enum(row, 6, |s| match s {
            "preparing" => Some(BackupStep::Preparing),
            "transferring" => Some(BackupStep::Transferring),
            "uploading" => Some(BackupStep::Uploading),
            "verifying" => Some(BackupStep::Verifying),
            _ => None,
        })?,
        progress: row.get::<_, i64>(7)? as u8,
        label: row.get(8)?,
        size_bytes: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        wal_start: row.get(10)?,
        wal_stop: row.get(11)?,
        recovery_window_start: row.get(12)?,
        recovery_window_stop: row.get(13)?,
        expires_at: row.get(14)?,
        error_message: row.get(15)?,
        created_at: row.get(16)?,
        completed_at: row.get(17)?,
    })
}

fn map_restore(row: &Row<'_>) -> rusqlite::Result<RestoreJob> {
    Ok(RestoreJob {
        id: get_uuid(row, 0)?,
        cluster_id: get_uuid(row, 1)?,
        target_cluster_id: get_opt_uuid(row, 2)?,
        backup_id: get_uuid(row, 3)?,
        restore_type: get_enum(row, 4, RestoreType::parse)?,
        target_time: row.get(5)?,
        status: get_enum(row, 6, RestoreStatus::parse)?,
        step: row.get(7)?,
        progress: row.get::<_, i64>(8)? as u8,
        error_message: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl Store {
    /// Open or create the store at a path. WAL mode for concurrent readers.
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL,
                node_count INTEGER NOT NULL,
                node_size TEXT NOT NULL,
                region TEXT NOT NULL,
                postgres_version TEXT NOT NULL,
                hostname TEXT,
                port INTEGER NOT NULL,
                admin_password TEXT NOT NULL,
                provisioning_step TEXT,
                provisioning_progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                name TEXT NOT NULL,
                public_ip TEXT NOT NULL,
                private_ip TEXT NOT NULL,
                status TEXT NOT NULL,
                provider_id TEXT,
                role_hint TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_cluster ON nodes(cluster_id);

            CREATE TABLE IF NOT EXISTS backups (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                requested_type TEXT,
                backup_type TEXT,
                status TEXT NOT NULL,
                step TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                label TEXT,
                size_bytes INTEGER,
                wal_start TEXT,
                wal_stop TEXT,
                recovery_window_start TEXT,
                recovery_window_stop TEXT,
                expires_at TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_backups_cluster ON backups(cluster_id);
            CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

            CREATE TABLE IF NOT EXISTS restore_jobs (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                target_cluster_id TEXT,
                backup_id TEXT NOT NULL,
                restore_type TEXT NOT NULL,
                target_time TEXT,
                status TEXT NOT NULL,
                step TEXT,
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_restores_cluster ON restore_jobs(cluster_id);

            CREATE TABLE IF NOT EXISTS trusted_host_keys (
                host TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_verified TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_at);
            "#,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Clusters
    // ------------------------------------------------------------------

    pub fn insert_cluster(&self, cluster: &Cluster) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_cluster_on(&conn, cluster)
    }

    fn insert_cluster_on(conn: &Connection, c: &Cluster) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO clusters ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                CLUSTER_COLS
            ),
            params![
                c.id.to_string(),
                c.slug,
                c.name,
                c.owner_id.to_string(),
                c.status.as_str(),
                c.node_count as i64,
                c.node_size.as_str(),
                c.region,
                c.postgres_version.as_str(),
                c.hostname,
                c.port as i64,
                c.admin_password,
                c.provisioning_step,
                c.provisioning_progress as i64,
                c.error_message,
                c.created_at,
                c.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Insert a cluster and its provisioning task atomically: the task is
    /// only visible once the cluster row is durable.
    pub fn create_cluster_with_task(&self, cluster: &Cluster, kind: TaskKind) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        Self::insert_cluster_on(&tx, cluster)?;
        Self::enqueue_task_on(&tx, kind, cluster.id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_cluster(&self, id: Uuid) -> Result<Option<Cluster>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM clusters WHERE id = ?1",
            CLUSTER_COLS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], map_cluster)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_clusters_with_status(&self, status: ClusterStatus) -> Result<Vec<Cluster>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM clusters WHERE status = ?1 ORDER BY created_at",
            CLUSTER_COLS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], map_cluster)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_cluster_status(
        &self,
        id: Uuid,
        status: ClusterStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE clusters SET status = ?2, error_message = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.to_string(), status.as_str(), error_message, Utc::now()],
        )?;
        Ok(())
    }

    /// Conditional status transition. Returns false if the cluster was not
    /// in `from`; this closes the check-then-act race on the one-in-flight
    /// guard without a distributed lock.
    pub fn try_transition_cluster(
        &self,
        id: Uuid,
        from: ClusterStatus,
        to: ClusterStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE clusters SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id.to_string(), from.as_str(), to.as_str(), Utc::now()],
        )?;
        Ok(n == 1)
    }

    /// Persist `(step, progress)` after a provisioning phase. Progress is
    /// clamped monotonic: a stale writer can never move it backwards.
    pub fn set_provisioning_progress(&self, id: Uuid, step: &str, progress: u8) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE clusters SET provisioning_step = ?2, \
             provisioning_progress = MAX(provisioning_progress, ?3), updated_at = ?4 \
             WHERE id = ?1",
            params![id.to_string(), step, progress as i64, Utc::now()],
        )?;
        Ok(())
    }

    pub fn set_cluster_hostname(&self, id: Uuid, hostname: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE clusters SET hostname = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), hostname, Utc::now()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub fn insert_node(&self, node: &Node) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO nodes ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                NODE_COLS
            ),
            params![
                node.id.to_string(),
                node.cluster_id.to_string(),
                node.name,
                node.public_ip,
                node.private_ip,
                node.status.as_str(),
                node.provider_id,
                node.role_hint.map(|r| r.as_str()),
                node.created_at,
            ],
        )?;
        Ok(())
    }

    /// Live (non-deleted) nodes of a cluster, in creation order.
    pub fn list_nodes(&self, cluster_id: Uuid) -> Result<Vec<Node>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes WHERE cluster_id = ?1 AND status != 'DELETED' \
             ORDER BY created_at, name",
            NODE_COLS
        ))?;
        let rows = stmt.query_map(params![cluster_id.to_string()], map_node)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn update_node_status(&self, id: Uuid, status: NodeStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE nodes SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;
        Ok(())
    }

    /// Informational role hint. Authority stays with leader discovery.
    pub fn set_node_role_hint(&self, id: Uuid, role: Role) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE nodes SET role_hint = ?2 WHERE id = ?1",
            params![id.to_string(), role.as_str()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    fn insert_backup_on(conn: &Connection, b: &Backup) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO backups ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                BACKUP_COLS
            ),
            params![
                b.id.to_string(),
                b.cluster_id.to_string(),
                b.origin.as_str(),
                b.requested_type.map(|t| t.as_tool_arg()),
                b.backup_type.map(|t| t.as_tool_arg()),
                b.status.as_str(),
                b.step.map(|s| s.as_str()),
                b.progress as i64,
                b.label,
                b.size_bytes.map(|v| v as i64),
                b.wal_start,
                b.wal_stop,
                b.recovery_window_start,
                b.recovery_window_stop,
                b.expires_at,
                b.error_message,
                b.created_at,
                b.completed_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_backup(&self, backup: &Backup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_backup_on(&conn, backup)
    }

    /// Insert a backup and its execution task in one transaction.
    pub fn create_backup_with_task(&self, backup: &Backup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        Self::insert_backup_on(&tx, backup)?;
        Self::enqueue_task_on(&tx, TaskKind::RunBackup, backup.id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backups WHERE id = ?1",
            BACKUP_COLS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], map_backup)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_backups(&self, cluster_id: Uuid) -> Result<Vec<Backup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backups WHERE cluster_id = ?1 ORDER BY created_at",
            BACKUP_COLS
        ))?;
        let rows = stmt.query_map(params![cluster_id.to_string()], map_backup)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// True if the cluster has a PENDING or IN_PROGRESS backup.
    pub fn has_active_backup(&self, cluster_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM backups WHERE cluster_id = ?1 \
             AND status IN ('PENDING', 'IN_PROGRESS')",
            params![cluster_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Persist a sub-step boundary of a running backup.
    pub fn set_backup_step(&self, id: Uuid, step: BackupStep) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backups SET status = 'IN_PROGRESS', step = ?2, \
             progress = MAX(progress, ?3) WHERE id = ?1",
            params![id.to_string(), step.as_str(), step.progress() as i64],
        )?;
        Ok(())
    }

    pub fn update_backup_status(
        &self,
        id: Uuid,
        status: BackupStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backups SET status = ?2, error_message = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), error_message],
        )?;
        Ok(())
    }

    /// Write the reconciled tool result and mark the backup COMPLETED.
    pub fn record_backup_result(&self, b: &Backup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backups SET status = 'COMPLETED', step = NULL, progress = 100, \
             backup_type = ?2, label = ?3, size_bytes = ?4, wal_start = ?5, wal_stop = ?6, \
             recovery_window_start = ?7, recovery_window_stop = ?8, expires_at = ?9, \
             completed_at = ?10 WHERE id = ?1",
            params![
                b.id.to_string(),
                b.backup_type.map(|t| t.as_tool_arg()),
                b.label,
                b.size_bytes.map(|v| v as i64),
                b.wal_start,
                b.wal_stop,
                b.recovery_window_start,
                b.recovery_window_stop,
                b.expires_at,
                b.completed_at,
            ],
        )?;
        Ok(())
    }

    /// Mark a set of backups DELETED in one local operation (primary plus
    /// its dependents).
    pub fn mark_backups_deleted(&self, ids: &[Uuid]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE backups SET status = 'DELETED' WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn mark_backup_expired(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE backups SET status = 'EXPIRED' WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Completed backups whose `expires_at` has passed.
    pub fn list_due_expirations(&self, now: DateTime<Utc>) -> Result<Vec<Backup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM backups WHERE status = 'COMPLETED' \
             AND expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY expires_at",
            BACKUP_COLS
        ))?;
        let rows = stmt.query_map(params![now], map_backup)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Restore jobs
    // ------------------------------------------------------------------

    fn insert_restore_on(conn: &Connection, r: &RestoreJob) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO restore_jobs ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                RESTORE_COLS
            ),
            params![
                r.id.to_string(),
                r.cluster_id.to_string(),
                r.target_cluster_id.map(|u| u.to_string()),
                r.backup_id.to_string(),
                r.restore_type.as_str(),
                r.target_time,
                r.status.as_str(),
                r.step,
                r.progress as i64,
                r.error_message,
                r.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_restore(&self, job: &RestoreJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::insert_restore_on(&conn, job)
    }

    /// Insert a restore job and its execution task in one transaction.
    pub fn create_restore_with_task(&self, job: &RestoreJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        Self::insert_restore_on(&tx, job)?;
        Self::enqueue_task_on(&tx, TaskKind::RunRestore, job.id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_restore(&self, id: Uuid) -> Result<Option<RestoreJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM restore_jobs WHERE id = ?1",
            RESTORE_COLS
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], map_restore)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_restores(&self, cluster_id: Uuid) -> Result<Vec<RestoreJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM restore_jobs WHERE cluster_id = ?1 ORDER BY created_at",
            RESTORE_COLS
        ))?;
        let rows = stmt.query_map(params![cluster_id.to_string()], map_restore)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn has_active_restore(&self, cluster_id: Uuid) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM restore_jobs WHERE cluster_id = ?1 \
             AND status IN ('PENDING', 'IN_PROGRESS')",
            params![cluster_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn set_restore_progress(&self, id: Uuid, step: &str, progress: u8) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE restore_jobs SET status = 'IN_PROGRESS', step = ?2, \
             progress = MAX(progress, ?3) WHERE id = ?1",
            params![id.to_string(), step, progress as i64],
        )?;
        Ok(())
    }

    pub fn update_restore_status(
        &self,
        id: Uuid,
        status: RestoreStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE restore_jobs SET status = ?2, error_message = ?3 WHERE id = ?1",
            params![id.to_string(), status.as_str(), error_message],
        )?;
        Ok(())
    }

    pub fn set_restore_target_cluster(&self, id: Uuid, cluster_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE restore_jobs SET target_cluster_id = ?2 WHERE id = ?1",
            params![id.to_string(), cluster_id.to_string()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Trusted host keys
    // ------------------------------------------------------------------

    pub fn get_trusted_key(&self, host: &str) -> Result<Option<TrustedHostKey>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, fingerprint, first_seen, last_verified \
             FROM trusted_host_keys WHERE host = ?1",
        )?;
        let mut rows = stmt.query_map(params![host], |row| {
            Ok(TrustedHostKey {
                host: row.get(0)?,
                fingerprint: row.get(1)?,
                first_seen: row.get(2)?,
                last_verified: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn upsert_trusted_key(&self, key: &TrustedHostKey) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trusted_host_keys (host, fingerprint, first_seen, last_verified) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(host) DO UPDATE SET fingerprint = ?2, last_verified = ?4",
            params![key.host, key.fingerprint, key.first_seen, key.last_verified],
        )?;
        Ok(())
    }

    pub fn touch_trusted_key(&self, host: &str, when: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trusted_host_keys SET last_verified = ?2 WHERE host = ?1",
            params![host, when],
        )?;
        Ok(())
    }

    pub fn delete_trusted_key(&self, host: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM trusted_host_keys WHERE host = ?1",
            params![host],
        )?;
        Ok(())
    }

    pub fn list_trusted_keys(&self) -> Result<Vec<TrustedHostKey>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT host, fingerprint, first_seen, last_verified FROM trusted_host_keys",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TrustedHostKey {
                host: row.get(0)?,
                fingerprint: row.get(1)?,
                first_seen: row.get(2)?,
                last_verified: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ------------------------------------------------------------------
    // Task outbox
    // ------------------------------------------------------------------

    fn enqueue_task_on(conn: &Connection, kind: TaskKind, entity_id: Uuid) -> Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, kind, entity_id, status, created_at) \
             VALUES (?1, ?2, ?3, 'QUEUED', ?4)",
            params![
                Uuid::new_v4().to_string(),
                kind.as_str(),
                entity_id.to_string(),
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn enqueue_task(&self, kind: TaskKind, entity_id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Self::enqueue_task_on(&conn, kind, entity_id)
    }

    /// Claim the oldest queued task. The conditional UPDATE guarantees a
    /// task is dispatched to at most one worker.
    pub fn claim_next_task(&self) -> Result<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        loop {
            let candidate: Option<(String, String, String, DateTime<Utc>)> = conn
                .query_row(
                    "SELECT id, kind, entity_id, created_at FROM tasks \
                     WHERE status = 'QUEUED' ORDER BY created_at LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            let (id, kind, entity_id, created_at) = match candidate {
                Some(c) => c,
                None => return Ok(None),
            };

            let claimed = conn.execute(
                "UPDATE tasks SET status = 'RUNNING', started_at = ?2 \
                 WHERE id = ?1 AND status = 'QUEUED'",
                params![id, Utc::now()],
            )?;
            if claimed == 1 {
                let kind = TaskKind::parse(&kind)
                    .ok_or_else(|| anyhow::anyhow!("unknown task kind: {}", kind))?;
                let id = Uuid::parse_str(&id)?;
                let entity_id = Uuid::parse_str(&entity_id)?;
                return Ok(Some(Task {
                    id,
                    kind,
                    entity_id,
                    created_at,
                }));
            }
            // Lost the claim to another worker; look for the next one.
        }
    }

    pub fn finish_task(&self, id: Uuid, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let status = if error.is_some() { "FAILED" } else { "DONE" };
        conn.execute(
            "UPDATE tasks SET status = ?2, error = ?3 WHERE id = ?1",
            params![id.to_string(), status, error],
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
