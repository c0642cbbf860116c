//! Outbox worker pool.
//!
//! Long-running operations are never executed on the request path. The
//! accepting call writes the entity row and a task row in one transaction;
//! workers here poll the queue, claim tasks with a conditional update so
//! each is dispatched at most once, and run them to completion. Task
//! outcomes are recorded on the task row; the entity row carries its own
//! status, so a crashed worker leaves an inspectable trail rather than a
//! silent loss.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use harbor_common::config::WorkerConfig;

use crate::backup::restore::RestoreEngine;
use crate::backup::ChainEngine;
use crate::provision::Orchestrator;
use crate::store::{Store, Task, TaskKind};

pub struct WorkerPool {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    backups: Arc<ChainEngine>,
    restores: Arc<RestoreEngine>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Arc<Orchestrator>,
        backups: Arc<ChainEngine>,
        restores: Arc<RestoreEngine>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            orchestrator,
            backups,
            restores,
            config,
        }
    }

    /// Spawn the configured number of workers. Each polls the queue
    /// independently; the conditional claim keeps them from colliding.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting {} outbox workers", self.config.workers);
        (0..self.config.workers)
            .map(|n| {
                let pool = Arc::clone(&self);
                tokio::spawn(async move { pool.worker_loop(n).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: u32) {
        let idle = Duration::from_secs(self.config.poll_interval_secs);
        loop {
            match self.store.claim_next_task() {
                Ok(Some(task)) => self.run_task(worker, task).await,
                Ok(None) => sleep(idle).await,
                Err(e) => {
                    error!("Worker {} could not poll the task queue: {}", worker, e);
                    sleep(idle).await;
                }
            }
        }
    }

    /// Run one claimed task and record its outcome. The task row keeps
    /// the error text; the entity's own status was already updated by the
    /// failing operation.
    pub async fn run_task(&self, worker: u32, task: Task) {
        debug!(
            "Worker {} running {} for {}",
            worker,
            task.kind.as_str(),
            task.entity_id
        );
        let result = match task.kind {
            TaskKind::ProvisionCluster => self.orchestrator.provision(task.entity_id).await,
            TaskKind::TeardownCluster => self.orchestrator.teardown(task.entity_id).await,
            TaskKind::RunBackup => self.backups.run_backup(task.entity_id).await,
            TaskKind::RunRestore => self.restores.run_restore(task.entity_id).await,
        };

        let error = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self.store.finish_task(task.id, error.as_deref()) {
            error!("Could not record outcome of task {}: {}", task.id, e);
        }
        match error {
            Some(msg) => error!(
                "Task {} ({}) failed: {}",
                task.id,
                task.kind.as_str(),
                msg
            ),
            None => debug!("Task {} ({}) done", task.id, task.kind.as_str()),
        }
    }
}
