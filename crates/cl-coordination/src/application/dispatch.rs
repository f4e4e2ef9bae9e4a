//! Fixed-size worker pools for the three dispatch purposes.
//!
//! One pool family per pipeline: create, execute, commit. Each pool is a set
//! of tokio tasks draining a bounded channel; a context's queues stay shared,
//! mutex-protected state; workers only carry admitted items to the service
//! callbacks that run them.

use crate::config::CoordinationConfig;
use crate::domain::entities::{CommitWork, CreateWork, ExecuteWork};
use crate::domain::errors::CoordinationError;
use shared_types::ContextName;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::service::ContextCoordinationService;

#[derive(Debug)]
pub struct CreateJob {
    pub context: ContextName,
    pub work: CreateWork,
}

#[derive(Debug)]
pub struct ExecuteJob {
    pub context: ContextName,
    pub work: ExecuteWork,
}

#[derive(Debug)]
pub struct CommitJob {
    pub context: ContextName,
    pub work: CommitWork,
}

pub struct DispatchPools {
    create_tx: mpsc::Sender<CreateJob>,
    execute_tx: mpsc::Sender<ExecuteJob>,
    commit_tx: mpsc::Sender<CommitJob>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for DispatchPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPools")
            .field("workers", &self.handles.lock().unwrap().len())
            .finish()
    }
}

impl DispatchPools {
    /// Spawn the three pool families. Workers hold the service weakly so a
    /// dropped service tears the pools down instead of leaking them.
    pub fn spawn(cfg: &CoordinationConfig, service: Weak<ContextCoordinationService>) -> Self {
        let (create_tx, create_rx) = mpsc::channel::<CreateJob>(cfg.dispatch_channel_capacity);
        let (execute_tx, execute_rx) = mpsc::channel::<ExecuteJob>(cfg.dispatch_channel_capacity);
        let (commit_tx, commit_rx) = mpsc::channel::<CommitJob>(cfg.dispatch_channel_capacity);

        let mut handles = Vec::new();
        let create_rx = Arc::new(Mutex::new(create_rx));
        for worker in 0..cfg.create_pool_size {
            let rx = Arc::clone(&create_rx);
            let svc = service.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let Some(svc) = svc.upgrade() else { break };
                    debug!(worker, context = %job.context, "create job picked up");
                    if let Err(err) = svc.run_create(job).await {
                        error!(%err, "create job failed");
                    }
                }
            }));
        }

        let execute_rx = Arc::new(Mutex::new(execute_rx));
        for worker in 0..cfg.execute_pool_size {
            let rx = Arc::clone(&execute_rx);
            let svc = service.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let Some(svc) = svc.upgrade() else { break };
                    debug!(worker, context = %job.context, "execute job picked up");
                    if let Err(err) = svc.run_execute(job).await {
                        error!(%err, "execute job failed");
                    }
                }
            }));
        }

        let commit_rx = Arc::new(Mutex::new(commit_rx));
        for worker in 0..cfg.commit_pool_size {
            let rx = Arc::clone(&commit_rx);
            let svc = service.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    let Some(svc) = svc.upgrade() else { break };
                    debug!(worker, context = %job.context, "commit job picked up");
                    if let Err(err) = svc.run_commit(job).await {
                        error!(%err, "commit job failed");
                    }
                }
            }));
        }

        Self {
            create_tx,
            execute_tx,
            commit_tx,
            handles: std::sync::Mutex::new(handles),
        }
    }

    pub async fn dispatch_create(&self, job: CreateJob) -> Result<(), CoordinationError> {
        self.create_tx
            .send(job)
            .await
            .map_err(|_| CoordinationError::DispatchStopped)
    }

    pub async fn dispatch_execute(&self, job: ExecuteJob) -> Result<(), CoordinationError> {
        self.execute_tx
            .send(job)
            .await
            .map_err(|_| CoordinationError::DispatchStopped)
    }

    pub async fn dispatch_commit(&self, job: CommitJob) -> Result<(), CoordinationError> {
        self.commit_tx
            .send(job)
            .await
            .map_err(|_| CoordinationError::DispatchStopped)
    }

    /// Stop accepting work and abort the workers.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Drop for DispatchPools {
    fn drop(&mut self) {
        self.shutdown();
    }
}
