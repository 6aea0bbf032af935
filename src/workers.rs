//! Supervised background maintenance.
//!
//! One worker task drains a bounded job queue; optional scheduler tasks feed
//! it periodic consolidation and anomaly-scan jobs. A `watch` channel carries
//! shutdown, and long jobs check it between items. Failed jobs are published
//! as [`EngineEvent::WorkerFailed`] and counted.

use crate::anomaly::ScanReport;
use crate::config::WorkerConfig;
use crate::consolidation::ConsolidationReport;
use crate::error::{MemoryError, Result};
use crate::events::EngineEvent;
use crate::orchestrator::MemoryOrchestrator;
use crate::types::OwnerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub enum MaintenanceJob {
    Consolidate {
        owner: OwnerId,
        reply: Option<oneshot::Sender<Result<ConsolidationReport>>>,
    },
    /// `None` scans every registered owner
    ScanAnomalies {
        owner: Option<OwnerId>,
        reply: Option<oneshot::Sender<Result<ScanReport>>>,
    },
}

impl MaintenanceJob {
    fn label(&self) -> String {
        match self {
            MaintenanceJob::Consolidate { owner, .. } => format!("consolidate:{owner}"),
            MaintenanceJob::ScanAnomalies { owner: Some(owner), .. } => format!("scan:{owner}"),
            MaintenanceJob::ScanAnomalies { owner: None, .. } => "scan:*".to_string(),
        }
    }
}

impl std::fmt::Debug for MaintenanceJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Scheduled jobs skipped because the queue was full
    pub jobs_dropped: u64,
}

#[derive(Debug)]
pub struct MaintenanceSupervisor {
    sender: mpsc::Sender<MaintenanceJob>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl MaintenanceSupervisor {
    /// Spawn the worker and any configured schedulers
    pub fn start(orchestrator: Arc<MemoryOrchestrator>, config: &WorkerConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let mut handles = vec![tokio::spawn(run_worker(
            Arc::clone(&orchestrator),
            receiver,
            shutdown_rx.clone(),
            Arc::clone(&stats),
        ))];

        if let Some(period) = config.consolidation_interval() {
            handles.push(tokio::spawn(run_schedule(
                Arc::clone(&orchestrator),
                sender.clone(),
                shutdown_rx.clone(),
                Arc::clone(&stats),
                period,
                Schedule::Consolidation,
            )));
        }
        if let Some(period) = config.anomaly_scan_interval() {
            handles.push(tokio::spawn(run_schedule(
                Arc::clone(&orchestrator),
                sender.clone(),
                shutdown_rx,
                Arc::clone(&stats),
                period,
                Schedule::AnomalyScan,
            )));
        }

        tracing::info!(
            consolidation_interval = ?config.consolidation_interval(),
            anomaly_scan_interval = ?config.anomaly_scan_interval(),
            "Maintenance worker started"
        );

        Self {
            sender,
            shutdown,
            handles,
            stats,
        }
    }

    /// Queue a job, waiting for room
    pub async fn submit(&self, job: MaintenanceJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| MemoryError::WorkerUnavailable(format!("queue closed, dropped {:?}", e.0)))
    }

    /// Consolidate one owner on the worker and wait for the report
    pub async fn consolidate(&self, owner: impl Into<OwnerId>) -> Result<ConsolidationReport> {
        let (reply, rx) = oneshot::channel();
        self.submit(MaintenanceJob::Consolidate {
            owner: owner.into(),
            reply: Some(reply),
        })
        .await?;
        rx.await
            .map_err(|_| MemoryError::WorkerUnavailable("worker stopped before replying".into()))?
    }

    /// Scan one owner, or all owners, on the worker and wait for the report
    pub async fn scan(&self, owner: Option<&str>) -> Result<ScanReport> {
        let (reply, rx) = oneshot::channel();
        self.submit(MaintenanceJob::ScanAnomalies {
            owner: owner.map(str::to_string),
            reply: Some(reply),
        })
        .await?;
        rx.await
            .map_err(|_| MemoryError::WorkerUnavailable("worker stopped before replying".into()))?
    }

    pub async fn stats(&self) -> WorkerStats {
        *self.stats.lock().await
    }

    /// Signal shutdown and wait for every task. Running jobs stop at their
    /// next item boundary.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        drop(self.sender);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        tracing::info!("Maintenance worker stopped");
    }
}

async fn run_worker(
    orchestrator: Arc<MemoryOrchestrator>,
    mut jobs: mpsc::Receiver<MaintenanceJob>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        if *shutdown.borrow() {
            break;
        }
        run_job(&orchestrator, job, &shutdown, &stats).await;
    }
    tracing::debug!("Maintenance worker loop exited");
}

async fn run_job(
    orchestrator: &MemoryOrchestrator,
    job: MaintenanceJob,
    shutdown: &watch::Receiver<bool>,
    stats: &Mutex<WorkerStats>,
) {
    let label = job.label();
    match job {
        MaintenanceJob::Consolidate { owner, reply } => {
            let result = orchestrator
                .consolidate_with_cancel(&owner, Some(shutdown))
                .await;
            let cancelled = matches!(&result, Ok(report) if report.cancelled);
            record(orchestrator, stats, &label, result.as_ref().err(), cancelled).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        MaintenanceJob::ScanAnomalies { owner, reply } => {
            let result = orchestrator
                .scan_anomalies_with_cancel(owner.as_deref(), Some(shutdown))
                .await;
            let cancelled = matches!(result, Err(MemoryError::Cancelled));
            let error = result.as_ref().err().filter(|_| !cancelled);
            record(orchestrator, stats, &label, error, cancelled).await;
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
    }
}

async fn record(
    orchestrator: &MemoryOrchestrator,
    stats: &Mutex<WorkerStats>,
    label: &str,
    error: Option<&MemoryError>,
    cancelled: bool,
) {
    {
        let mut stats = stats.lock().await;
        match (error, cancelled) {
            (Some(_), _) => stats.jobs_failed += 1,
            (None, true) => stats.jobs_cancelled += 1,
            (None, false) => stats.jobs_completed += 1,
        }
    }
    if let Some(e) = error {
        tracing::warn!(job = label, error = %e, "Maintenance job failed");
        orchestrator
            .events()
            .emit(EngineEvent::WorkerFailed {
                job: label.to_string(),
                error: e.to_string(),
                timestamp: orchestrator.now(),
            })
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Consolidation,
    AnomalyScan,
}

async fn run_schedule(
    orchestrator: Arc<MemoryOrchestrator>,
    jobs: mpsc::Sender<MaintenanceJob>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
    period: Duration,
    schedule: Schedule,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let batch: Vec<MaintenanceJob> = match schedule {
            Schedule::Consolidation => orchestrator
                .owners()
                .await
                .into_iter()
                .map(|owner| MaintenanceJob::Consolidate { owner, reply: None })
                .collect(),
            Schedule::AnomalyScan => vec![MaintenanceJob::ScanAnomalies {
                owner: None,
                reply: None,
            }],
        };

        for job in batch {
            if let Err(e) = jobs.try_send(job) {
                tracing::debug!(?schedule, error = %e, "Maintenance queue full, skipping");
                stats.lock().await.jobs_dropped += 1;
            }
        }
    }
}
