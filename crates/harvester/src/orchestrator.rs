//! Batch orchestrator: navigate, extract and merge for each entity id.
//!
//! Ids are sharded round-robin across `workers`. Each worker owns exactly one
//! session and walks its shard in input order, pacing between entities. A
//! dead session is recreated before the next entity; a session that cannot be
//! recreated ends that worker and its remaining ids are reported as not
//! attempted. Everything else fails only the entity (or unit) it happened to.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;

use crate::document::Selector;
use crate::error::SessionError;
use crate::locator::RetryPolicy;
use crate::navigation::{AddressTemplate, Navigator, DEFAULT_NAV_ATTEMPTS};
use crate::pipeline::Pipeline;
use crate::progress::{emit, BatchEventKind, ProgressSender};
use crate::runlog::{self, RunLog, RunLogEntry};
use crate::session::{Session, SessionManager};
use crate::store::RecordStore;
use crate::value::EntityId;

/// Default pause between entities on one worker.
pub const DEFAULT_PACING: Duration = Duration::from_secs(1);

/// Cooperative cancellation, checked between entities.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless stopped first. Returns whether a stop was
    /// requested.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
    pub pacing: Duration,
    pub navigation_attempts: u32,
    /// Clear each entity's record just before processing it.
    pub clean_before_run: bool,
    /// Append a JSONL line per entity here.
    pub run_log: Option<PathBuf>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            pacing: DEFAULT_PACING,
            navigation_attempts: DEFAULT_NAV_ATTEMPTS,
            clean_before_run: false,
            run_log: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub reason: String,
}

/// What happened to one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityReport {
    pub entity: EntityId,
    /// At least one unit's output was merged.
    pub succeeded: bool,
    pub session_id: String,
    pub generation: u32,
    pub address: Option<String>,
    pub load_time_ms: Option<u64>,
    pub navigation_error: Option<String>,
    /// Units whose output was merged, in pipeline order.
    pub merged: Vec<String>,
    /// Units that failed or whose output could not be stored.
    pub failed: Vec<UnitFailure>,
    pub elapsed_ms: u64,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub succeeded: BTreeSet<EntityId>,
    pub failed: BTreeSet<EntityId>,
    /// Ids never processed because a worker aborted or a stop was requested,
    /// in input order.
    pub not_attempted: Vec<EntityId>,
    /// Per-entity detail in input order.
    pub entities: Vec<EntityReport>,
    /// First worker abort reason, if any worker lost its session for good.
    pub aborted: Option<String>,
    pub stopped: bool,
    pub elapsed_ms: u64,
}

impl BatchReport {
    /// Latest report for `id`.
    pub fn entity(&self, id: &EntityId) -> Option<&EntityReport> {
        self.entities.iter().rev().find(|e| &e.entity == id)
    }

    /// Every id was attempted.
    pub fn is_complete(&self) -> bool {
        self.not_attempted.is_empty()
    }
}

#[derive(Default)]
struct WorkerOutcome {
    entities: Vec<(usize, EntityReport)>,
    not_attempted: Vec<(usize, EntityId)>,
    aborted: Option<String>,
    stopped: bool,
}

/// Drives navigation, extraction and merging over a batch of ids.
pub struct Orchestrator {
    manager: Arc<SessionManager>,
    navigator: Navigator,
    template: AddressTemplate,
    marker: Selector,
    pipeline: Pipeline,
    store: Arc<dyn RecordStore>,
    locator: RetryPolicy,
    settings: BatchSettings,
    events: Option<ProgressSender>,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<SessionManager>,
        template: AddressTemplate,
        marker: Selector,
        pipeline: Pipeline,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            manager,
            navigator: Navigator::default(),
            template,
            marker,
            pipeline,
            store,
            locator: RetryPolicy::default(),
            settings: BatchSettings::default(),
            events: None,
        }
    }

    pub fn with_navigator(mut self, navigator: Navigator) -> Self {
        self.navigator = navigator;
        self
    }

    /// Default policy handed to extractor units.
    pub fn with_locator_policy(mut self, policy: RetryPolicy) -> Self {
        self.locator = policy;
        self
    }

    pub fn with_settings(mut self, settings: BatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, events: ProgressSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Process `ids` and report the tally. Never fails as a whole.
    pub async fn run_batch(&self, ids: &[EntityId], stop: &StopSignal) -> BatchReport {
        let start = Instant::now();
        let batch_id = format!("batch-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"));
        let distinct = ids.iter().collect::<HashSet<_>>().len();
        let workers = self.settings.workers.max(1).min(distinct.max(1));
        let mut seq = 0;

        tracing::info!(
            "Batch {batch_id}: {} entities across {workers} worker(s)",
            ids.len()
        );
        emit(
            &self.events,
            &batch_id,
            None,
            &mut seq,
            BatchEventKind::BatchStarted {
                entities: ids.len(),
                workers,
            },
        );

        let run_log = self
            .settings
            .run_log
            .as_ref()
            .and_then(|path| match RunLog::open(path) {
                Ok(log) => Some(Mutex::new(log)),
                Err(e) => {
                    tracing::warn!("Run log {} unavailable: {e}", path.display());
                    None
                }
            });

        let shards = shard_by_entity(ids, workers);

        let outcomes = join_all(
            shards
                .into_iter()
                .enumerate()
                .map(|(worker, shard)| {
                    self.run_worker(worker, shard, stop, &batch_id, run_log.as_ref())
                }),
        )
        .await;

        let mut report = BatchReport {
            batch_id: batch_id.clone(),
            ..Default::default()
        };
        let mut entities = Vec::new();
        let mut not_attempted = Vec::new();
        for outcome in outcomes {
            entities.extend(outcome.entities);
            not_attempted.extend(outcome.not_attempted);
            report.stopped |= outcome.stopped;
            if report.aborted.is_none() {
                report.aborted = outcome.aborted;
            }
        }
        entities.sort_by_key(|(pos, _)| *pos);
        not_attempted.sort_by_key(|(pos, _)| *pos);

        for (_, entity) in entities {
            if entity.succeeded {
                report.failed.remove(&entity.entity);
                report.succeeded.insert(entity.entity.clone());
            } else {
                report.succeeded.remove(&entity.entity);
                report.failed.insert(entity.entity.clone());
            }
            report.entities.push(entity);
        }
        report.not_attempted = not_attempted.into_iter().map(|(_, id)| id).collect();
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            "Batch {batch_id} finished: {} succeeded, {} failed, {} not attempted ({}ms)",
            report.succeeded.len(),
            report.failed.len(),
            report.not_attempted.len(),
            report.elapsed_ms
        );
        emit(
            &self.events,
            &batch_id,
            None,
            &mut seq,
            BatchEventKind::BatchFinished {
                succeeded: report.succeeded.len(),
                failed: report.failed.len(),
                not_attempted: report.not_attempted.len(),
            },
        );

        report
    }

    async fn run_worker(
        &self,
        worker: usize,
        shard: Vec<(usize, EntityId)>,
        stop: &StopSignal,
        batch_id: &str,
        run_log: Option<&Mutex<RunLog>>,
    ) -> WorkerOutcome {
        let mut out = WorkerOutcome::default();
        let mut seq = 0;
        let mut pending: VecDeque<(usize, EntityId)> = shard.into();

        if pending.is_empty() {
            return out;
        }
        if stop.is_stopped() {
            out.stopped = true;
            out.not_attempted.extend(pending);
            return out;
        }

        let mut session = match self.manager.create().await {
            Ok(session) => Some(session),
            Err(e) => {
                self.abort(worker, batch_id, &mut seq, &e, &mut out);
                None
            }
        };

        let mut first = true;
        while let Some(current) = session.take() {
            let Some((pos, id)) = pending.pop_front() else {
                session = Some(current);
                break;
            };

            let stopped = if first {
                stop.is_stopped()
            } else {
                stop.sleep(self.settings.pacing).await
            };
            first = false;
            if stopped {
                tracing::info!("Worker {worker} stopping before {id}");
                pending.push_front((pos, id));
                out.stopped = true;
                session = Some(current);
                break;
            }

            let mut current = match self.recover(current, worker, batch_id, &mut seq).await {
                Ok(s) => s,
                Err(e) => {
                    pending.push_front((pos, id));
                    self.abort(worker, batch_id, &mut seq, &e, &mut out);
                    break;
                }
            };

            emit(
                &self.events,
                batch_id,
                Some(worker),
                &mut seq,
                BatchEventKind::EntityStarted {
                    entity: id.to_string(),
                },
            );
            let (report, check) = self.process(&mut current, &id).await;
            emit(
                &self.events,
                batch_id,
                Some(worker),
                &mut seq,
                BatchEventKind::EntityFinished {
                    entity: id.to_string(),
                    succeeded: report.succeeded,
                    merged_units: report.merged.len(),
                    failed_units: report.failed.len(),
                    elapsed_ms: report.elapsed_ms,
                },
            );
            if let Some(log) = run_log {
                log_entity(log, batch_id, &report);
            }
            out.entities.push((pos, report));

            if check {
                match self.recover(current, worker, batch_id, &mut seq).await {
                    Ok(s) => session = Some(s),
                    Err(e) => self.abort(worker, batch_id, &mut seq, &e, &mut out),
                }
            } else {
                session = Some(current);
            }
        }

        out.not_attempted.extend(pending);
        if let Some(session) = session {
            self.manager.close(session).await;
        }
        out
    }

    /// Probe the session and recreate it if dead.
    async fn recover(
        &self,
        mut session: Session,
        worker: usize,
        batch_id: &str,
        seq: &mut u64,
    ) -> Result<Session, SessionError> {
        if self.manager.is_alive(&mut session).await {
            return Ok(session);
        }
        let session = self.manager.recreate(session).await?;
        emit(
            &self.events,
            batch_id,
            Some(worker),
            seq,
            BatchEventKind::SessionRecreated {
                session_id: session.id().to_string(),
                generation: session.generation(),
            },
        );
        Ok(session)
    }

    fn abort(
        &self,
        worker: usize,
        batch_id: &str,
        seq: &mut u64,
        error: &SessionError,
        out: &mut WorkerOutcome,
    ) {
        tracing::warn!("Worker {worker} aborted: {error}");
        emit(
            &self.events,
            batch_id,
            Some(worker),
            seq,
            BatchEventKind::WorkerAborted {
                reason: error.to_string(),
            },
        );
        out.aborted = Some(error.to_string());
    }

    /// Navigate, extract and merge one entity. The flag asks for a liveness
    /// check before the session is used again.
    async fn process(&self, session: &mut Session, id: &EntityId) -> (EntityReport, bool) {
        let start = Instant::now();
        let mut report = EntityReport {
            entity: id.clone(),
            succeeded: false,
            session_id: session.id().to_string(),
            generation: session.generation(),
            address: None,
            load_time_ms: None,
            navigation_error: None,
            merged: Vec::new(),
            failed: Vec::new(),
            elapsed_ms: 0,
        };

        if self.settings.clean_before_run {
            if let Err(e) = self.store.clear(Some(id)) {
                tracing::warn!("Could not clear record for {id}: {e}");
            }
        }

        let check = match self.template.resolve(id) {
            Err(e) => {
                tracing::warn!("No address for {id}: {e}");
                report.navigation_error = Some(e.to_string());
                false
            }
            Ok(address) => {
                let loaded = self
                    .navigator
                    .load(
                        session,
                        &address,
                        &self.marker,
                        self.settings.navigation_attempts,
                    )
                    .await;
                match loaded {
                    Err(e) => {
                        tracing::warn!("Navigation failed for {id}: {e}");
                        report.address = Some(address);
                        report.navigation_error = Some(e.to_string());
                        true
                    }
                    Ok(ready) => {
                        report.address = Some(ready.address);
                        report.load_time_ms = Some(ready.load_time_ms);
                        self.extract_and_merge(session, id, &mut report).await
                    }
                }
            }
        };

        report.succeeded = !report.merged.is_empty();
        report.elapsed_ms = start.elapsed().as_millis() as u64;
        if report.succeeded {
            tracing::info!(
                "Processed {id}: {} unit(s) merged, {} failed",
                report.merged.len(),
                report.failed.len()
            );
        } else {
            tracing::warn!("Failed to process {id}");
        }
        (report, check)
    }

    /// Returns whether a unit failed because the session was lost.
    async fn extract_and_merge(
        &self,
        session: &Session,
        id: &EntityId,
        report: &mut EntityReport,
    ) -> bool {
        let doc = session.document(self.locator);
        let mut lost = false;

        for outcome in self.pipeline.run(&doc).await {
            match outcome.result {
                Ok(partial) => match self.store.merge(id, partial) {
                    Ok(_) => report.merged.push(outcome.unit),
                    Err(e) => {
                        tracing::warn!("Store error for {id} unit {}: {e}", outcome.unit);
                        report.failed.push(UnitFailure {
                            unit: outcome.unit,
                            reason: e.to_string(),
                        });
                    }
                },
                Err(e) => {
                    lost |= e.is_session_loss();
                    report.failed.push(UnitFailure {
                        unit: outcome.unit,
                        reason: e.to_string(),
                    });
                }
            }
        }
        lost
    }
}

/// Deal distinct entities round-robin across `workers` shards.
///
/// Repeats of an id follow its first appearance, so shards are disjoint by
/// entity. Each entry keeps its input position.
fn shard_by_entity(ids: &[EntityId], workers: usize) -> Vec<Vec<(usize, EntityId)>> {
    let mut shards = vec![Vec::new(); workers.max(1)];
    let mut owner: HashMap<&EntityId, usize> = HashMap::new();
    for (pos, id) in ids.iter().enumerate() {
        let next = owner.len() % shards.len();
        let worker = *owner.entry(id).or_insert(next);
        shards[worker].push((pos, id.clone()));
    }
    shards
}

fn log_entity(log: &Mutex<RunLog>, batch_id: &str, report: &EntityReport) {
    let entry = RunLogEntry {
        timestamp: runlog::now(),
        batch_id,
        session_id: &report.session_id,
        generation: report.generation,
        entity: report.entity.as_str(),
        succeeded: report.succeeded,
        elapsed_ms: report.elapsed_ms,
        navigation_error: report.navigation_error.as_deref(),
        merged: report.merged.iter().map(String::as_str).collect(),
        failed: report
            .failed
            .iter()
            .map(|f| (f.unit.as_str(), f.reason.clone()))
            .collect(),
    };
    match log.lock() {
        Ok(mut log) => {
            if let Err(e) = log.log(&entry) {
                tracing::warn!("Run log write failed: {e}");
            }
        }
        Err(_) => tracing::warn!("Run log lock poisoned"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.stop();
        let stopped = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
        assert!(stop.sleep(Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_sleep_runs_out() {
        let stop = StopSignal::new();
        assert!(!stop.sleep(Duration::from_millis(5)).await);
    }

    #[test]
    fn test_repeated_ids_stay_on_one_shard() {
        let ids: Vec<EntityId> = ["A", "B", "A", "C", "B", "D"]
            .into_iter()
            .map(EntityId::from)
            .collect();
        let shards = shard_by_entity(&ids, 2);

        let names = |shard: &[(usize, EntityId)]| {
            shard
                .iter()
                .map(|(pos, id)| (*pos, id.as_str().to_string()))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            names(&shards[0]),
            vec![
                (0, "A".to_string()),
                (2, "A".to_string()),
                (3, "C".to_string())
            ]
        );
        assert_eq!(
            names(&shards[1]),
            vec![
                (1, "B".to_string()),
                (4, "B".to_string()),
                (5, "D".to_string())
            ]
        );
    }

    #[test]
    fn test_report_lookup() {
        let mut report = BatchReport::default();
        assert!(report.is_complete());
        report.not_attempted.push("C".into());
        assert!(!report.is_complete());
        assert!(report.entity(&"A".into()).is_none());
    }
}
