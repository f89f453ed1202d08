//! Background embedding processor.
//!
//! Algorithm (one poll tick):
//! 1. Reap finished item tasks.
//! 2. Every `maintenance_every` ticks: mark bullets embedded by another model stale,
//!    coalesce the queue, requeue stale bullets.
//! 3. Pull up to `free permits` eligible items, skipping bullets already in flight.
//! 4. Spawn one task per item: embed (under a hard timeout), persist + mark ready
//!    unless the bullet was edited meanwhile, recompute the project centroid. Any
//!    failure goes through `mark_failed`.
//! 5. Sleep `poll_interval` or until cancelled.
//!
//! On stop the loop stops pulling work and waits for in-flight items up to
//! `stop_timeout`. Items still running after that are detached, not aborted, so no
//! write is abandoned halfway.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::llm_client::{LlmError, ModelProvider};
use crate::models::embedding::{EmbedQueueItem, Embedding, EMBEDDING_SCHEMA_VERSION};
use crate::models::library::EmbeddingState;
use crate::store::{StoreError, WriteBatch, WriteOp};

use super::centroid::CentroidMaintainer;
use super::state_machine::{EmbeddingStateMachine, FailureOutcome, PRIORITY_MAINTENANCE};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub item_timeout: Duration,
    pub stop_timeout: Duration,
    pub maintenance_every: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            concurrency: 3,
            item_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            maintenance_every: 30,
        }
    }
}

impl ProcessorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.embed_poll_interval_ms.max(1)),
            concurrency: config.embed_concurrency.max(1),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub ready: usize,
    pub stale: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingStatus {
    pub running: bool,
    pub states: StateCounts,
    pub queue_depth: usize,
    pub eligible_depth: usize,
    pub in_flight: usize,
    /// The item the next poll tick would pick up first.
    pub next_item: Option<EmbedQueueItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub outdated: usize,
    pub coalesced: usize,
    pub requeued: usize,
}

#[derive(Debug, Error)]
enum ItemError {
    #[error("embedding call timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Provider(LlmError),
    #[error("provider returned no vector")]
    EmptyVector,
    #[error("store error: {0}")]
    Store(StoreError),
}

struct Shared {
    machine: Arc<EmbeddingStateMachine>,
    centroids: Arc<CentroidMaintainer>,
    provider: Arc<dyn ModelProvider>,
    config: ProcessorConfig,
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Shared {
    fn in_flight_snapshot(&self) -> HashSet<Uuid> {
        self.in_flight
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn claim(self: &Arc<Self>, bullet_id: Uuid) -> InFlightGuard {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bullet_id);
        InFlightGuard {
            shared: Arc::clone(self),
            bullet_id,
        }
    }
}

/// Releases the in-flight claim when the item task ends, however it ends.
struct InFlightGuard {
    shared: Arc<Shared>,
    bullet_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.bullet_id);
    }
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct EmbeddingProcessor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl EmbeddingProcessor {
    pub fn new(
        machine: Arc<EmbeddingStateMachine>,
        centroids: Arc<CentroidMaintainer>,
        provider: Arc<dyn ModelProvider>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                machine,
                centroids,
                provider,
                config,
                in_flight: Mutex::new(HashSet::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Spawns the poll loop. No-op if already running.
    pub fn start(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("Embedding processor is already running");
            return;
        }

        info!(
            "Starting embedding processor (concurrency={}, poll_interval={}ms)",
            self.shared.config.concurrency,
            self.shared.config.poll_interval.as_millis()
        );

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::processing_loop(
            Arc::clone(&self.shared),
            token.clone(),
        ));
        *running = Some(Running { token, handle });
    }

    /// Signals the loop and waits for in-flight items to drain or `stop_timeout`.
    pub async fn stop(&self) {
        let Some(Running { token, handle }) = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };

        info!("Stopping embedding processor...");
        token.cancel();

        // the loop enforces stop_timeout itself; the margin only covers its last tick
        let deadline = self.shared.config.stop_timeout + self.shared.config.item_timeout;
        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(())) => info!("Embedding processor stopped cleanly"),
            Ok(Err(e)) => error!("Embedding processor task panicked: {e}"),
            Err(_) => warn!("Embedding processor did not stop within timeout"),
        }
    }

    pub async fn status(&self) -> Result<EmbeddingStatus, StoreError> {
        let mut states = StateCounts::default();
        for bullet in self.shared.machine.store().list_bullets().await? {
            match bullet.embedding_state {
                EmbeddingState::Pending => states.pending += 1,
                EmbeddingState::Ready => states.ready += 1,
                EmbeddingState::Stale => states.stale += 1,
                EmbeddingState::Failed => states.failed += 1,
            }
        }
        let (queue_depth, eligible_depth) = self.shared.machine.queue_depth().await?;
        let next_item = self.shared.machine.dequeue_next().await?;

        Ok(EmbeddingStatus {
            running: self.is_running(),
            states,
            queue_depth,
            eligible_depth,
            in_flight: self.shared.in_flight_snapshot().len(),
            next_item,
        })
    }

    async fn maintenance(shared: &Shared) -> Result<MaintenanceReport, StoreError> {
        let outdated = Self::mark_outdated(shared).await?;
        let coalesced = shared.machine.coalesce().await?;
        let requeued = shared.machine.requeue_stale(PRIORITY_MAINTENANCE).await?;
        let report = MaintenanceReport {
            outdated,
            coalesced,
            requeued,
        };
        if report != MaintenanceReport::default() {
            info!(
                outdated,
                coalesced, requeued, "Embedding maintenance pass changed the queue"
            );
        }
        Ok(report)
    }

    /// Ready bullets whose embedding came from a different model go stale so the
    /// requeue pass re-embeds them.
    async fn mark_outdated(shared: &Shared) -> Result<usize, StoreError> {
        let store = shared.machine.store();
        let ready: Vec<Uuid> = store
            .list_bullets_by_state(EmbeddingState::Ready)
            .await?
            .into_iter()
            .map(|b| b.id)
            .collect();
        let model = shared.provider.embedding_model();

        let mut outdated = 0;
        for embedding in store.list_embeddings(&ready).await? {
            if embedding.model != model || embedding.schema_version != EMBEDDING_SCHEMA_VERSION {
                if shared.machine.mark_stale(embedding.bullet_id).await? {
                    outdated += 1;
                }
            }
        }
        Ok(outdated)
    }

    async fn processing_loop(shared: Arc<Shared>, token: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(shared.config.concurrency));
        let mut tasks = JoinSet::new();
        let mut tick: u64 = 0;

        info!("Embedding processing loop started");

        loop {
            if token.is_cancelled() {
                info!("Embedding processor shutdown signal received");
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!("Embedding item task panicked: {e}");
                }
            }

            tick += 1;
            if tick % shared.config.maintenance_every == 0 {
                if let Err(e) = Self::maintenance(&shared).await {
                    error!("Embedding queue maintenance failed: {e}");
                }
            }

            let capacity = semaphore.available_permits();
            if capacity > 0 {
                let exclude = shared.in_flight_snapshot();
                match shared.machine.eligible_items(capacity, &exclude).await {
                    Ok(items) => {
                        if !items.is_empty() {
                            debug!("Dequeued {} embedding items", items.len());
                        }
                        for item in items {
                            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                                break;
                            };
                            let guard = shared.claim(item.bullet_id);
                            tasks.spawn(Self::process_item(
                                Arc::clone(&shared),
                                item,
                                permit,
                                guard,
                            ));
                        }
                    }
                    Err(e) => error!("Failed to read embedding queue: {e}"),
                }
            }

            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
            }
        }

        let pending = tasks.len();
        if pending > 0 {
            info!("Waiting for {pending} in-flight embedding items");
        }
        let drained = tokio::time::timeout(shared.config.stop_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Embedding item task panicked: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} embedding items still running after stop timeout; detaching",
                tasks.len()
            );
            tasks.detach_all();
        }

        info!("Embedding processor stopped");
    }

    async fn process_item(
        shared: Arc<Shared>,
        item: EmbedQueueItem,
        _permit: OwnedSemaphorePermit,
        _guard: InFlightGuard,
    ) {
        let bullet_id = item.bullet_id;
        match Self::embed_and_store(&shared, &item).await {
            Ok(Some(project_id)) => {
                if let Err(e) = shared.centroids.recompute(project_id).await {
                    error!(%project_id, "Centroid recomputation failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%bullet_id, "Embedding attempt failed: {e}");
                match shared.machine.mark_failed(bullet_id).await {
                    Ok(FailureOutcome::Rescheduled {
                        retry_count,
                        not_before,
                    }) => debug!(%bullet_id, retry_count, %not_before, "rescheduled"),
                    Ok(FailureOutcome::Failed) => {}
                    Ok(FailureOutcome::Superseded) => {
                        debug!(%bullet_id, "bullet edited during the attempt; failure not counted")
                    }
                    Err(e) => error!(%bullet_id, "Failed to record embedding failure: {e}"),
                }
            }
        }
    }

    /// Returns the owning project id when a new embedding was stored.
    async fn embed_and_store(
        shared: &Shared,
        item: &EmbedQueueItem,
    ) -> Result<Option<Uuid>, ItemError> {
        let store = shared.machine.store();
        let Some(bullet) = store.get_bullet(item.bullet_id).await.map_err(ItemError::Store)? else {
            // bullet deleted; drop its orphaned work
            store
                .commit(WriteBatch::new().with(WriteOp::DeleteQueueItemsForBullet(item.bullet_id)))
                .await
                .map_err(ItemError::Store)?;
            return Ok(None);
        };

        let input = vec![bullet.text.clone()];
        let vector = match tokio::time::timeout(
            shared.config.item_timeout,
            shared.provider.embed(&input),
        )
        .await
        {
            Err(_) => return Err(ItemError::Timeout),
            Ok(Err(e)) => return Err(ItemError::Provider(e)),
            Ok(Ok(vectors)) => vectors
                .into_iter()
                .next()
                .filter(|v| !v.is_empty())
                .ok_or(ItemError::EmptyVector)?,
        };

        let embedding = Embedding {
            bullet_id: bullet.id,
            vector,
            provider: shared.provider.provider_name().to_string(),
            model: shared.provider.embedding_model().to_string(),
            schema_version: EMBEDDING_SCHEMA_VERSION,
            created_at: shared.machine.now(),
        };
        let stored = shared
            .machine
            .complete(embedding, &bullet)
            .await
            .map_err(ItemError::Store)?;
        if !stored {
            debug!(bullet_id = %bullet.id, "bullet changed while embedding; discarding result");
            return Ok(None);
        }

        debug!(bullet_id = %bullet.id, "embedding stored");
        Ok(Some(bullet.project_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::embedding::state_machine::tests::bullet;
    use crate::embedding::state_machine::{PRIORITY_EDIT, PRIORITY_NEW};
    use crate::llm_client::testing::FakeProvider;
    use crate::models::library::{Bullet, Project};
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use chrono::Utc;

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            poll_interval: Duration::from_millis(10),
            concurrency: 3,
            item_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            maintenance_every: 30,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        machine: Arc<EmbeddingStateMachine>,
        processor: EmbeddingProcessor,
        project: Project,
    }

    async fn harness(
        provider: FakeProvider,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> (Harness, Arc<FakeProvider>) {
        let store = Arc::new(MemoryStore::new());
        let project = Project::new(Uuid::new_v4(), "Platform".into(), Utc::now());
        store
            .commit(WriteBatch::new().with(WriteOp::PutProject(project.clone())))
            .await
            .unwrap();
        let machine = Arc::new(EmbeddingStateMachine::new(store.clone(), clock.clone()));
        let centroids = Arc::new(CentroidMaintainer::new(store.clone(), clock));
        let provider = Arc::new(provider);
        let processor =
            EmbeddingProcessor::new(machine.clone(), centroids, provider.clone(), config);
        (
            Harness {
                store,
                machine,
                processor,
                project,
            },
            provider,
        )
    }

    impl Harness {
        async fn add_bullet(&self, text: &str) -> Bullet {
            let mut b = bullet(text, Utc::now());
            b.project_id = self.project.id;
            b.role_id = self.project.role_id;
            self.store
                .commit(
                    WriteBatch::new()
                        .with(WriteOp::PutBullet(b.clone()))
                        .with(self.machine.enqueue_op(b.id, PRIORITY_NEW)),
                )
                .await
                .unwrap();
            b
        }

        async fn state_of(&self, id: Uuid) -> Bullet {
            self.store.get_bullet(id).await.unwrap().unwrap()
        }

        async fn wait_until<F>(&self, id: Uuid, done: F)
        where
            F: Fn(&Bullet) -> bool,
        {
            for _ in 0..300 {
                if done(&self.state_of(id).await) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("bullet {id} never reached the expected state");
        }
    }

    #[tokio::test]
    async fn test_processes_queue_and_updates_centroid() {
        let (h, provider) =
            harness(FakeProvider::new(), Arc::new(SystemClock), fast_config()).await;
        let a = h.add_bullet("abcd").await;
        let b = h.add_bullet("ab").await;

        h.processor.start();
        h.wait_until(a.id, |b| b.embedding_state == EmbeddingState::Ready).await;
        h.wait_until(b.id, |b| b.embedding_state == EmbeddingState::Ready).await;
        h.processor.stop().await;

        assert_eq!(provider.embeddings(), 2);
        assert!(h.store.list_queue_items().await.unwrap().is_empty());

        let project = h.store.get_project(h.project.id).await.unwrap().unwrap();
        assert_eq!(project.centroid, Some(vec![3.0, 1.0]));
        assert_eq!(project.bullet_count, 2);
        assert!(project.embedding_version >= 2);
    }

    #[tokio::test]
    async fn test_provider_failure_reschedules_with_backoff() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let failing = FakeProvider::new().with_embed(|_| Err(LlmError::Timeout));
        let (h, provider) = harness(failing, clock.clone(), fast_config()).await;
        let b = h.add_bullet("Shipped things").await;

        h.processor.start();
        h.wait_until(b.id, |b| b.retry_count == 1).await;
        // ineligible until the clock passes the backoff window
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.processor.stop().await;

        assert_eq!(provider.embeddings(), 1);
        let stored = h.state_of(b.id).await;
        assert_eq!(stored.embedding_state, EmbeddingState::Pending);
        assert_eq!(h.store.queue_items_for_bullet(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_item_timeout_counts_as_failure() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let slow = FakeProvider::new().with_delay(Duration::from_secs(10));
        let config = ProcessorConfig {
            item_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let (h, _) = harness(slow, clock, config).await;
        let b = h.add_bullet("Led the team").await;

        h.processor.start();
        h.wait_until(b.id, |b| b.retry_count == 1).await;
        h.processor.stop().await;

        assert_eq!(h.state_of(b.id).await.embedding_state, EmbeddingState::Pending);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_items() {
        let slow = FakeProvider::new().with_delay(Duration::from_millis(200));
        let (h, provider) = harness(slow, Arc::new(SystemClock), fast_config()).await;
        let b = h.add_bullet("Designed the schema").await;

        h.processor.start();
        while provider.embeddings() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.processor.stop().await;

        assert!(!h.processor.is_running());
        assert_eq!(h.state_of(b.id).await.embedding_state, EmbeddingState::Ready);
        assert_eq!(h.processor.status().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_edit_during_flight_discards_result_and_keeps_queue_item() {
        let slow = FakeProvider::new().with_delay(Duration::from_millis(100));
        let (h, provider) = harness(slow, Arc::new(SystemClock), fast_config()).await;
        let b = h.add_bullet("old text").await;

        h.processor.start();
        while provider.embeddings() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut edited = h.state_of(b.id).await;
        edited.text = "brand new text".into();
        edited.last_modified = Utc::now();
        h.store
            .commit(
                WriteBatch::new()
                    .with(WriteOp::PutBullet(edited))
                    .with(h.machine.enqueue_op(b.id, PRIORITY_EDIT)),
            )
            .await
            .unwrap();

        h.wait_until(b.id, |b| b.embedding_state == EmbeddingState::Ready).await;
        h.processor.stop().await;

        assert_eq!(provider.embeddings(), 2);
        let embedding = h.store.get_embedding(b.id).await.unwrap().unwrap();
        assert_eq!(embedding.vector, vec!["brand new text".len() as f32, 1.0]);
    }

    #[tokio::test]
    async fn test_maintenance_reembeds_other_model_vectors() {
        let (h, _) = harness(FakeProvider::new(), Arc::new(SystemClock), fast_config()).await;
        let b = h.add_bullet("Cut build times 50%").await;
        let foreign = Embedding {
            bullet_id: b.id,
            vector: vec![1.0, 0.0],
            provider: "openai".into(),
            model: "text-embedding-ada-002".into(),
            schema_version: EMBEDDING_SCHEMA_VERSION,
            created_at: Utc::now(),
        };
        assert!(h.machine.complete(foreign, &b).await.unwrap());
        assert_eq!(h.state_of(b.id).await.embedding_state, EmbeddingState::Ready);

        let report = EmbeddingProcessor::maintenance(&h.processor.shared).await.unwrap();
        assert_eq!(
            report,
            MaintenanceReport {
                outdated: 1,
                coalesced: 0,
                requeued: 1,
            }
        );
        assert_eq!(h.state_of(b.id).await.embedding_state, EmbeddingState::Stale);
        let queued = h.store.queue_items_for_bullet(b.id).await.unwrap();
        assert_eq!(queued[0].priority, PRIORITY_MAINTENANCE);

        // nothing left to do on a second pass
        assert_eq!(
            EmbeddingProcessor::maintenance(&h.processor.shared).await.unwrap(),
            MaintenanceReport::default()
        );
    }

    #[tokio::test]
    async fn test_status_counts_states_and_queue() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (h, _) = harness(FakeProvider::new(), clock.clone(), fast_config()).await;
        let first = h.add_bullet("one").await;
        h.add_bullet("two").await;
        h.machine.mark_failed(first.id).await.unwrap();

        let status = h.processor.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.states.pending, 2);
        assert_eq!(status.queue_depth, 2);
        assert_eq!(status.eligible_depth, 1);
        assert_ne!(status.next_item.unwrap().bullet_id, first.id);
    }
}
