//! Acquisition orchestrator.
//!
//! `InfrastructureService` is the one object consumers talk to. A read goes
//! memory, then disk, then network; the network path is single-flight, so
//! any number of concurrent callers share one set of fetches. Loads run in
//! a spawned task that owns the coordinator guard, so a consumer that stops
//! waiting never cancels a load in progress.
//!
//! Invalidation takes the tier lock for writing and bumps an epoch. Disk
//! reads that promote into memory hold the lock for reading, and a load
//! only caches its result if no invalidation happened since it started.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::aggregation::aggregate_with_report;
use crate::api::{ApiClient, InfrastructureSource, UpdateOutcome};
use crate::cache::{
    age_display, DurableCache, EphemeralCache, DATASET, INFRASTRUCTURE_DATA, METADATA,
    PROCESSED_DATA,
};
use crate::config::Config;
use crate::coordinator::{Acquire, LoadCoordinator, LoadGuard};
use crate::models::{DatasetMetadata, GlobalStats, ProcessedData, RawCollectionSet, ResourceType};

/// Progress percentage when fetching starts.
const FETCH_START_PERCENT: u8 = 10;
/// Share of the progress bar covered by the fetches themselves.
const FETCH_SPAN_PERCENT: usize = 50;
const FETCHED_PERCENT: u8 = 70;
const AGGREGATED_PERCENT: u8 = 90;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("All {attempted} collection fetches failed")]
    AllFetchesFailed { attempted: usize },

    #[error("Aggregation failed: {0}")]
    Aggregation(String),

    #[error("Dataset still missing after waiting for the load started by {loader}")]
    CacheMissAfterWait { loader: String },

    #[error("Update rejected: {0}")]
    UpdateRejected(String),

    #[error("Update request failed")]
    Update(#[source] anyhow::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Where a snapshot was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Memory,
    Disk,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    CheckingCache,
    CacheHit,
    Loading,
    Aggregating,
    Populating,
    /// The last attempt failed. The next call starts over.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LoadProgress {
    pub state: LoadState,
    pub percent: u8,
}

impl LoadProgress {
    fn new(state: LoadState, percent: u8) -> Self {
        Self { state, percent }
    }
}

/// One complete load, as held by the memory tier.
#[derive(Debug)]
pub struct LoadedDataset {
    pub processed: Arc<ProcessedData>,
    pub raw: Arc<RawCollectionSet>,
    pub stored_at: DateTime<Utc>,
}

/// What consumers receive. Cloning shares the underlying data.
#[derive(Debug, Clone)]
pub struct DataSnapshot {
    pub processed: Arc<ProcessedData>,
    pub raw: Arc<RawCollectionSet>,
    pub stored_at: DateTime<Utc>,
    pub source: DataSource,
}

impl DataSnapshot {
    fn new(dataset: &LoadedDataset, source: DataSource) -> Self {
        Self {
            processed: Arc::clone(&dataset.processed),
            raw: Arc::clone(&dataset.raw),
            stored_at: dataset.stored_at,
            source,
        }
    }
}

/// Cheap status read from the metadata record only.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub strategy: &'static str,
    pub durable_available: bool,
    pub stored_at: Option<DateTime<Utc>>,
    pub age: Option<String>,
    pub counts: Option<GlobalStats>,
    pub memory_warm: bool,
    pub loading: Option<String>,
}

/// Held by a consumer that can be torn down while it waits.
///
/// Once marked dead, results fetched on its behalf are dropped instead of
/// being handed back.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner<S> {
    source: S,
    durable: DurableCache,
    ephemeral: EphemeralCache<Arc<LoadedDataset>>,
    coordinator: Arc<LoadCoordinator>,
    progress: watch::Sender<LoadProgress>,
    /// Bumped by every invalidation.
    epoch: AtomicU64,
    tier_lock: RwLock<()>,
}

/// Process-wide access to the infrastructure dataset. Clone is cheap and
/// every clone shares the same caches and coordinator.
pub struct InfrastructureService<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for InfrastructureService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl InfrastructureService<ApiClient> {
    /// Production wiring: HTTP source plus a durable cache under the
    /// configured directory with the configured strategy.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut client = ApiClient::new(&config.api_base_url(), config.request_timeout())?;
        if let Some(token) = config.api_token() {
            client = client.with_token(token);
        }
        let durable = DurableCache::new(config.cache_dir()?, config.durable_strategy());
        Ok(Self::new(client, durable))
    }
}

impl<S: InfrastructureSource> InfrastructureService<S> {
    pub fn new(source: S, durable: DurableCache) -> Self {
        let (progress, _) = watch::channel(LoadProgress::new(LoadState::Idle, 0));
        Self {
            inner: Arc::new(Inner {
                source,
                durable,
                ephemeral: EphemeralCache::new(),
                coordinator: Arc::new(LoadCoordinator::new()),
                progress,
                epoch: AtomicU64::new(0),
                tier_lock: RwLock::new(()),
            }),
        }
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn durable(&self) -> &DurableCache {
        &self.inner.durable
    }

    pub fn is_loading(&self) -> bool {
        self.inner.coordinator.is_loading()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<LoadProgress> {
        self.inner.progress.subscribe()
    }

    /// The dataset from the fastest tier that has it, loading it when no
    /// tier does.
    pub async fn get_data(&self) -> Result<DataSnapshot, LoadError> {
        if !self.inner.coordinator.is_loading() {
            self.inner.publish(LoadState::CheckingCache, 0);
        }
        if let Some(snapshot) = self.cached_data().await {
            if !self.inner.coordinator.is_loading() {
                self.inner.publish(LoadState::CacheHit, 100);
            }
            debug!(source = ?snapshot.source, "Dataset served from cache");
            return Ok(snapshot);
        }
        self.load("get_data").await
    }

    /// Drop every tier and load from the network.
    ///
    /// A load already in flight is waited out first. The clear and the
    /// fetch then run as one load, so concurrent readers wait for it
    /// instead of refilling the tiers in between.
    pub async fn reload(&self) -> Result<DataSnapshot, LoadError> {
        info!("Forced reload");
        let guard = loop {
            match self.inner.coordinator.try_acquire("reload") {
                Acquire::Granted(guard) => break guard,
                Acquire::Pending(pending) => pending.wait().await,
            }
        };
        self.run_as_loader(guard, true).await
    }

    /// `get_data`, abandoned after `timeout`. The load itself keeps running
    /// and still populates the caches.
    pub async fn get_data_with_timeout(&self, timeout: Duration) -> Result<DataSnapshot, LoadError> {
        tokio::time::timeout(timeout, self.get_data())
            .await
            .map_err(|_| LoadError::Timeout(timeout))?
    }

    /// `get_data` on behalf of a consumer that may go away meanwhile.
    /// Returns `None` when it did.
    pub async fn get_data_if_alive(
        &self,
        liveness: &Liveness,
    ) -> Result<Option<DataSnapshot>, LoadError> {
        let snapshot = self.get_data().await?;
        if liveness.is_alive() {
            Ok(Some(snapshot))
        } else {
            debug!("Consumer gone, dropping dataset");
            Ok(None)
        }
    }

    /// Memory then disk, without ever touching the network. A disk hit is
    /// promoted into memory.
    pub async fn cached_data(&self) -> Option<DataSnapshot> {
        self.inner.read_tiers().await
    }

    /// Write a record back. On success every tier is cleared and the next
    /// read loads fresh data.
    pub async fn update_record(
        &self,
        resource: ResourceType,
        fid: &str,
        fields: &Map<String, Value>,
    ) -> Result<UpdateOutcome, LoadError> {
        let outcome = self
            .inner
            .source
            .update_record(resource, fid, fields)
            .await
            .map_err(LoadError::Update)?;

        match outcome {
            UpdateOutcome::Rejected { error } => {
                warn!(resource = %resource, fid, error = %error, "Update rejected");
                Err(LoadError::UpdateRejected(error))
            }
            applied => {
                info!(resource = %resource, fid, "Record updated, caches invalidated");
                if let Err(e) = self.inner.invalidate().await {
                    warn!(error = %format!("{:#}", e), "Failed to clear durable cache");
                }
                Ok(applied)
            }
        }
    }

    /// Clear every tier without reloading.
    pub async fn clear_cache(&self) -> Result<()> {
        self.inner.invalidate().await?;
        info!("Caches cleared");
        Ok(())
    }

    pub async fn cache_status(&self) -> CacheStatus {
        let durable = &self.inner.durable;
        let metadata = durable.get::<DatasetMetadata>(METADATA).await;
        CacheStatus {
            strategy: durable.strategy().name(),
            durable_available: durable.is_available().await,
            stored_at: metadata.as_ref().map(|m| m.stored_at),
            age: metadata.as_ref().map(|m| age_display(m.stored_at)),
            counts: metadata.map(|m| m.counts),
            memory_warm: self.inner.ephemeral.contains(DATASET),
            loading: self.inner.coordinator.loading_source(),
        }
    }

    /// Every map layer, dashboard and map-only alike, straight from the
    /// network. Never cached.
    pub async fn load_map_data(&self) -> Result<RawCollectionSet, LoadError> {
        self.inner.fetch_collections(&ResourceType::MAP, false).await
    }

    async fn load(&self, tag: &str) -> Result<DataSnapshot, LoadError> {
        match self.inner.coordinator.try_acquire(tag) {
            Acquire::Pending(pending) => {
                let loader = pending.source().to_string();
                debug!(tag, loader = %loader, "Waiting for in-flight load");
                pending.wait().await;
                self.inner
                    .read_tiers()
                    .await
                    .ok_or(LoadError::CacheMissAfterWait { loader })
            }
            Acquire::Granted(guard) => {
                // A load may have finished between our miss and the grant
                if let Some(dataset) = self.inner.ephemeral.get(DATASET) {
                    guard.release();
                    return Ok(DataSnapshot::new(&dataset, DataSource::Memory));
                }
                self.run_as_loader(guard, false).await
            }
        }
    }

    /// Run the load in its own task, clearing every tier first when
    /// `invalidate` is set.
    async fn run_as_loader(
        &self,
        guard: LoadGuard,
        invalidate: bool,
    ) -> Result<DataSnapshot, LoadError> {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            if invalidate {
                if let Err(e) = inner.invalidate().await {
                    warn!(error = %format!("{:#}", e), "Failed to clear durable cache");
                }
            }
            inner.run_load().await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                self.inner.publish(LoadState::Failed, 0);
                warn!(error = %e, "Load task died");
                Err(LoadError::Aggregation(e.to_string()))
            }
        }
    }
}

impl<S: InfrastructureSource> Inner<S> {
    fn publish(&self, state: LoadState, percent: u8) {
        self.progress.send_replace(LoadProgress::new(state, percent));
    }

    async fn read_tiers(&self) -> Option<DataSnapshot> {
        if let Some(dataset) = self.ephemeral.get(DATASET) {
            return Some(DataSnapshot::new(&dataset, DataSource::Memory));
        }

        // Held until the promotion so an invalidation cannot land in between
        let _tiers = self.tier_lock.read().await;
        if let Some(dataset) = self.ephemeral.get(DATASET) {
            return Some(DataSnapshot::new(&dataset, DataSource::Memory));
        }

        // Metadata is written last, so its presence means the rest is there
        let metadata: DatasetMetadata = self.durable.get(METADATA).await?;
        let processed: ProcessedData = self.durable.get(PROCESSED_DATA).await?;
        let raw: RawCollectionSet = self.durable.get(INFRASTRUCTURE_DATA).await?;

        let dataset = Arc::new(LoadedDataset {
            processed: Arc::new(processed),
            raw: Arc::new(raw),
            stored_at: metadata.stored_at,
        });
        self.ephemeral.save(DATASET, Arc::clone(&dataset));
        debug!(stored_at = %metadata.stored_at, "Durable hit promoted to memory");
        Some(DataSnapshot::new(&dataset, DataSource::Disk))
    }

    /// Drop every tier. Loads that started before this call will not
    /// cache their result.
    async fn invalidate(&self) -> Result<()> {
        let _tiers = self.tier_lock.write().await;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.ephemeral.clear();
        debug!(epoch, "Cache tiers invalidated");
        self.durable.clear().await
    }

    async fn run_load(&self) -> Result<DataSnapshot, LoadError> {
        let started = Instant::now();
        let epoch = self.epoch.load(Ordering::SeqCst);
        let raw = match self.fetch_collections(&ResourceType::DASHBOARD, true).await {
            Ok(raw) => raw,
            Err(e) => {
                self.publish(LoadState::Failed, FETCHED_PERCENT);
                return Err(e);
            }
        };

        self.publish(LoadState::Aggregating, FETCHED_PERCENT);
        let (raw, processed) = tokio::task::spawn_blocking(move || {
            let (processed, report) = aggregate_with_report(&raw);
            if report.skipped() > 0 {
                debug!(skipped = report.skipped(), "Records left out of per-piste counts");
            }
            (raw, processed)
        })
        .await
        .map_err(|e| {
            self.publish(LoadState::Failed, FETCHED_PERCENT);
            LoadError::Aggregation(e.to_string())
        })?;

        self.publish(LoadState::Populating, AGGREGATED_PERCENT);
        let dataset = Arc::new(LoadedDataset {
            processed: Arc::new(processed),
            raw: Arc::new(raw),
            stored_at: Utc::now(),
        });
        self.populate(&dataset, epoch).await;
        self.publish(LoadState::Idle, 100);

        info!(
            pistes = dataset.processed.pistes_counts.len(),
            records = dataset.raw.total_records(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dataset loaded"
        );
        Ok(DataSnapshot::new(&dataset, DataSource::Network))
    }

    /// Durable first, metadata last, then memory. Skipped when the tiers
    /// were invalidated after `epoch` was read.
    async fn populate(&self, dataset: &Arc<LoadedDataset>, epoch: u64) {
        let _tiers = self.tier_lock.write().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!("Caches invalidated during the load, result not cached");
            return;
        }

        let metadata = DatasetMetadata {
            stored_at: dataset.stored_at,
            counts: dataset.processed.global_stats.clone(),
        };
        let written = async {
            self.durable.save(INFRASTRUCTURE_DATA, &*dataset.raw).await?;
            self.durable.save(PROCESSED_DATA, &*dataset.processed).await?;
            self.durable.save(METADATA, &metadata).await
        };
        if let Err(e) = written.await {
            warn!(error = %format!("{:#}", e), "Failed to persist dataset, keeping it in memory only");
        }
        self.ephemeral.save(DATASET, Arc::clone(dataset));
    }

    /// Fetch `types` concurrently. A failed type becomes an empty
    /// collection; only a failure of every type is an error.
    async fn fetch_collections(
        &self,
        types: &[ResourceType],
        report_progress: bool,
    ) -> Result<RawCollectionSet, LoadError> {
        let started = Instant::now();
        let total = types.len();
        let completed = AtomicUsize::new(0);
        if report_progress {
            self.publish(LoadState::Loading, FETCH_START_PERCENT);
        }

        let fetches: Vec<_> = types
            .iter()
            .map(|&resource| {
                let completed = &completed;
                async move {
                    let result = self.source.fetch_collection(resource).await;
                    let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                    if report_progress {
                        let percent = FETCH_START_PERCENT as usize + FETCH_SPAN_PERCENT * done / total;
                        self.publish(LoadState::Loading, percent as u8);
                    }
                    (resource, result)
                }
            })
            .collect();

        let mut raw = RawCollectionSet::new();
        let mut failures = 0;
        for (resource, result) in join_all(fetches).await {
            let records = match result {
                Ok(records) => records,
                Err(e) => {
                    failures += 1;
                    warn!(resource = %resource, error = %format!("{:#}", e), "Fetch failed, using empty collection");
                    Vec::new()
                }
            };
            raw.insert(resource, records);
        }

        info!(
            succeeded = total - failures,
            failed = failures,
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Collections fetched"
        );
        if total > 0 && failures == total {
            return Err(LoadError::AllFetchesFailed { attempted: total });
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use serde_json::json;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::Semaphore;

    use crate::cache::DurableStrategy;
    use crate::models::Record;

    struct FakeSource {
        collections: Mutex<HashMap<ResourceType, Vec<Record>>>,
        failing: Mutex<HashSet<ResourceType>>,
        update_reply: Mutex<Option<UpdateOutcome>>,
        fetches: AtomicUsize,
        updates: AtomicUsize,
        delay: Option<Duration>,
        gated: AtomicBool,
        gate: Semaphore,
    }

    impl FakeSource {
        fn empty() -> Self {
            Self {
                collections: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashSet::new()),
                update_reply: Mutex::new(None),
                fetches: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                delay: None,
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
            }
        }

        fn with_pistes() -> Self {
            let source = Self::empty();
            {
                let mut collections = source.collections.lock().unwrap();
                collections.insert(
                    ResourceType::Pistes,
                    vec![
                        json!({"properties": {"code_piste": "P1", "utilisateur": "Diallo"}}),
                        json!({"properties": {"code_piste": "P2", "kilometrage": "4,5"}}),
                    ],
                );
                collections.insert(
                    ResourceType::Chaussees,
                    vec![
                        json!({"fid": 1, "code_piste": "P1", "length_km": "12.5"}),
                        json!({"fid": 2, "code_piste": "P1", "length_km": "bad"}),
                        json!({"fid": 3, "code_piste": "X9", "length_km": "5"}),
                    ],
                );
                collections.insert(ResourceType::Ponts, vec![json!({"code_piste": "P2"})]);
            }
            source
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::with_pistes()
            }
        }

        fn fail(&self, types: impl IntoIterator<Item = ResourceType>) {
            self.failing.lock().unwrap().extend(types);
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    impl InfrastructureSource for FakeSource {
        async fn fetch_collection(&self, resource: ResourceType) -> Result<Vec<Record>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.gated.load(Ordering::SeqCst) {
                let _permit = self.gate.acquire().await?;
            }
            if self.failing.lock().unwrap().contains(&resource) {
                anyhow::bail!("connection reset fetching {}", resource);
            }
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(&resource)
                .cloned()
                .unwrap_or_default())
        }

        async fn update_record(
            &self,
            _resource: ResourceType,
            fid: &str,
            _fields: &Map<String, Value>,
        ) -> Result<UpdateOutcome> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            let reply = self.update_reply.lock().unwrap().clone();
            Ok(reply.unwrap_or_else(|| UpdateOutcome::Applied {
                fid: Some(fid.to_string()),
                updated_fields: vec!["commune".to_string()],
                message: None,
            }))
        }
    }

    fn service_in(
        dir: &TempDir,
        source: &Arc<FakeSource>,
    ) -> InfrastructureService<Arc<FakeSource>> {
        let durable = DurableCache::new(dir.path().join("cache"), DurableStrategy::default_ttl());
        InfrastructureService::new(Arc::clone(source), durable)
    }

    fn fields() -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("commune".to_string(), json!("Kindia"));
        fields
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_load() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::slow(Duration::from_millis(30)));
        let service = service_in(&dir, &source);

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.get_data().await })
            })
            .collect();

        let mut network = 0;
        for caller in callers {
            let snapshot = caller.await.unwrap().unwrap();
            assert_eq!(snapshot.processed.pistes_counts.len(), 2);
            if snapshot.source == DataSource::Network {
                network += 1;
            }
        }

        assert_eq!(network, 1);
        assert_eq!(source.fetch_count(), ResourceType::DASHBOARD.len());
        assert!(!service.is_loading());
    }

    #[tokio::test]
    async fn test_load_aggregates_and_populates_both_tiers() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);

        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.source, DataSource::Network);

        let p1 = snapshot.processed.piste("P1").unwrap();
        assert_eq!(p1.counts.chaussees.count, 2);
        assert_eq!(p1.counts.chaussees.km, 12.5);
        assert_eq!(p1.utilisateur, "Diallo");
        let p2 = snapshot.processed.piste("P2").unwrap();
        assert_eq!(p2.counts.ponts, 1);
        assert_eq!(p2.kilometrage, 4.5);
        assert_eq!(snapshot.processed.global_stats.get(ResourceType::Chaussees), 3);

        assert!(service.durable().contains(METADATA).await);
        assert!(service.durable().contains(PROCESSED_DATA).await);
        assert!(service.durable().contains(INFRASTRUCTURE_DATA).await);

        let again = service.get_data().await.unwrap();
        assert_eq!(again.source, DataSource::Memory);
        assert!(Arc::ptr_eq(&again.processed, &snapshot.processed));
        assert_eq!(source.fetch_count(), ResourceType::DASHBOARD.len());
    }

    #[tokio::test]
    async fn test_durable_hit_is_promoted_to_memory() {
        let dir = tempdir().unwrap();
        let first = Arc::new(FakeSource::with_pistes());
        let loaded = service_in(&dir, &first).get_data().await.unwrap();

        // A fresh process over the same directory
        let second = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &second);

        let from_disk = service.get_data().await.unwrap();
        assert_eq!(from_disk.source, DataSource::Disk);
        assert_eq!(*from_disk.processed, *loaded.processed);
        assert_eq!(*from_disk.raw, *loaded.raw);

        let from_memory = service.get_data().await.unwrap();
        assert_eq!(from_memory.source, DataSource::Memory);
        assert_eq!(second.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_is_tolerated() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.fail([ResourceType::Ponts, ResourceType::Ecoles]);
        let service = service_in(&dir, &source);

        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.processed.global_stats.get(ResourceType::Ponts), 0);
        assert_eq!(snapshot.processed.piste("P2").unwrap().counts.ponts, 0);
        assert_eq!(snapshot.processed.pistes_counts.len(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_surfaces_and_releases() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.fail(ResourceType::DASHBOARD);
        let service = service_in(&dir, &source);
        let progress = service.subscribe_progress();

        let err = service.get_data().await.unwrap_err();
        assert!(matches!(err, LoadError::AllFetchesFailed { attempted: 14 }));
        assert_eq!(progress.borrow().state, LoadState::Failed);
        assert!(!service.is_loading());
        assert!(service.cached_data().await.is_none());

        source.heal();
        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.source, DataSource::Network);
        assert_eq!(source.fetch_count(), 28);
    }

    #[tokio::test]
    async fn test_waiter_surfaces_loader_failure() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.fail(ResourceType::DASHBOARD);
        source.gated.store(true, Ordering::SeqCst);
        let service = service_in(&dir, &source);
        let mut progress = service.subscribe_progress();

        let loader = tokio::spawn({
            let service = service.clone();
            async move { service.get_data().await }
        });
        progress
            .wait_for(|p| p.state == LoadState::Loading)
            .await
            .unwrap();

        let waiter = tokio::spawn({
            let service = service.clone();
            async move { service.get_data().await }
        });
        // Let the second caller miss both tiers and start waiting
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.cache_status().await.loading.as_deref(), Some("get_data"));

        source.gate.add_permits(1);
        let err = loader.await.unwrap().unwrap_err();
        assert!(matches!(err, LoadError::AllFetchesFailed { attempted: 14 }));
        match waiter.await.unwrap() {
            Err(LoadError::CacheMissAfterWait { loader }) => assert_eq!(loader, "get_data"),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(source.fetch_count(), ResourceType::DASHBOARD.len());
        assert!(!service.is_loading());
    }

    #[tokio::test]
    async fn test_progress_reaches_completion() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);
        let progress = service.subscribe_progress();

        service.get_data().await.unwrap();
        assert_eq!(*progress.borrow(), LoadProgress::new(LoadState::Idle, 100));

        service.get_data().await.unwrap();
        assert_eq!(*progress.borrow(), LoadProgress::new(LoadState::CacheHit, 100));
    }

    #[tokio::test]
    async fn test_reload_leaves_tiers_empty_until_populated() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);
        service.get_data().await.unwrap();

        source.gated.store(true, Ordering::SeqCst);
        let mut progress = service.subscribe_progress();
        let reload = tokio::spawn({
            let service = service.clone();
            async move { service.reload().await }
        });

        progress
            .wait_for(|p| p.state == LoadState::Loading)
            .await
            .unwrap();
        assert!(service.cached_data().await.is_none());
        assert!(!service.durable().contains(METADATA).await);
        assert_eq!(service.cache_status().await.loading.as_deref(), Some("reload"));

        source.gate.add_permits(1);
        let snapshot = reload.await.unwrap().unwrap();
        assert_eq!(snapshot.source, DataSource::Network);
        assert!(service.cached_data().await.is_some());
        assert_eq!(source.fetch_count(), 28);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reload_always_fetches_despite_concurrent_reads() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);
        service.get_data().await.unwrap();
        let per_load = ResourceType::DASHBOARD.len();

        for round in 1..=20 {
            // Send the concurrent read to disk, where it could promote stale data
            service.inner.ephemeral.clear();
            let reader = tokio::spawn({
                let service = service.clone();
                async move { service.get_data().await }
            });
            let reloaded = service.reload().await.unwrap();
            reader.await.unwrap().unwrap();

            assert_eq!(reloaded.source, DataSource::Network);
            assert_eq!(source.fetch_count(), per_load * (round + 1));
            let cached = service.cached_data().await.unwrap();
            assert_eq!(cached.source, DataSource::Memory);
            assert!(Arc::ptr_eq(&cached.processed, &reloaded.processed));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_update_leaves_no_stale_data_behind_concurrent_reads() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);

        for _ in 0..20 {
            let before = service.get_data().await.unwrap();
            service.inner.ephemeral.clear();
            let reader = tokio::spawn({
                let service = service.clone();
                async move { service.get_data().await }
            });
            service
                .update_record(ResourceType::Pistes, "1", &fields())
                .await
                .unwrap();
            reader.await.unwrap().unwrap();

            if let Some(cached) = service.cached_data().await {
                assert!(cached.stored_at > before.stored_at);
            }
        }
    }

    #[tokio::test]
    async fn test_update_during_load_is_not_cached() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.gated.store(true, Ordering::SeqCst);
        let service = service_in(&dir, &source);
        let mut progress = service.subscribe_progress();

        let load = tokio::spawn({
            let service = service.clone();
            async move { service.get_data().await }
        });
        progress
            .wait_for(|p| p.state == LoadState::Loading)
            .await
            .unwrap();

        service
            .update_record(ResourceType::Pistes, "1", &fields())
            .await
            .unwrap();
        source.gate.add_permits(1);

        let snapshot = load.await.unwrap().unwrap();
        assert_eq!(snapshot.source, DataSource::Network);
        assert!(service.cached_data().await.is_none());
        assert!(!service.durable().contains(METADATA).await);

        let fresh = service.get_data().await.unwrap();
        assert_eq!(fresh.source, DataSource::Network);
        assert_eq!(source.fetch_count(), 28);
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_the_load() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.gated.store(true, Ordering::SeqCst);
        let service = service_in(&dir, &source);

        let err = service
            .get_data_with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Timeout(_)));
        assert!(service.is_loading());

        source.gate.add_permits(1);
        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.source, DataSource::Memory);
        assert_eq!(source.fetch_count(), ResourceType::DASHBOARD.len());
    }

    #[tokio::test]
    async fn test_update_success_clears_every_tier() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);
        service.get_data().await.unwrap();

        let outcome = service
            .update_record(ResourceType::Pistes, "1", &fields())
            .await
            .unwrap();
        assert!(outcome.is_applied());
        assert!(service.cached_data().await.is_none());
        assert!(!service.durable().contains(METADATA).await);

        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.source, DataSource::Network);
        assert_eq!(source.fetch_count(), 28);
    }

    #[tokio::test]
    async fn test_update_rejection_keeps_tiers() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        *source.update_reply.lock().unwrap() = Some(UpdateOutcome::Rejected {
            error: "fid inconnu".to_string(),
        });
        let service = service_in(&dir, &source);
        service.get_data().await.unwrap();

        let err = service
            .update_record(ResourceType::Ponts, "99", &fields())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::UpdateRejected(ref e) if e == "fid inconnu"));
        assert_eq!(source.updates.load(Ordering::SeqCst), 1);

        let cached = service.cached_data().await.unwrap();
        assert_eq!(cached.source, DataSource::Memory);
        assert!(service.durable().contains(METADATA).await);
    }

    #[tokio::test]
    async fn test_unavailable_durable_store_degrades_to_network_only() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let source = Arc::new(FakeSource::with_pistes());
        let durable = DurableCache::new(blocker.join("cache"), DurableStrategy::default_ttl());
        let service = InfrastructureService::new(Arc::clone(&source), durable);

        let snapshot = service.get_data().await.unwrap();
        assert_eq!(snapshot.source, DataSource::Network);
        assert_eq!(service.get_data().await.unwrap().source, DataSource::Memory);

        let status = service.cache_status().await;
        assert!(!status.durable_available);
        assert!(status.memory_warm);
        assert!(status.stored_at.is_none());
    }

    #[tokio::test]
    async fn test_dead_consumer_gets_nothing() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);

        let alive = Liveness::new();
        assert!(service.get_data_if_alive(&alive).await.unwrap().is_some());

        let gone = Liveness::new();
        gone.mark_dead();
        assert!(service.get_data_if_alive(&gone).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_cache_and_status() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        let service = service_in(&dir, &source);
        service.get_data().await.unwrap();

        let status = service.cache_status().await;
        assert_eq!(status.strategy, "ttl");
        assert_eq!(status.age.as_deref(), Some("just now"));
        assert_eq!(status.counts.unwrap().get(ResourceType::Pistes), 2);
        assert!(status.memory_warm);
        assert!(status.loading.is_none());

        service.clear_cache().await.unwrap();
        let status = service.cache_status().await;
        assert!(!status.memory_warm);
        assert!(status.counts.is_none());
        assert_eq!(source.fetch_count(), ResourceType::DASHBOARD.len());
    }

    #[tokio::test]
    async fn test_map_data_covers_every_layer_uncached() {
        let dir = tempdir().unwrap();
        let source = Arc::new(FakeSource::with_pistes());
        source.fail([ResourceType::PointsCritiques]);
        let service = service_in(&dir, &source);

        let layers = service.load_map_data().await.unwrap();
        assert_eq!(source.fetch_count(), ResourceType::MAP.len());
        assert_eq!(layers.collection(ResourceType::Pistes).len(), 2);
        assert!(layers.collection(ResourceType::PointsCritiques).is_empty());
        assert!(service.cached_data().await.is_none());
    }
}
