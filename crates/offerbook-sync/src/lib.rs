//! Offer reconciliation, the background sync poller and price-history aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use offerbook_core::{DateRange, NewOffer, ObservedOffer, Offer, PriceHistory};
use offerbook_storage::{
    deactivate_offer_in, find_active_offer_in, insert_offer_in, Catalog, StorageError,
};
use offerbook_upstream::{HttpOfferFeed, OfferFeed, UpstreamConfig};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerbook-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub upstream_base_url: Option<String>,
    pub upstream_credential: Option<String>,
    pub poll_interval: Duration,
    pub store_retry: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub poller_enabled: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://offerbook.db".to_string()),
            upstream_base_url: std::env::var("OFFER_BASE_URL").ok(),
            upstream_credential: std::env::var("OFFER_API_TOKEN").ok(),
            poll_interval: Duration::from_secs(env_number("OFFERBOOK_POLL_INTERVAL_SECS", 30)),
            store_retry: Duration::from_millis(env_number("OFFERBOOK_STORE_RETRY_MS", 1000)),
            http_timeout: Duration::from_secs(env_number("OFFERBOOK_HTTP_TIMEOUT_SECS", 10)),
            user_agent: std::env::var("OFFERBOOK_USER_AGENT")
                .unwrap_or_else(|_| "offerbook/0.1".to_string()),
            poller_enabled: std::env::var("OFFERBOOK_POLLER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
        }
    }

    pub fn upstream_config(&self) -> Result<UpstreamConfig> {
        let base_url = self
            .upstream_base_url
            .clone()
            .context("OFFER_BASE_URL must point at the upstream pricing service")?;
        Ok(UpstreamConfig {
            credential: self.upstream_credential.clone(),
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
            ..UpstreamConfig::new(base_url)
        })
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            poll_interval: self.poll_interval,
            store_retry: self.store_retry,
        }
    }
}

fn env_number(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Opens the datastore and applies pending migrations.
pub async fn open_catalog(config: &SyncConfig) -> Result<Catalog> {
    let catalog = Catalog::connect(&config.database_url)
        .await
        .with_context(|| format!("opening datastore {}", config.database_url))?;
    catalog.migrate().await.context("applying migrations")?;
    Ok(catalog)
}

/// Connects to the upstream service; fails when no credential can be obtained.
pub async fn connect_feed(config: &SyncConfig) -> Result<Arc<HttpOfferFeed>> {
    let upstream = config.upstream_config()?;
    let feed = HttpOfferFeed::connect(upstream)
        .await
        .context("obtaining upstream credential")?;
    Ok(Arc::new(feed))
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<CycleSummary> {
    let catalog = open_catalog(config).await?;
    let feed = connect_feed(config).await?;
    let poller = SyncPoller::new(catalog, feed, config.poller_settings());
    poller
        .run_cycle(&CancellationToken::new())
        .await
        .context("reading products")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IgnoreReason {
    /// Zero-stock observations are never persisted.
    OutOfStock,
    /// Same price and stock as the current active offer.
    Unchanged,
    /// The datastore refused the insert; the transaction was rolled back.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted {
        offer: Offer,
        superseded: Option<i64>,
    },
    Ignored(IgnoreReason),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{found} active offers for product {prod_id} vendor {vendor_id}")]
    Consistency {
        prod_id: i64,
        vendor_id: i64,
        found: usize,
    },
    #[error(transparent)]
    Storage(StorageError),
}

impl ReconcileError {
    fn from_storage(err: StorageError, observed: &ObservedOffer) -> Self {
        match err {
            StorageError::Consistency { found, .. } => Self::Consistency {
                prod_id: observed.prod_id,
                vendor_id: observed.vendor_id,
                found,
            },
            other => Self::Storage(other),
        }
    }
}

/// Decides whether an observed offer becomes a new history row.
///
/// Work on one (product, vendor) pair is serialized in-process and every
/// decision runs inside a single transaction, so the deactivate/insert pair is
/// applied together or not at all.
#[derive(Debug, Clone)]
pub struct Reconciler {
    catalog: Catalog,
    pair_locks: Arc<Mutex<HashMap<(i64, i64), Arc<Mutex<()>>>>>,
}

impl Reconciler {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn reconcile(
        &self,
        observed: &ObservedOffer,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.reconcile_at(observed, Utc::now()).await
    }

    /// Same as [`Reconciler::reconcile`] with an explicit creation timestamp.
    pub async fn reconcile_at(
        &self,
        observed: &ObservedOffer,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        if observed.is_out_of_stock() {
            debug!(
                prod_id = observed.prod_id,
                vendor_id = observed.vendor_id,
                "ignoring out-of-stock offer"
            );
            return Ok(ReconcileOutcome::Ignored(IgnoreReason::OutOfStock));
        }

        let key = (observed.prod_id, observed.vendor_id);
        let pair_lock = self.pair_lock(key).await;
        let outcome = {
            let _pair_guard = pair_lock.lock().await;
            self.reconcile_locked(observed, observed_at).await
        };
        self.release_pair_lock(key, pair_lock).await;
        outcome
    }

    /// Decision and write for one observation; the caller holds the pair lock.
    async fn reconcile_locked(
        &self,
        observed: &ObservedOffer,
        observed_at: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let storage_err = |err| ReconcileError::from_storage(err, observed);
        let mut tx = self.catalog.begin().await.map_err(storage_err)?;

        let active = find_active_offer_in(&mut tx, observed.prod_id, observed.vendor_id)
            .await
            .map_err(storage_err)?;
        let superseded = match active {
            Some(current) if observed.matches(&current) => {
                return Ok(ReconcileOutcome::Ignored(IgnoreReason::Unchanged));
            }
            Some(current) => {
                deactivate_offer_in(&mut tx, current.internal_id)
                    .await
                    .map_err(storage_err)?;
                Some(current.internal_id)
            }
            None => None,
        };

        match insert_offer_in(&mut tx, &NewOffer::observed_at(observed, observed_at)).await {
            Ok(offer) => {
                tx.commit().await.map_err(|err| storage_err(err.into()))?;
                info!(
                    prod_id = offer.prod_id,
                    vendor_id = offer.vendor_id,
                    price = offer.price,
                    items_in_stock = offer.items_in_stock,
                    ?superseded,
                    "offer recorded"
                );
                Ok(ReconcileOutcome::Inserted { offer, superseded })
            }
            Err(err @ (StorageError::Duplicate | StorageError::Integrity)) => {
                tx.rollback().await.map_err(|err| storage_err(err.into()))?;
                warn!(
                    prod_id = observed.prod_id,
                    vendor_id = observed.vendor_id,
                    %err,
                    "offer insert rejected; will retry next cycle"
                );
                Ok(ReconcileOutcome::Ignored(IgnoreReason::Rejected))
            }
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn pair_lock(&self, key: (i64, i64)) -> Arc<Mutex<()>> {
        let mut map = self.pair_locks.lock().await;
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the map entry once no other task holds or waits on it.
    ///
    /// Clones are only handed out under the map lock, so a count of two
    /// (the map and `pair_lock`) cannot grow while it is checked.
    async fn release_pair_lock(&self, key: (i64, i64), pair_lock: Arc<Mutex<()>>) {
        let mut map = self.pair_locks.lock().await;
        let current = map.get(&key).is_some_and(|lock| Arc::ptr_eq(lock, &pair_lock));
        if current && Arc::strong_count(&pair_lock) <= 2 {
            map.remove(&key);
        }
    }
}

/// Price timeline and percentage change for one (product, vendor) pair.
#[derive(Debug, Clone)]
pub struct PriceHistoryAggregator {
    catalog: Catalog,
}

impl PriceHistoryAggregator {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }

    pub async fn history(
        &self,
        prod_id: i64,
        vendor_id: i64,
        range: &DateRange,
    ) -> Result<PriceHistory, StorageError> {
        let rows = self.catalog.offers_between(prod_id, vendor_id, range).await?;
        Ok(PriceHistory::from_offers(prod_id, vendor_id, &rows))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    pub store_retry: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            store_retry: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products: usize,
    pub inserted: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub invalid: usize,
    pub errors: usize,
    pub failed_products: usize,
    pub cancelled: bool,
}

impl CycleSummary {
    fn start(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            finished_at: now,
            products: 0,
            inserted: 0,
            ignored: 0,
            rejected: 0,
            invalid: 0,
            errors: 0,
            failed_products: 0,
            cancelled: false,
        }
    }
}

/// Background loop feeding upstream offers for every product into the [`Reconciler`].
pub struct SyncPoller {
    catalog: Catalog,
    feed: Arc<dyn OfferFeed>,
    reconciler: Reconciler,
    settings: PollerSettings,
}

impl SyncPoller {
    pub fn new(catalog: Catalog, feed: Arc<dyn OfferFeed>, settings: PollerSettings) -> Self {
        let reconciler = Reconciler::new(catalog.clone());
        Self {
            catalog,
            feed,
            reconciler,
            settings,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Runs cycles until `cancel` fires.
    ///
    /// A datastore error while listing products backs off for
    /// `store_retry` and restarts the cycle instead of ending the loop.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            "sync poller started"
        );
        while !cancel.is_cancelled() {
            let delay = match self.run_cycle(&cancel).await {
                Ok(summary) if summary.cancelled => break,
                Ok(_) => self.settings.poll_interval,
                Err(err) => {
                    warn!(%err, "datastore unavailable; retrying");
                    self.settings.store_retry
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!("sync poller stopped");
    }

    /// One pass over every known product.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleSummary, StorageError> {
        let run_id = Uuid::new_v4();
        self.cycle(run_id, cancel)
            .instrument(info_span!("sync_cycle", %run_id))
            .await
    }

    async fn cycle(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<CycleSummary, StorageError> {
        let mut summary = CycleSummary::start(run_id);
        let products = self.catalog.list_products().await?;

        for product in &products {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let fetched = tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.feed.fetch_offers(product.prod_id) => Some(result),
            };
            let Some(fetched) = fetched else {
                summary.cancelled = true;
                break;
            };
            summary.products += 1;

            let items = match fetched {
                Ok(items) => items,
                Err(err) => {
                    warn!(prod_id = product.prod_id, %err, "offer feed request failed");
                    summary.failed_products += 1;
                    continue;
                }
            };

            for item in items {
                let observed = match item.observe(product.prod_id) {
                    Ok(observed) => observed,
                    Err(err) => {
                        warn!(prod_id = product.prod_id, vendor_id = item.id, %err, "skipping malformed offer");
                        summary.invalid += 1;
                        continue;
                    }
                };
                match self.reconciler.reconcile(&observed).await {
                    Ok(ReconcileOutcome::Inserted { .. }) => summary.inserted += 1,
                    Ok(ReconcileOutcome::Ignored(IgnoreReason::Rejected)) => summary.rejected += 1,
                    Ok(ReconcileOutcome::Ignored(_)) => summary.ignored += 1,
                    Err(err @ ReconcileError::Consistency { .. }) => {
                        error!(%err, "offer consistency violation");
                        summary.errors += 1;
                    }
                    Err(err) => {
                        warn!(prod_id = product.prod_id, vendor_id = item.id, %err, "reconciliation failed");
                        summary.errors += 1;
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            products = summary.products,
            inserted = summary.inserted,
            ignored = summary.ignored,
            rejected = summary.rejected,
            failed_products = summary.failed_products,
            cancelled = summary.cancelled,
            "sync cycle finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use offerbook_core::{NewProduct, Product};
    use offerbook_storage::OfferFilter;
    use offerbook_upstream::{UpstreamError, UpstreamOffer};

    async fn catalog() -> Catalog {
        let catalog = Catalog::in_memory().await.expect("in-memory catalog");
        catalog.migrate().await.expect("migrations");
        catalog
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
            + chrono::Duration::seconds(secs)
    }

    fn observed(vendor_id: i64, price: i64, stock: i64) -> ObservedOffer {
        ObservedOffer::new(1, vendor_id, price, stock).unwrap()
    }

    async fn active_for(catalog: &Catalog, vendor_id: i64) -> Vec<Offer> {
        catalog
            .list_offers(OfferFilter::Pair { prod_id: 1, vendor_id })
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.active)
            .collect()
    }

    #[derive(Default)]
    struct FakeFeed {
        offers: StdMutex<HashMap<i64, Vec<UpstreamOffer>>>,
        failing: StdMutex<Vec<i64>>,
        calls: AtomicUsize,
        cancel_on_call: Option<CancellationToken>,
    }

    impl FakeFeed {
        fn with_offers(self, prod_id: i64, offers: Vec<UpstreamOffer>) -> Self {
            self.offers.lock().unwrap().insert(prod_id, offers);
            self
        }

        fn failing_for(self, prod_id: i64) -> Self {
            self.failing.lock().unwrap().push(prod_id);
            self
        }
    }

    #[async_trait]
    impl OfferFeed for FakeFeed {
        async fn fetch_offers(&self, prod_id: i64) -> Result<Vec<UpstreamOffer>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_call {
                cancel.cancel();
            }
            if self.failing.lock().unwrap().contains(&prod_id) {
                return Err(UpstreamError::HttpStatus {
                    status: 503,
                    url: format!("fake://products/{prod_id}/offers"),
                });
            }
            Ok(self.offers.lock().unwrap().get(&prod_id).cloned().unwrap_or_default())
        }

        async fn register_product(&self, _product: &Product) -> Result<(), UpstreamError> {
            Ok(())
        }
    }

    fn upstream(id: i64, price: i64, items_in_stock: i64) -> UpstreamOffer {
        UpstreamOffer { id, price, items_in_stock }
    }

    async fn add_product(catalog: &Catalog, name: &str) -> Product {
        catalog
            .insert_product(&NewProduct::new(name, "test product").unwrap())
            .await
            .unwrap()
    }

    fn fast_settings() -> PollerSettings {
        PollerSettings {
            poll_interval: Duration::from_secs(3600),
            store_retry: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn reobserving_identical_offer_is_idempotent() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());

        let first = reconciler.reconcile(&observed(1000, 100, 10)).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Inserted { superseded: None, .. }));
        let second = reconciler.reconcile(&observed(1000, 100, 10)).await.unwrap();
        assert_eq!(second, ReconcileOutcome::Ignored(IgnoreReason::Unchanged));

        let rows = catalog.list_offers(OfferFilter::All).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].active);
    }

    #[tokio::test]
    async fn zero_stock_is_never_persisted() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());

        let outcome = reconciler.reconcile(&observed(1000, 100, 0)).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored(IgnoreReason::OutOfStock));
        assert!(catalog.list_offers(OfferFilter::All).await.unwrap().is_empty());

        reconciler.reconcile(&observed(1000, 100, 4)).await.unwrap();
        let before = catalog.list_offers(OfferFilter::Active).await.unwrap();
        reconciler.reconcile(&observed(1000, 80, 0)).await.unwrap();
        assert_eq!(catalog.list_offers(OfferFilter::Active).await.unwrap(), before);
    }

    #[tokio::test]
    async fn changed_offer_supersedes_active_row() {
        let catalog = catalog().await;
        let apple = add_product(&catalog, "Apple").await;
        assert_eq!(apple.prod_id, 1);
        let reconciler = Reconciler::new(catalog.clone());

        let ReconcileOutcome::Inserted { offer: first, .. } =
            reconciler.reconcile(&observed(1000, 100, 10)).await.unwrap()
        else {
            panic!("first observation should insert");
        };
        assert!(first.active);

        let ReconcileOutcome::Inserted { offer: second, superseded } =
            reconciler.reconcile(&observed(1000, 300, 30)).await.unwrap()
        else {
            panic!("changed price should insert");
        };
        assert_eq!(superseded, Some(first.internal_id));

        let active = catalog.list_offers(OfferFilter::Active).await.unwrap();
        assert_eq!(active, vec![second.clone()]);
        assert_eq!(active[0].price, 300);

        let all = catalog.list_offers(OfferFilter::Product(apple.prod_id)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!all.iter().find(|o| o.internal_id == first.internal_id).unwrap().active);
    }

    #[tokio::test]
    async fn stock_change_alone_creates_history_point() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        reconciler.reconcile(&observed(1000, 100, 10)).await.unwrap();
        let outcome = reconciler.reconcile(&observed(1000, 100, 9)).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Inserted { superseded: Some(_), .. }));
        assert_eq!(catalog.list_offers(OfferFilter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn at_most_one_active_offer_per_pair_after_any_sequence() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        let sequence = [
            (1000, 100, 10),
            (1000, 100, 10),
            (2000, 90, 1),
            (1000, 120, 0),
            (1000, 120, 3),
            (2000, 90, 2),
            (1000, 100, 10),
            (1000, 100, 10),
        ];
        for (vendor_id, price, stock) in sequence {
            reconciler.reconcile(&observed(vendor_id, price, stock)).await.unwrap();
            assert!(active_for(&catalog, 1000).await.len() <= 1);
            assert!(active_for(&catalog, 2000).await.len() <= 1);
        }
        assert_eq!(active_for(&catalog, 1000).await[0].price, 100);
        assert_eq!(catalog.list_offers(OfferFilter::All).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn concurrent_observations_keep_single_active_offer() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        let tasks: Vec<_> = (1..=8)
            .map(|price| {
                let reconciler = reconciler.clone();
                tokio::spawn(async move { reconciler.reconcile(&observed(1000, price, 5)).await })
            })
            .collect();
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Inserted { .. }));
        }
        assert_eq!(active_for(&catalog, 1000).await.len(), 1);
        assert_eq!(catalog.list_offers(OfferFilter::All).await.unwrap().len(), 8);
        assert!(reconciler.pair_locks.lock().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reconciles_while_products_are_written_on_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("offerbook.db").display());
        let catalog = Catalog::connect(&url).await.unwrap();
        catalog.migrate().await.unwrap();

        let writer = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let product = NewProduct::new(&format!("Product {i}"), "bulk").unwrap();
                    catalog.insert_product(&product).await.unwrap();
                }
            })
        };
        let reconciler = Reconciler::new(catalog.clone());
        for price in 1..=200 {
            let outcome = reconciler.reconcile(&observed(1000, price, 5)).await.unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Inserted { .. }), "price {price}");
        }
        writer.await.unwrap();

        assert_eq!(catalog.list_products().await.unwrap().len(), 200);
        assert_eq!(catalog.list_offers(OfferFilter::All).await.unwrap().len(), 200);
        assert_eq!(active_for(&catalog, 1000).await.len(), 1);
    }

    #[tokio::test]
    async fn rejected_insert_rolls_back_deactivation() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        reconciler.reconcile(&observed(1000, 100, 10)).await.unwrap();

        // Bypasses constructor validation so the datastore CHECK fires mid-transaction.
        let corrupt = ObservedOffer {
            prod_id: 1,
            vendor_id: 1000,
            price: 90,
            items_in_stock: -5,
        };
        let outcome = reconciler.reconcile(&corrupt).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Ignored(IgnoreReason::Rejected));

        let active = active_for(&catalog, 1000).await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].price, 100);
        assert_eq!(catalog.list_offers(OfferFilter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_active_rows_are_reported_not_repaired() {
        let catalog = catalog().await;
        sqlx::query("DROP INDEX offers_single_active")
            .execute(catalog.pool())
            .await
            .unwrap();
        for price in [100, 200] {
            sqlx::query(
                "INSERT INTO offers (vendor_id, price, items_in_stock, active, date_created, prod_id)
                 VALUES (1000, ?, 5, 1, ?, 1)",
            )
            .bind(price)
            .bind(at(price))
            .execute(catalog.pool())
            .await
            .unwrap();
        }

        let err = Reconciler::new(catalog.clone())
            .reconcile(&observed(1000, 300, 5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Consistency { prod_id: 1, vendor_id: 1000, found: 2 }
        ));
        assert_eq!(active_for(&catalog, 1000).await.len(), 2);
    }

    #[tokio::test]
    async fn rising_history_is_ordered_with_change_from_first() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        reconciler.reconcile_at(&observed(1000, 100, 10), at(0)).await.unwrap();
        reconciler.reconcile_at(&observed(1000, 300, 10), at(60)).await.unwrap();

        let range = DateRange { start: at(-3600), end: at(3600) };
        let history = PriceHistoryAggregator::new(catalog)
            .history(1, 1000, &range)
            .await
            .unwrap();
        let prices: Vec<i64> = history.history.iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![100, 300]);
        assert!(history.history[0].date_created < history.history[1].date_created);
        assert_eq!(history.price_change, 200.0);
    }

    #[tokio::test]
    async fn falling_history_uses_asymmetric_formula() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        reconciler.reconcile_at(&observed(1000, 300, 10), at(0)).await.unwrap();
        reconciler.reconcile_at(&observed(1000, 100, 10), at(60)).await.unwrap();

        let range = DateRange { start: at(0), end: at(60) };
        let history = PriceHistoryAggregator::new(catalog)
            .history(1, 1000, &range)
            .await
            .unwrap();
        // -(100 - 300) / 100 * 100
        assert_eq!(history.price_change, 200.0);
        assert_eq!(history.history.len(), 2);
    }

    #[tokio::test]
    async fn empty_interval_yields_empty_history() {
        let catalog = catalog().await;
        let reconciler = Reconciler::new(catalog.clone());
        reconciler.reconcile_at(&observed(1000, 300, 10), at(0)).await.unwrap();

        let range = DateRange { start: at(10), end: at(5) };
        let history = PriceHistoryAggregator::new(catalog)
            .history(1, 1000, &range)
            .await
            .unwrap();
        assert!(history.history.is_empty());
        assert_eq!(history.price_change, 0.0);
    }

    #[tokio::test]
    async fn cycle_continues_past_failing_products() {
        let catalog = catalog().await;
        let apple = add_product(&catalog, "Apple").await;
        let banana = add_product(&catalog, "Banana").await;
        let cherry = add_product(&catalog, "Cherry").await;
        let feed = FakeFeed::default()
            .with_offers(apple.prod_id, vec![upstream(1000, 100, 10), upstream(2000, 50, 0)])
            .failing_for(banana.prod_id)
            .with_offers(cherry.prod_id, vec![upstream(1000, 70, 1), upstream(3000, 1, -2)]);
        let feed = Arc::new(feed);
        let poller = SyncPoller::new(catalog.clone(), feed.clone(), fast_settings());

        let summary = poller.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.products, 3);
        assert_eq!(summary.failed_products, 1);
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.invalid, 1);
        assert!(!summary.cancelled);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);

        let again = poller.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.ignored, 3);
        assert_eq!(catalog.list_offers(OfferFilter::Active).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_products() {
        let catalog = catalog().await;
        for name in ["Apple", "Banana", "Cherry"] {
            add_product(&catalog, name).await;
        }
        let cancel = CancellationToken::new();
        let feed = FakeFeed {
            cancel_on_call: Some(cancel.clone()),
            ..FakeFeed::default()
        };
        let feed = Arc::new(feed);
        let poller = SyncPoller::new(catalog, feed.clone(), fast_settings());

        let summary = poller.run_cycle(&cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_promptly_during_sleep() {
        let catalog = catalog().await;
        add_product(&catalog, "Apple").await;
        let feed = Arc::new(FakeFeed::default().with_offers(1, vec![upstream(1000, 100, 10)]));
        let cancel = CancellationToken::new();
        let handle = SyncPoller::new(catalog.clone(), feed.clone(), fast_settings()).spawn(cancel.clone());

        for _ in 0..200 {
            if feed.calls.load(Ordering::SeqCst) > 0
                && !catalog.list_offers(OfferFilter::All).await.unwrap().is_empty()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller should stop well before the next cycle")
            .unwrap();
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_loop_waits_for_uninitialized_store() {
        let catalog = Catalog::in_memory().await.unwrap();
        let feed = Arc::new(FakeFeed::default());
        let cancel = CancellationToken::new();
        let handle = SyncPoller::new(catalog.clone(), feed.clone(), fast_settings()).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "missing tables must not end the loop");

        catalog.migrate().await.unwrap();
        add_product(&catalog, "Apple").await;
        for _ in 0..200 {
            if feed.calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("poller stops")
            .unwrap();
    }

    #[test]
    fn missing_upstream_url_is_a_configuration_error() {
        let config = SyncConfig {
            upstream_base_url: None,
            ..SyncConfig::from_env()
        };
        assert!(config.upstream_config().is_err());

        let config = SyncConfig {
            upstream_base_url: Some("http://offers.local".into()),
            upstream_credential: Some("token".into()),
            ..config
        };
        let upstream = config.upstream_config().unwrap();
        assert_eq!(upstream.base_url, "http://offers.local");
        assert_eq!(upstream.credential.as_deref(), Some("token"));
    }
}
