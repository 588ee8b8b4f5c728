//! Multi-relay sync entry point.
//!
//! [`NegentropySync::sync`] runs one session per relay concurrently, merges
//! every relay's `need`/`have` and optionally fetches the missing events.
//! A relay failing never fails the call; only the two preconditions (a cache
//! adapter and at least one relay) do.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use nostr::{Event, NegentropyStorage};
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::capability::{CapabilityCache, RelayCapability, now_millis, verdict_for_failure};
use super::config::SyncConfig;
use super::session::{SessionState, SessionStats, SyncSession};
use super::transport::{SyncRelay, normalize_url};
use crate::cache::{CacheAdapter, RelayStatusUpdate};
use crate::error::{ClientError, Result};
use crate::pool::RelayPool;
use crate::relay::RelayConnection;

/// Ids requested per auto-fetch `REQ`.
pub const FETCH_BATCH_SIZE: usize = 500;

/// Filter used by capability probes; matches nothing.
const PROBE_FILTER_ID: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Called once for every relay whose sync failed.
pub type RelayErrorCallback = Arc<dyn Fn(&str, &ClientError) + Send + Sync>;

/// Per-call options. Unset fields fall back to the [`SyncConfig`].
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Relays to use, by URL. Unknown URLs get a fresh connection.
    pub relay_urls: Option<Vec<String>>,
    /// Explicit relay set; takes precedence over `relay_urls`.
    pub relays: Option<Vec<Arc<dyn SyncRelay>>>,
    pub connect_timeout: Option<Duration>,
    pub auto_fetch: Option<bool>,
    pub frame_size_limit: Option<u64>,
    pub session_timeout: Option<Duration>,
    pub fetch_timeout: Option<Duration>,
    /// Bound on the whole call; partial results are still returned.
    pub overall_timeout: Option<Duration>,
    /// Probe even when a fresh capability verdict exists.
    pub skip_capability_cache: bool,
    pub on_relay_error: Option<RelayErrorCallback>,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relay_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relay_urls = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    pub fn relays(mut self, relays: Vec<Arc<dyn SyncRelay>>) -> Self {
        self.relays = Some(relays);
        self
    }

    pub fn auto_fetch(mut self, enabled: bool) -> Self {
        self.auto_fetch = Some(enabled);
        self
    }

    pub fn overall_timeout(mut self, timeout: Duration) -> Self {
        self.overall_timeout = Some(timeout);
        self
    }

    pub fn on_relay_error(
        mut self,
        callback: impl Fn(&str, &ClientError) + Send + Sync + 'static,
    ) -> Self {
        self.on_relay_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("relay_urls", &self.relay_urls)
            .field(
                "relays",
                &self
                    .relays
                    .as_ref()
                    .map(|relays| relays.iter().map(|relay| relay.url()).collect::<Vec<_>>()),
            )
            .field("connect_timeout", &self.connect_timeout)
            .field("auto_fetch", &self.auto_fetch)
            .field("frame_size_limit", &self.frame_size_limit)
            .field("session_timeout", &self.session_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("overall_timeout", &self.overall_timeout)
            .field("skip_capability_cache", &self.skip_capability_cache)
            .field("on_relay_error", &self.on_relay_error.is_some())
            .finish()
    }
}

/// How one relay's part of a sync ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Every session completed
    Synced,
    /// A session timed out or failed; results are partial
    Partial,
    /// Skipped because of a fresh negative capability verdict
    Unsupported,
    /// Never connected within the connect timeout
    Unreachable,
}

/// Per-relay summary of a sync call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub url: String,
    pub outcome: RelayOutcome,
    pub need: usize,
    pub have: usize,
    pub fetched: usize,
    pub stats: SessionStats,
    pub error: Option<String>,
}

impl RelayReport {
    fn new(url: &str, outcome: RelayOutcome) -> Self {
        Self {
            url: url.to_string(),
            outcome,
            need: 0,
            have: 0,
            fetched: 0,
            stats: SessionStats::default(),
            error: None,
        }
    }
}

/// Merged result of a sync call.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    /// Events fetched from relays, deduplicated by id
    pub events: Vec<Event>,
    /// Hex ids relays hold that the cache lacks
    pub need: BTreeSet<String>,
    /// Hex ids the cache holds that at least one relay lacks
    pub have: BTreeSet<String>,
    pub reports: Vec<RelayReport>,
}

/// Settings resolved for one call.
struct Plan {
    connect_timeout: Duration,
    session_timeout: Duration,
    fetch_timeout: Duration,
    frame_size_limit: u64,
    auto_fetch: bool,
    skip_capability_cache: bool,
    deadline: Option<Instant>,
}

impl Plan {
    /// `limit` capped by the time left before the overall deadline.
    fn bounded(&self, limit: Duration) -> Duration {
        match self.deadline {
            Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
            None => limit,
        }
    }
}

/// Local storage for one filter, taken once per call and shared by every
/// relay so all sessions compare against the same set.
struct Snapshot {
    filter: Value,
    storage: std::result::Result<NegentropyStorage, String>,
}

async fn take_snapshots(cache: &Arc<dyn CacheAdapter>, filters: &[Value]) -> Vec<Snapshot> {
    let mut snapshots = Vec::with_capacity(filters.len());
    for filter in filters {
        let storage = match cache.query(std::slice::from_ref(filter)).await {
            Ok(events) => Ok(NegentropyStorage::from_events(&events)),
            Err(error) => {
                warn!("querying the cache for {} failed: {}", filter, error);
                Err(error.to_string())
            }
        };
        snapshots.push(Snapshot {
            filter: filter.clone(),
            storage,
        });
    }
    snapshots
}

struct RelayRun {
    report: RelayReport,
    need: HashSet<String>,
    have: HashSet<String>,
    events: Vec<Event>,
    error: Option<ClientError>,
}

impl RelayRun {
    fn skipped(url: &str, outcome: RelayOutcome) -> Self {
        Self {
            report: RelayReport::new(url, outcome),
            need: HashSet::new(),
            have: HashSet::new(),
            events: Vec::new(),
            error: None,
        }
    }

    /// Record `error`; only the first failure is kept.
    fn fail(&mut self, error: ClientError) {
        self.report.outcome = RelayOutcome::Partial;
        if self.error.is_none() {
            self.report.error = Some(error.to_string());
            self.error = Some(error);
        }
    }
}

/// NIP-77 sync across a set of relays, backed by a local cache.
#[derive(Clone)]
pub struct NegentropySync {
    relays: Vec<Arc<dyn SyncRelay>>,
    cache: Option<Arc<dyn CacheAdapter>>,
    config: SyncConfig,
}

impl NegentropySync {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            relays: Vec::new(),
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheAdapter>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_relays(mut self, relays: Vec<Arc<dyn SyncRelay>>) -> Self {
        self.relays = relays;
        self
    }

    pub fn add_relay(&mut self, relay: Arc<dyn SyncRelay>) {
        if self.find_relay(relay.url()).is_none() {
            self.relays.push(relay);
        }
    }

    /// Add every relay currently in `pool`.
    pub async fn add_pool(&mut self, pool: &RelayPool) {
        for relay in pool.relays().await {
            self.add_relay(relay);
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheAdapter>> {
        self.cache.as_ref()
    }

    pub fn relays(&self) -> &[Arc<dyn SyncRelay>] {
        &self.relays
    }

    fn find_relay(&self, url: &str) -> Option<Arc<dyn SyncRelay>> {
        let wanted = normalize_url(url);
        self.relays
            .iter()
            .find(|relay| relay.url() == wanted)
            .cloned()
    }

    fn capabilities(&self) -> Result<CapabilityCache> {
        let cache = self.cache.clone().ok_or(ClientError::CacheRequired)?;
        Ok(CapabilityCache::new(cache, self.config.capability_ttl))
    }

    /// Reconcile the cache against relays for `filters`.
    ///
    /// Each filter runs as its own negentropy session per relay. Fails only
    /// when no cache adapter is configured or no relay is available.
    pub async fn sync(&self, filters: Vec<Value>, options: SyncOptions) -> Result<SyncResult> {
        let cache = self.cache.clone().ok_or(ClientError::CacheRequired)?;
        let capabilities = self.capabilities()?;
        let relays = self.resolve_relays(&options)?;

        let plan = Plan {
            connect_timeout: options
                .connect_timeout
                .unwrap_or(self.config.connect_timeout),
            session_timeout: options
                .session_timeout
                .unwrap_or(self.config.session_timeout),
            fetch_timeout: options.fetch_timeout.unwrap_or(self.config.fetch_timeout),
            frame_size_limit: options
                .frame_size_limit
                .unwrap_or(self.config.frame_size_limit),
            auto_fetch: options.auto_fetch.unwrap_or(self.config.auto_fetch),
            skip_capability_cache: options.skip_capability_cache,
            deadline: options
                .overall_timeout
                .map(|timeout| Instant::now() + timeout),
        };

        debug!(
            relays = relays.len(),
            filters = filters.len(),
            "starting negentropy sync"
        );
        let snapshots = take_snapshots(&cache, &filters).await;

        let runs = join_all(relays.iter().map(|relay| {
            let relay = Arc::clone(relay);
            let cache = Arc::clone(&cache);
            let capabilities = capabilities.clone();
            let filters = &filters;
            let snapshots = &snapshots;
            let plan = &plan;
            let on_error = options.on_relay_error.clone();
            async move {
                let run =
                    sync_relay(relay, filters, snapshots, plan, &cache, &capabilities).await;
                if let Some(error) = &run.error {
                    warn!("sync with {} failed: {}", run.report.url, error);
                    if let Some(callback) = on_error {
                        callback(&run.report.url, error);
                    }
                }
                run
            }
        }))
        .await;

        let mut result = SyncResult::default();
        let mut seen = HashSet::new();
        for run in runs {
            result.need.extend(run.need);
            result.have.extend(run.have);
            for event in run.events {
                if seen.insert(event.id.clone()) {
                    result.events.push(event);
                }
            }
            result.reports.push(run.report);
        }
        let need = &result.need;
        result.have.retain(|id| !need.contains(id));

        info!(
            relays = result.reports.len(),
            need = result.need.len(),
            have = result.have.len(),
            fetched = result.events.len(),
            "negentropy sync finished"
        );
        Ok(result)
    }

    pub(crate) fn resolve_relays(&self, options: &SyncOptions) -> Result<Vec<Arc<dyn SyncRelay>>> {
        let relays = if let Some(relays) = &options.relays {
            relays.clone()
        } else if let Some(urls) = &options.relay_urls {
            let mut resolved = Vec::with_capacity(urls.len());
            for url in urls {
                match self.find_relay(url) {
                    Some(relay) => resolved.push(relay),
                    None => match RelayConnection::new(url) {
                        Ok(connection) => {
                            let connection = Arc::new(connection);
                            let connecting = Arc::clone(&connection);
                            tokio::spawn(async move {
                                if let Err(error) = connecting.connect().await {
                                    debug!("connect to {} failed: {}", connecting.url(), error);
                                }
                            });
                            resolved.push(connection as Arc<dyn SyncRelay>);
                        }
                        Err(error) => warn!("skipping relay {}: {}", url, error),
                    },
                }
            }
            resolved
        } else {
            self.relays.clone()
        };

        if relays.is_empty() {
            return Err(ClientError::NoRelays);
        }
        Ok(relays)
    }

    /// Whether the known relay at `url` speaks NIP-77, using the cached
    /// verdict when fresh.
    ///
    /// A relay that cannot be reached yields the liveness error and nothing
    /// is cached.
    pub async fn check_relay_support(&self, url: &str) -> Result<bool> {
        let relay = self
            .find_relay(url)
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown relay: {url}")))?;
        self.probe_support(&relay).await
    }

    async fn probe_support(&self, relay: &Arc<dyn SyncRelay>) -> Result<bool> {
        let capabilities = self.capabilities()?;
        if let Some(capability) = capabilities.fresh(relay.url()).await? {
            return Ok(capability.supports_negentropy);
        }

        relay
            .wait_until_connected(self.config.connect_timeout)
            .await?;

        let probe = SyncSession::new(
            Arc::clone(relay),
            NegentropyStorage::default(),
            json!({ "ids": [PROBE_FILTER_ID] }),
            self.config.frame_size_limit,
            self.config.session_timeout,
        )?;
        let outcome = probe.run().await;
        match outcome.error {
            None => {
                capabilities
                    .put(relay.url(), &RelayCapability::supported(relay.url()))
                    .await?;
                Ok(true)
            }
            Some(error) => match verdict_for_failure(relay.url(), &error) {
                Some(verdict) => {
                    capabilities.put(relay.url(), &verdict).await?;
                    Ok(false)
                }
                None => Err(error),
            },
        }
    }

    /// Known relays that support NIP-77. Unreachable relays are left out.
    pub async fn negentropy_relays(&self) -> Result<Vec<Arc<dyn SyncRelay>>> {
        let checks = join_all(self.relays.iter().map(|relay| async move {
            (Arc::clone(relay), self.probe_support(relay).await)
        }))
        .await;

        let mut supported = Vec::new();
        for (relay, check) in checks {
            match check {
                Ok(true) => supported.push(relay),
                Ok(false) => {}
                Err(ClientError::CacheRequired) => return Err(ClientError::CacheRequired),
                Err(error) => debug!("support check for {} failed: {}", relay.url(), error),
            }
        }
        Ok(supported)
    }

    pub async fn relay_capability(&self, url: &str) -> Result<Option<RelayCapability>> {
        self.capabilities()?.get(&normalize_url(url)).await
    }

    /// Drop the cached verdict for `url`; other relay metadata is kept.
    pub async fn clear_capability_cache(&self, url: &str) -> Result<()> {
        self.capabilities()?.clear(&normalize_url(url)).await
    }
}

async fn sync_relay(
    relay: Arc<dyn SyncRelay>,
    filters: &[Value],
    snapshots: &[Snapshot],
    plan: &Plan,
    cache: &Arc<dyn CacheAdapter>,
    capabilities: &CapabilityCache,
) -> RelayRun {
    let url = relay.url().to_string();

    if !relay.is_connected() {
        let wait = plan.bounded(plan.connect_timeout);
        if let Err(error) = relay.wait_until_connected(wait).await {
            warn!("relay {} did not connect in time, skipping: {}", url, error);
            record_connect_failure(cache, &url).await;
            return RelayRun::skipped(&url, RelayOutcome::Unreachable);
        }
    }
    record_connected(cache, &url).await;

    if !plan.skip_capability_cache {
        match capabilities.fresh(&url).await {
            Ok(Some(capability)) if !capability.supports_negentropy => {
                debug!("skipping {}: cached as not supporting negentropy", url);
                return RelayRun::skipped(&url, RelayOutcome::Unsupported);
            }
            Ok(_) => {}
            Err(error) => debug!("capability lookup for {} failed: {}", url, error),
        }
    }

    let mut run = RelayRun::skipped(&url, RelayOutcome::Synced);
    let mut completed_sessions = 0usize;

    for snapshot in snapshots {
        let storage = match &snapshot.storage {
            Ok(storage) => storage.clone(),
            Err(error) => {
                run.fail(ClientError::Cache(error.clone()));
                break;
            }
        };

        let session = match SyncSession::new(
            Arc::clone(&relay),
            storage,
            snapshot.filter.clone(),
            plan.frame_size_limit,
            plan.bounded(plan.session_timeout),
        ) {
            Ok(session) => session,
            Err(error) => {
                run.fail(error);
                break;
            }
        };

        let outcome = session.run().await;
        run.report.stats.rounds += outcome.stats.rounds;
        run.report.stats.bytes_sent += outcome.stats.bytes_sent;
        run.report.stats.bytes_received += outcome.stats.bytes_received;
        run.need.extend(outcome.need);
        run.have.extend(outcome.have);

        match outcome.error {
            None => completed_sessions += 1,
            Some(error) => {
                if let Some(verdict) = verdict_for_failure(&url, &error)
                    && let Err(cache_error) = capabilities.put(&url, &verdict).await
                {
                    debug!("storing capability for {} failed: {}", url, cache_error);
                }
                if outcome.state == SessionState::TimedOut {
                    debug!("session with {} timed out; keeping partial results", url);
                }
                run.fail(error);
                break;
            }
        }
    }

    if completed_sessions > 0
        && run.error.is_none()
        && let Err(error) = capabilities
            .put(&url, &RelayCapability::supported(url.as_str()))
            .await
    {
        debug!("storing capability for {} failed: {}", url, error);
    }

    run.report.need = run.need.len();
    run.report.have = run.have.len();

    if plan.auto_fetch && !run.need.is_empty() {
        match fetch_needed(&relay, &run.need, filters, plan, cache).await {
            Ok(events) => {
                run.report.fetched = events.len();
                run.events = events;
            }
            Err(error) => run.fail(error),
        }
    }

    run
}

/// Fetch `need` from `relay` in batches and write every returned event to the cache.
async fn fetch_needed(
    relay: &Arc<dyn SyncRelay>,
    need: &HashSet<String>,
    filters: &[Value],
    plan: &Plan,
    cache: &Arc<dyn CacheAdapter>,
) -> Result<Vec<Event>> {
    let mut ids: Vec<&String> = need.iter().collect();
    ids.sort();

    let mut events = Vec::new();
    for batch in ids.chunks(FETCH_BATCH_SIZE) {
        let wait = plan.bounded(plan.fetch_timeout);
        if wait.is_zero() {
            return Err(ClientError::Timeout(format!(
                "sync deadline passed before fetching from {}",
                relay.url()
            )));
        }
        let fetched = relay
            .fetch_events(vec![json!({ "ids": batch })], wait)
            .await?;
        events.extend(fetched.into_iter().filter(|event| need.contains(&event.id)));
    }

    for event in &events {
        cache
            .set_event(event, filters, Some(relay.url()))
            .await?;
    }
    debug!("fetched {} of {} needed events from {}", events.len(), need.len(), relay.url());
    Ok(events)
}

async fn record_connected(cache: &Arc<dyn CacheAdapter>, url: &str) {
    let update = RelayStatusUpdate {
        last_connected_at: Some(now_millis()),
        consecutive_failures: Some(0),
        ..RelayStatusUpdate::default()
    };
    if let Err(error) = cache.update_relay_status(url, update).await {
        debug!("updating relay status for {} failed: {}", url, error);
    }
}

async fn record_connect_failure(cache: &Arc<dyn CacheAdapter>, url: &str) {
    let failures = match cache.get_relay_status(url).await {
        Ok(status) => status.map_or(0, |status| status.consecutive_failures),
        Err(_) => 0,
    };
    let update = RelayStatusUpdate {
        consecutive_failures: Some(failures.saturating_add(1)),
        ..RelayStatusUpdate::default()
    };
    if let Err(error) = cache.update_relay_status(url, update).await {
        debug!("updating relay status for {} failed: {}", url, error);
    }
}
