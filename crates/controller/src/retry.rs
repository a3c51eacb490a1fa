//! Sensor retry campaigns: when a plot's sensor is DOWN at irrigation start,
//! poll it on a fixed interval for a bounded number of attempts, then either
//! start irrigating or raise an alert.
//!
//! Each campaign is its own tokio task holding a durable per-plot lease, so
//! at most one campaign runs per plot and a crashed campaign's claim simply
//! expires. The attempt counter lives in the campaign, never on the
//! scheduler. A poll that cannot reload the plot is not an attempt.
//!
//! ## Per-plot campaign
//!
//! ```text
//!           ┌──[sensor DOWN, attempt < max]── sleep(interval) ──┐
//!           ▼                                                   │
//! start ─▶ poll ──[sensor UP]──▶ Recovered (irrigating)         │
//!           │                                                   │
//!           └──[sensor DOWN]── record attempt ──────────────────┘
//!                    │
//!                    └──[attempt == max]──▶ Exhausted (alert raised)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::model::{now, to_millis};
use crate::state::SharedState;
use crate::store::PlotStore;

pub const DEFAULT_TRIES_COUNT: u32 = 10;
pub const DEFAULT_INTERVAL_SEC: u64 = 30;

/// Slack on top of two intervals before an unrenewed lease expires.
const LEASE_GRACE: Duration = Duration::from_secs(30);

const ESCALATION_BACKOFF_START: Duration = Duration::from_millis(500);
const ESCALATION_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TRIES_COUNT,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SEC),
        }
    }
}

impl RetrySettings {
    pub fn lease_ttl(&self) -> Duration {
        self.interval.saturating_mul(2).saturating_add(LEASE_GRACE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignOutcome {
    /// Sensor came back; the plot is irrigating. `attempts` failed polls
    /// preceded the recovery.
    Recovered { attempts: u32 },
    /// Every poll failed; the plot carries an alert.
    Exhausted { attempts: u32 },
    Cancelled { attempts: u32 },
    PlotRemoved,
    /// Another campaign took over an expired lease.
    LeaseLost { attempts: u32 },
}

// ---------------------------------------------------------------------------
// Campaign loop
// ---------------------------------------------------------------------------

enum Tick {
    Recovered,
    /// Sensor read DOWN. Carries the error if the attempt write failed; the
    /// attempt still counts.
    StillDown(Option<anyhow::Error>),
    PlotGone,
}

/// Reload the plot and either apply the success transition or record
/// attempt number `attempt`. An `Err` means the sensor was never observed
/// and the tick must not count.
async fn tick(store: &dyn PlotStore, plot_id: i64, attempt: u32) -> Result<Tick> {
    let Some(plot) = store.load_plot(plot_id).await? else {
        return Ok(Tick::PlotGone);
    };

    if plot.sensor_is_up() {
        // false only if something else already started irrigation
        store.mark_irrigating(plot_id, now()).await?;
        return Ok(Tick::Recovered);
    }

    match store.record_attempt(plot_id, attempt, now()).await {
        Ok(true) => Ok(Tick::StillDown(None)),
        Ok(false) => Ok(Tick::PlotGone),
        Err(e) => Ok(Tick::StillDown(Some(e))),
    }
}

/// Resolves once cancellation is requested or the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

/// Returns false if cancellation arrived first.
async fn sleep_or_cancel(period: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = cancelled(cancel) => false,
    }
}

/// Run one bounded polling campaign for `plot_id` while holding the lease
/// owned by `owner`. Never fails: the outcome is persisted on the plot.
pub async fn run_campaign(
    store: &dyn PlotStore,
    shared: &SharedState,
    plot_id: i64,
    owner: &str,
    settings: RetrySettings,
    cancel: &mut watch::Receiver<bool>,
) -> CampaignOutcome {
    let mut attempt: u32 = 0;

    info!(
        plot = plot_id,
        max_attempts = settings.max_attempts,
        interval_ms = settings.interval.as_millis() as u64,
        "retry campaign started"
    );

    while attempt < settings.max_attempts {
        if *cancel.borrow() {
            return CampaignOutcome::Cancelled { attempts: attempt };
        }

        match tick(store, plot_id, attempt + 1).await {
            Ok(Tick::Recovered) => {
                info!(plot = plot_id, attempts = attempt, "sensor is up, irrigation started");
                shared.write().await.record_irrigation(
                    plot_id,
                    format!("sensor recovered after {attempt} failed call(s), irrigation started"),
                );
                return CampaignOutcome::Recovered { attempts: attempt };
            }
            Ok(Tick::PlotGone) => {
                info!(plot = plot_id, "plot removed, retry campaign stopped");
                return CampaignOutcome::PlotRemoved;
            }
            Ok(Tick::StillDown(write_err)) => {
                attempt += 1;
                debug!(
                    plot = plot_id,
                    attempt,
                    max_attempts = settings.max_attempts,
                    "sensor still down"
                );
                let mut state = shared.write().await;
                state.record_retry(
                    plot_id,
                    format!("sensor down, call {attempt}/{}", settings.max_attempts),
                );
                if let Some(e) = write_err {
                    // the next successful write carries the current count
                    warn!(plot = plot_id, attempt, "recording attempt failed: {e:#}");
                    state.record_error(
                        Some(plot_id),
                        format!("recording call {attempt} failed: {e:#}"),
                    );
                }
            }
            Err(e) => {
                // sensor state unknown, so this tick does not count
                warn!(plot = plot_id, attempt, "retry tick failed: {e:#}");
                shared
                    .write()
                    .await
                    .record_error(Some(plot_id), format!("retry tick failed: {e:#}"));
            }
        }

        match store
            .renew_lease(plot_id, owner, now(), settings.lease_ttl())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(plot = plot_id, attempt, "campaign lease lost, stopping");
                return CampaignOutcome::LeaseLost { attempts: attempt };
            }
            Err(e) => warn!(plot = plot_id, "lease renewal failed: {e:#}"),
        }

        if attempt < settings.max_attempts && !sleep_or_cancel(settings.interval, cancel).await {
            return CampaignOutcome::Cancelled { attempts: attempt };
        }
    }

    escalate(store, shared, plot_id, owner, attempt, settings, cancel).await
}

/// Raise the alert. This write must land, so it is retried with backoff
/// until it does or the campaign is cancelled.
async fn escalate(
    store: &dyn PlotStore,
    shared: &SharedState,
    plot_id: i64,
    owner: &str,
    attempts: u32,
    settings: RetrySettings,
    cancel: &mut watch::Receiver<bool>,
) -> CampaignOutcome {
    let mut backoff = ESCALATION_BACKOFF_START;

    loop {
        if *cancel.borrow() {
            return CampaignOutcome::Cancelled { attempts };
        }

        match store.raise_alert(plot_id, attempts).await {
            Ok(true) => {
                warn!(plot = plot_id, attempts, "sensor unreachable, alert raised");
                shared.write().await.record_alert(
                    plot_id,
                    format!("sensor unreachable after {attempts} call(s), alert raised"),
                );
                return CampaignOutcome::Exhausted { attempts };
            }
            Ok(false) => {
                info!(plot = plot_id, "plot removed before alert could be raised");
                return CampaignOutcome::PlotRemoved;
            }
            Err(e) => {
                error!(
                    plot = plot_id,
                    retry_in_ms = backoff.as_millis() as u64,
                    "raising alert failed: {e:#}"
                );
                if let Err(e) = store
                    .renew_lease(plot_id, owner, now(), settings.lease_ttl())
                    .await
                {
                    warn!(plot = plot_id, "lease renewal failed: {e:#}");
                }
                if !sleep_or_cancel(backoff, cancel).await {
                    return CampaignOutcome::Cancelled { attempts };
                }
                backoff = (backoff * 2).min(ESCALATION_BACKOFF_MAX);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Campaign {
    cancel: watch::Sender<bool>,
    task: JoinHandle<CampaignOutcome>,
}

/// Owns the running campaigns: spawns them, cancels them, and lets callers
/// await their outcome.
pub struct RetryScheduler {
    store: Arc<dyn PlotStore>,
    shared: SharedState,
    settings: RetrySettings,
    instance: String,
    next_campaign: AtomicU64,
    campaigns: Mutex<HashMap<i64, Campaign>>,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn PlotStore>, shared: SharedState, settings: RetrySettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            shared,
            settings,
            instance: format!("{}-{}", std::process::id(), to_millis(now())),
            next_campaign: AtomicU64::new(1),
            campaigns: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> RetrySettings {
        self.settings
    }

    /// Claim the plot's lease and start a campaign in the background.
    /// Returns false when another campaign already holds the lease.
    pub async fn try_schedule(self: &Arc<Self>, plot_id: i64) -> Result<bool> {
        let seq = self.next_campaign.fetch_add(1, Ordering::Relaxed);
        let owner = format!("{}#{seq}", self.instance);

        if !self
            .store
            .acquire_lease(plot_id, &owner, now(), self.settings.lease_ttl())
            .await?
        {
            debug!(plot = plot_id, "campaign already in flight");
            return Ok(false);
        }

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = run_campaign(
                this.store.as_ref(),
                &this.shared,
                plot_id,
                &owner,
                this.settings,
                &mut cancel_rx,
            )
            .await;

            if let Err(e) = this.store.release_lease(plot_id, &owner).await {
                warn!(plot = plot_id, "releasing campaign lease failed: {e:#}");
            }
            info!(plot = plot_id, ?outcome, "retry campaign finished");
            outcome
        });

        let mut campaigns = self.campaigns.lock().await;
        campaigns.retain(|_, c| !c.task.is_finished());
        campaigns.insert(
            plot_id,
            Campaign {
                cancel: cancel_tx,
                task,
            },
        );
        Ok(true)
    }

    pub async fn is_running(&self, plot_id: i64) -> bool {
        self.campaigns
            .lock()
            .await
            .get(&plot_id)
            .map(|c| !c.task.is_finished())
            .unwrap_or(false)
    }

    /// Ask the plot's campaign to stop at its next suspension point.
    pub async fn cancel(&self, plot_id: i64) -> bool {
        match self.campaigns.lock().await.get(&plot_id) {
            Some(c) if !c.task.is_finished() => c.cancel.send(true).is_ok(),
            _ => false,
        }
    }

    /// Await the outcome of the plot's most recent campaign. `None` if this
    /// scheduler never ran one or its task panicked.
    pub async fn wait(&self, plot_id: i64) -> Option<CampaignOutcome> {
        let campaign = self.campaigns.lock().await.remove(&plot_id)?;
        // Hold the sender so the campaign doesn't read its drop as a cancel.
        let Campaign { cancel, task } = campaign;
        let outcome = match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(plot = plot_id, "retry campaign task failed: {e}");
                None
            }
        };
        drop(cancel);
        outcome
    }

    /// Start a fresh campaign for every plot whose previous campaign died
    /// mid-flight (e.g. the process restarted). Leases held by earlier
    /// processes are dropped first, even if they have not expired yet.
    pub async fn resume_orphaned(self: &Arc<Self>) -> Result<usize> {
        let released = self
            .store
            .release_foreign_leases(&format!("{}#", self.instance))
            .await?;
        if released > 0 {
            info!(released, "took over leases from a previous controller");
        }

        let orphans = self.store.orphaned_campaigns(now()).await?;
        let mut resumed = 0;
        for plot_id in orphans {
            if self.try_schedule(plot_id).await? {
                info!(plot = plot_id, "resumed orphaned retry campaign");
                resumed += 1;
            }
        }
        if resumed > 0 {
            self.shared
                .write()
                .await
                .record_system(format!("resumed {resumed} orphaned retry campaign(s)"));
        }
        Ok(resumed)
    }

    /// Cancel every campaign and wait for all of them to release their
    /// leases.
    pub async fn shutdown(&self) {
        let campaigns: Vec<(i64, Campaign)> = self.campaigns.lock().await.drain().collect();
        for (_, c) in &campaigns {
            let _ = c.cancel.send(true);
        }
        for (plot_id, c) in campaigns {
            match c.task.await {
                Ok(outcome) => debug!(plot = plot_id, ?outcome, "campaign drained"),
                Err(e) => error!(plot = plot_id, "retry campaign task failed: {e}"),
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::model::{CropType, Plot, Status};
    use crate::state;
    use crate::store::Lease;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use time::OffsetDateTime;

    fn fast(max_attempts: u32) -> RetrySettings {
        RetrySettings {
            max_attempts,
            interval: Duration::from_millis(10),
        }
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    /// Plot `code` with a sensor in `status` and two slots.
    async fn plot_with_sensor(db: &Db, code: &str, status: Status) -> (i64, i64) {
        let plot_id = db.insert_plot(code, 2.0, 1.0).await.unwrap();
        let sensor_id = db
            .insert_sensor(plot_id, &format!("{code}-sensor"), status)
            .await
            .unwrap();
        db.configure_plot(plot_id, CropType::Rice, 10, 2).await.unwrap();
        (plot_id, sensor_id)
    }

    async fn load(db: &Db, plot_id: i64) -> Plot {
        db.load_plot(plot_id).await.unwrap().unwrap()
    }

    async fn wait_for_attempts(db: &Db, plot_id: i64, n: u32) {
        for _ in 0..500 {
            if load(db, plot_id).await.sensor_call_count >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("plot {plot_id} never reached {n} attempts");
    }

    // -- Exhaustion ---------------------------------------------------------

    #[tokio::test]
    async fn sensor_down_for_every_poll_raises_alert() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P2", Status::Down).await;
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(3));

        assert!(scheduler.try_schedule(plot_id).await.unwrap());
        let outcome = scheduler.wait(plot_id).await;
        assert_eq!(outcome, Some(CampaignOutcome::Exhausted { attempts: 3 }));

        let plot = load(&db, plot_id).await;
        assert!(plot.has_alert);
        assert_eq!(plot.sensor_call_count, 3);
        assert!(plot.last_sensor_call_time.is_some());
        assert!(!plot.is_irrigated);
        assert!(plot.slots_consistent());

        let alerted = db.list_alerted().await.unwrap();
        assert_eq!(alerted.len(), 1);
        assert_eq!(alerted[0].id, plot_id);

        // Lease released on exit.
        assert!(db.live_lease(plot_id, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn plot_without_sensor_counts_as_down() {
        let db = test_db().await;
        let plot_id = db.insert_plot("bare", 1.0, 1.0).await.unwrap();
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(2));

        scheduler.try_schedule(plot_id).await.unwrap();
        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Exhausted { attempts: 2 })
        );
    }

    // -- Recovery -----------------------------------------------------------

    #[tokio::test]
    async fn sensor_up_on_first_poll_recovers_without_attempts() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P1", Status::Up).await;
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(3));

        scheduler.try_schedule(plot_id).await.unwrap();
        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Recovered { attempts: 0 })
        );
        assert!(load(&db, plot_id).await.is_irrigated);
    }

    #[tokio::test]
    async fn sensor_recovering_mid_campaign_stops_early_and_irrigates() {
        let db = test_db().await;
        let (plot_id, sensor_id) = plot_with_sensor(&db, "P3", Status::Down).await;
        let settings = RetrySettings {
            max_attempts: 50,
            interval: Duration::from_millis(20),
        };
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), settings);

        scheduler.try_schedule(plot_id).await.unwrap();
        wait_for_attempts(&db, plot_id, 2).await;
        db.set_sensor_status(sensor_id, Status::Up).await.unwrap();

        let outcome = scheduler.wait(plot_id).await.unwrap();
        match outcome {
            CampaignOutcome::Recovered { attempts } => {
                assert!((2..50).contains(&attempts), "attempts = {attempts}")
            }
            other => panic!("expected recovery, got {other:?}"),
        }

        let plot = load(&db, plot_id).await;
        assert!(plot.is_irrigated);
        assert!(!plot.has_alert);
        assert_eq!(plot.sensor_call_count, 0);
        assert!(plot.last_sensor_call_time.is_none());
        assert!(plot.slots.iter().all(|s| s.status == Status::Up));
    }

    // -- Exclusivity --------------------------------------------------------

    #[tokio::test]
    async fn second_schedule_for_same_plot_is_refused() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P4", Status::Down).await;
        let settings = RetrySettings {
            max_attempts: 3,
            interval: Duration::from_secs(10),
        };
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), settings);

        assert!(scheduler.try_schedule(plot_id).await.unwrap());
        assert!(!scheduler.try_schedule(plot_id).await.unwrap());
        assert!(scheduler.is_running(plot_id).await);

        scheduler.shutdown().await;
        assert!(!scheduler.is_running(plot_id).await);
    }

    #[tokio::test]
    async fn concurrent_campaigns_keep_their_own_counters() {
        let db = test_db().await;
        let (a, _) = plot_with_sensor(&db, "A", Status::Down).await;
        let (b, _) = plot_with_sensor(&db, "B", Status::Down).await;
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(4));

        assert!(scheduler.try_schedule(a).await.unwrap());
        assert!(scheduler.try_schedule(b).await.unwrap());

        assert_eq!(
            scheduler.wait(a).await,
            Some(CampaignOutcome::Exhausted { attempts: 4 })
        );
        assert_eq!(
            scheduler.wait(b).await,
            Some(CampaignOutcome::Exhausted { attempts: 4 })
        );
        assert_eq!(load(&db, a).await.sensor_call_count, 4);
        assert_eq!(load(&db, b).await.sensor_call_count, 4);
    }

    // -- Cancellation -------------------------------------------------------

    #[tokio::test]
    async fn cancel_stops_campaign_and_releases_lease() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P5", Status::Down).await;
        let settings = RetrySettings {
            max_attempts: 5,
            interval: Duration::from_secs(10),
        };
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), settings);

        scheduler.try_schedule(plot_id).await.unwrap();
        wait_for_attempts(&db, plot_id, 1).await;
        assert!(scheduler.cancel(plot_id).await);

        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Cancelled { attempts: 1 })
        );
        let plot = load(&db, plot_id).await;
        assert!(!plot.has_alert);
        assert!(db.live_lease(plot_id, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_plot_ends_campaign() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P6", Status::Down).await;
        let settings = RetrySettings {
            max_attempts: 50,
            interval: Duration::from_millis(20),
        };
        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), settings);

        scheduler.try_schedule(plot_id).await.unwrap();
        wait_for_attempts(&db, plot_id, 1).await;
        db.delete_plot(plot_id).await.unwrap();

        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::PlotRemoved)
        );
    }

    #[tokio::test]
    async fn wait_without_campaign_is_none() {
        let db = test_db().await;
        let scheduler = RetryScheduler::new(Arc::new(db), state::shared(), fast(1));
        assert_eq!(scheduler.wait(1).await, None);
        assert!(!scheduler.cancel(1).await);
    }

    // -- Orphans ------------------------------------------------------------

    #[tokio::test]
    async fn resume_orphaned_restarts_dead_campaigns() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P7", Status::Down).await;
        // A campaign that recorded two attempts and then vanished.
        db.record_attempt(plot_id, 2, now()).await.unwrap();

        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(3));
        assert_eq!(scheduler.resume_orphaned().await.unwrap(), 1);
        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Exhausted { attempts: 3 })
        );
        assert_eq!(scheduler.resume_orphaned().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resume_takes_over_unexpired_lease_from_previous_process() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P7b", Status::Down).await;
        db.record_attempt(plot_id, 1, now()).await.unwrap();
        // The previous process crashed moments ago; its lease is still live.
        assert!(db
            .acquire_lease(plot_id, "4242-1#1", now(), Duration::from_secs(90))
            .await
            .unwrap());

        let scheduler = RetryScheduler::new(Arc::new(db.clone()), state::shared(), fast(2));
        assert_eq!(scheduler.resume_orphaned().await.unwrap(), 1);
        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Exhausted { attempts: 2 })
        );
        assert!(db.live_lease(plot_id, now()).await.unwrap().is_none());
    }

    // -- Store failures -----------------------------------------------------

    /// Delegates to a real `Db` but fails selected writes.
    struct FlakyStore {
        db: Db,
        fail_loads: AtomicBool,
        load_failures: AtomicU32,
        fail_attempt_writes: AtomicBool,
        alert_failures_left: AtomicU32,
        alert_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(db: Db) -> Self {
            Self {
                db,
                fail_loads: AtomicBool::new(false),
                load_failures: AtomicU32::new(0),
                fail_attempt_writes: AtomicBool::new(false),
                alert_failures_left: AtomicU32::new(0),
                alert_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl PlotStore for FlakyStore {
        async fn load_plot(&self, plot_id: i64) -> Result<Option<Plot>> {
            if self.fail_loads.load(Ordering::SeqCst) {
                self.load_failures.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("database is locked");
            }
            self.db.load_plot(plot_id).await
        }
        async fn mark_irrigating(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool> {
            self.db.mark_irrigating(plot_id, now).await
        }
        async fn mark_idle(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool> {
            self.db.mark_idle(plot_id, now).await
        }
        async fn record_attempt(
            &self,
            plot_id: i64,
            attempt: u32,
            now: OffsetDateTime,
        ) -> Result<bool> {
            if self.fail_attempt_writes.load(Ordering::SeqCst) {
                anyhow::bail!("database is locked");
            }
            self.db.record_attempt(plot_id, attempt, now).await
        }
        async fn raise_alert(&self, plot_id: i64, attempts: u32) -> Result<bool> {
            self.alert_calls.fetch_add(1, Ordering::SeqCst);
            let left = self.alert_failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.alert_failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("disk I/O error");
            }
            self.db.raise_alert(plot_id, attempts).await
        }
        async fn list_alerted(&self) -> Result<Vec<Plot>> {
            self.db.list_alerted().await
        }
        async fn clear_alert(&self, plot_id: i64) -> Result<u64> {
            self.db.clear_alert(plot_id).await
        }
        async fn acquire_lease(
            &self,
            plot_id: i64,
            owner: &str,
            now: OffsetDateTime,
            ttl: Duration,
        ) -> Result<bool> {
            self.db.acquire_lease(plot_id, owner, now, ttl).await
        }
        async fn renew_lease(
            &self,
            plot_id: i64,
            owner: &str,
            now: OffsetDateTime,
            ttl: Duration,
        ) -> Result<bool> {
            self.db.renew_lease(plot_id, owner, now, ttl).await
        }
        async fn release_lease(&self, plot_id: i64, owner: &str) -> Result<()> {
            self.db.release_lease(plot_id, owner).await
        }
        async fn live_lease(&self, plot_id: i64, now: OffsetDateTime) -> Result<Option<Lease>> {
            self.db.live_lease(plot_id, now).await
        }
        async fn release_foreign_leases(&self, owner_prefix: &str) -> Result<u64> {
            self.db.release_foreign_leases(owner_prefix).await
        }
        async fn orphaned_campaigns(&self, now: OffsetDateTime) -> Result<Vec<i64>> {
            self.db.orphaned_campaigns(now).await
        }
    }

    #[tokio::test]
    async fn failed_attempt_writes_do_not_stop_the_campaign() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P8", Status::Down).await;
        let store = FlakyStore::new(db.clone());
        store.fail_attempt_writes.store(true, Ordering::SeqCst);
        let store: Arc<dyn PlotStore> = Arc::new(store);

        let scheduler = RetryScheduler::new(store, state::shared(), fast(3));
        scheduler.try_schedule(plot_id).await.unwrap();

        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Exhausted { attempts: 3 })
        );
        // Escalation pins the count even though no tick write landed.
        let plot = load(&db, plot_id).await;
        assert!(plot.has_alert);
        assert_eq!(plot.sensor_call_count, 3);
    }

    #[tokio::test]
    async fn failed_escalation_is_retried_until_it_lands() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P9", Status::Down).await;
        let store = Arc::new(FlakyStore::new(db.clone()));
        store.alert_failures_left.store(2, Ordering::SeqCst);

        let shared = state::shared();
        let lease_owner = "test-owner";
        assert!(store
            .acquire_lease(plot_id, lease_owner, now(), fast(2).lease_ttl())
            .await
            .unwrap());

        let (_cancel_tx, mut cancel_rx) = watch::channel(false);
        let outcome = run_campaign(
            store.as_ref(),
            &shared,
            plot_id,
            lease_owner,
            fast(2),
            &mut cancel_rx,
        )
        .await;

        assert_eq!(outcome, CampaignOutcome::Exhausted { attempts: 2 });
        assert_eq!(store.alert_calls.load(Ordering::SeqCst), 3);
        assert!(load(&db, plot_id).await.has_alert);

        let st = shared.read().await;
        assert_eq!(
            st.plot_events(plot_id)
                .iter()
                .filter(|e| e.kind == crate::state::EventKind::Alert)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn cancel_during_failing_escalation_gives_up() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P10", Status::Down).await;
        let store = Arc::new(FlakyStore::new(db.clone()));
        store.alert_failures_left.store(u32::MAX, Ordering::SeqCst);

        assert!(store
            .acquire_lease(plot_id, "owner", now(), fast(1).lease_ttl())
            .await
            .unwrap());

        let shared = state::shared();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let campaign_store = Arc::clone(&store);
        let campaign_shared = shared.clone();
        let handle = tokio::spawn(async move {
            run_campaign(
                campaign_store.as_ref(),
                &campaign_shared,
                plot_id,
                "owner",
                fast(1),
                &mut cancel_rx,
            )
            .await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.alert_calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("escalation never started");
        cancel_tx.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("campaign ignored cancellation")
            .unwrap();
        assert_eq!(outcome, CampaignOutcome::Cancelled { attempts: 1 });
        assert!(!load(&db, plot_id).await.has_alert);
    }

    #[tokio::test]
    async fn failed_loads_never_count_as_attempts() {
        let db = test_db().await;
        let (plot_id, _) = plot_with_sensor(&db, "P11", Status::Up).await;
        let store = Arc::new(FlakyStore::new(db.clone()));
        store.fail_loads.store(true, Ordering::SeqCst);
        let dyn_store: Arc<dyn PlotStore> = store.clone();

        let scheduler = RetryScheduler::new(dyn_store, state::shared(), fast(3));
        assert!(scheduler.try_schedule(plot_id).await.unwrap());

        // Well past the attempt budget without ever reading the sensor.
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.load_failures.load(Ordering::SeqCst) < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("campaign stopped polling");

        let plot = load(&db, plot_id).await;
        assert!(!plot.has_alert);
        assert_eq!(plot.sensor_call_count, 0);
        assert!(scheduler.is_running(plot_id).await);

        // Once the store answers, the UP sensor is seen and irrigation starts.
        store.fail_loads.store(false, Ordering::SeqCst);
        assert_eq!(
            scheduler.wait(plot_id).await,
            Some(CampaignOutcome::Recovered { attempts: 0 })
        );
        let plot = load(&db, plot_id).await;
        assert!(plot.is_irrigated);
        assert!(!plot.has_alert);
    }

    #[test]
    fn lease_outlives_two_intervals() {
        let s = RetrySettings::default();
        assert_eq!(s.max_attempts, 10);
        assert_eq!(s.interval, Duration::from_secs(30));
        assert!(s.lease_ttl() > s.interval * 2);
    }
}
