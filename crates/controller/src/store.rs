//! The persistence seam shared by the irrigation engine, the retry
//! scheduler, and the alert registry.
//!
//! Every mutating call is a single atomic conditional write: callers never
//! load a plot, tweak it in memory, and save it back. The boolean results
//! report whether the condition held (and the plot existed).

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;

use crate::model::Plot;

/// A durable claim that a retry campaign is in flight for one plot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub plot_id: i64,
    pub owner: String,
    pub expires_at: OffsetDateTime,
}

#[async_trait]
pub trait PlotStore: Send + Sync + 'static {
    async fn load_plot(&self, plot_id: i64) -> Result<Option<Plot>>;

    /// Success transition: alert cleared, retry state reset, irrigation
    /// timestamps set to `now`, every slot UP. Only applies to a plot that
    /// is not already irrigating.
    async fn mark_irrigating(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool>;

    /// End transition: only applies to a plot that is irrigating.
    async fn mark_idle(&self, plot_id: i64, now: OffsetDateTime) -> Result<bool>;

    async fn record_attempt(&self, plot_id: i64, attempt: u32, now: OffsetDateTime)
        -> Result<bool>;

    /// Escalation: sets the alert and pins the attempt count in one write.
    async fn raise_alert(&self, plot_id: i64, attempts: u32) -> Result<bool>;

    async fn list_alerted(&self) -> Result<Vec<Plot>>;

    /// Targeted single-field update. Returns rows affected.
    async fn clear_alert(&self, plot_id: i64) -> Result<u64>;

    /// Take the lease if nobody holds a live one.
    async fn acquire_lease(
        &self,
        plot_id: i64,
        owner: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<bool>;

    /// Extend a lease we still own. `false` means it was lost.
    async fn renew_lease(
        &self,
        plot_id: i64,
        owner: &str,
        now: OffsetDateTime,
        ttl: Duration,
    ) -> Result<bool>;

    async fn release_lease(&self, plot_id: i64, owner: &str) -> Result<()>;

    async fn live_lease(&self, plot_id: i64, now: OffsetDateTime) -> Result<Option<Lease>>;

    /// Drop every lease whose owner does not start with `owner_prefix`,
    /// live or not. Only valid while no other controller shares the store.
    /// Returns rows affected.
    async fn release_foreign_leases(&self, owner_prefix: &str) -> Result<u64>;

    /// Plots whose campaign died without finishing: attempts recorded, no
    /// alert, not irrigating, and no live lease.
    async fn orphaned_campaigns(&self, now: OffsetDateTime) -> Result<Vec<i64>>;
}
