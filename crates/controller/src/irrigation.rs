//! Start/end irrigation transitions for a single plot.
//!
//! The engine decides whether a request is valid against a fresh snapshot of
//! the plot, then applies the transition with one conditional store write.
//! A DOWN sensor never blocks the caller: the plot is handed to the retry
//! scheduler and the caller gets `Conflict::RetryScheduled` right away.

use std::sync::Arc;
use tracing::info;

use crate::error::{Conflict, IrrigationError, IrrigationResult};
use crate::model::{now, Plot};
use crate::retry::RetryScheduler;
use crate::state::SharedState;
use crate::store::PlotStore;

pub struct IrrigationEngine {
    store: Arc<dyn PlotStore>,
    scheduler: Arc<RetryScheduler>,
    shared: SharedState,
}

impl IrrigationEngine {
    pub fn new(
        store: Arc<dyn PlotStore>,
        scheduler: Arc<RetryScheduler>,
        shared: SharedState,
    ) -> Self {
        Self {
            store,
            scheduler,
            shared,
        }
    }

    pub async fn start_irrigation(&self, plot_id: i64) -> IrrigationResult<Plot> {
        let plot = self.load(plot_id).await?;

        // Be patient: a campaign already owns this plot.
        if self.store.live_lease(plot_id, now()).await?.is_some() {
            return Err(self.retry_in_progress(&plot).into());
        }

        if plot.sensor.is_none() {
            return Err(Conflict::NoSensor.into());
        }

        if plot.is_irrigated {
            return Err(Conflict::AlreadyIrrigating {
                since: plot.start_irrigation_time,
            }
            .into());
        }

        if plot.sensor_is_up() {
            if !self.store.mark_irrigating(plot_id, now()).await? {
                // Lost the race to another start.
                let current = self.load(plot_id).await?;
                return Err(Conflict::AlreadyIrrigating {
                    since: current.start_irrigation_time,
                }
                .into());
            }

            info!(plot = plot_id, code = %plot.code, "irrigation started");
            self.shared
                .write()
                .await
                .record_irrigation(plot_id, format!("irrigation started on {}", plot.code));
            return self.load(plot_id).await;
        }

        if plot.has_alert {
            return Err(Conflict::AlertActive.into());
        }

        if self.scheduler.try_schedule(plot_id).await? {
            info!(plot = plot_id, code = %plot.code, "sensor down, retry campaign scheduled");
            self.shared.write().await.record_retry(
                plot_id,
                format!("sensor down on {}, retry campaign scheduled", plot.code),
            );
            Err(Conflict::RetryScheduled.into())
        } else {
            let current = self.load(plot_id).await?;
            Err(self.retry_in_progress(&current).into())
        }
    }

    pub async fn end_irrigation(&self, plot_id: i64) -> IrrigationResult<Plot> {
        let plot = self.load(plot_id).await?;

        if !plot.is_irrigated || !self.store.mark_idle(plot_id, now()).await? {
            return Err(IrrigationError::BadRequest(
                "start irrigation first".to_string(),
            ));
        }

        info!(plot = plot_id, code = %plot.code, "irrigation ended");
        self.shared
            .write()
            .await
            .record_irrigation(plot_id, format!("irrigation ended on {}", plot.code));
        self.load(plot_id).await
    }

    async fn load(&self, plot_id: i64) -> IrrigationResult<Plot> {
        self.store
            .load_plot(plot_id)
            .await?
            .ok_or_else(|| IrrigationError::plot_not_found(plot_id))
    }

    fn retry_in_progress(&self, plot: &Plot) -> Conflict {
        Conflict::RetryInProgress {
            attempts: plot.sensor_call_count,
            max_attempts: self.scheduler.settings().max_attempts,
            last_attempt: plot.last_sensor_call_time,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
