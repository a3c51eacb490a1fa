use std::sync::Arc;
use tracing::info;

use crate::error::{IrrigationError, IrrigationResult};
use crate::model::Plot;
use crate::state::SharedState;
use crate::store::PlotStore;

/// Query/command view over the alert flag that retry campaigns raise.
pub struct AlertRegistry {
    store: Arc<dyn PlotStore>,
    shared: SharedState,
}

impl AlertRegistry {
    pub fn new(store: Arc<dyn PlotStore>, shared: SharedState) -> Self {
        Self { store, shared }
    }

    /// Alerted plots, ordered by id.
    pub async fn list_alerted(&self) -> IrrigationResult<Vec<Plot>> {
        Ok(self.store.list_alerted().await?)
    }

    /// Drop the alert flag only. Attempt count and irrigation state are left
    /// as they are. Returns 0 for a missing or unalerted plot.
    pub async fn clear_alert(&self, plot_id: i64) -> IrrigationResult<u64> {
        let cleared = self.store.clear_alert(plot_id).await?;
        if cleared > 0 {
            info!(plot = plot_id, "alert cleared");
            self.shared
                .write()
                .await
                .record_alert(plot_id, "alert cleared by operator".to_string());
        }
        Ok(cleared)
    }

    /// Clear, then return the plot as it now stands.
    pub async fn clear_plot_alert(&self, plot_id: i64) -> IrrigationResult<Plot> {
        self.clear_alert(plot_id).await?;
        self.store
            .load_plot(plot_id)
            .await?
            .ok_or_else(|| IrrigationError::plot_not_found(plot_id))
    }
}
