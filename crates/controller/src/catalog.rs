//! Plot and sensor management. Never touches irrigation or retry state,
//! except that deleting a plot first stops its retry campaign.

use std::sync::Arc;
use tracing::info;

use crate::db::{is_unique_violation, Db};
use crate::error::{Conflict, IrrigationError, IrrigationResult};
use crate::model::{CropType, Plot, Sensor, Status};
use crate::retry::RetryScheduler;
use crate::state::SharedState;
use crate::store::PlotStore;

/// Upper bound on slots per plot.
pub const MAX_SLOTS: u32 = 10_000;

pub struct PlotCatalog {
    db: Db,
    scheduler: Arc<RetryScheduler>,
    shared: SharedState,
}

fn check_code(code: &str) -> IrrigationResult<&str> {
    let code = code.trim();
    if code.is_empty() {
        return Err(IrrigationError::BadRequest("code must not be empty".into()));
    }
    Ok(code)
}

impl PlotCatalog {
    pub fn new(db: Db, scheduler: Arc<RetryScheduler>, shared: SharedState) -> Self {
        Self {
            db,
            scheduler,
            shared,
        }
    }

    // ----------------------------
    // Plots
    // ----------------------------

    pub async fn create_plot(&self, code: &str, length: f64, width: f64) -> IrrigationResult<Plot> {
        let code = check_code(code)?;
        for (name, v) in [("length", length), ("width", width)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(IrrigationError::BadRequest(format!(
                    "{name} must be a positive number, got {v}"
                )));
            }
        }

        let id = match self.db.insert_plot(code, length, width).await {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                return Err(Conflict::DuplicateCode(code.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };

        info!(plot = id, code, "plot created");
        self.get_plot(id).await
    }

    pub async fn get_plot(&self, plot_id: i64) -> IrrigationResult<Plot> {
        self.db
            .load_plot(plot_id)
            .await?
            .ok_or_else(|| IrrigationError::plot_not_found(plot_id))
    }

    pub async fn list_plots(&self) -> IrrigationResult<Vec<Plot>> {
        Ok(self.db.list_plots().await?)
    }

    pub async fn delete_plot(&self, plot_id: i64) -> IrrigationResult<()> {
        if self.scheduler.cancel(plot_id).await {
            self.scheduler.wait(plot_id).await;
        }
        if !self.db.delete_plot(plot_id).await? {
            return Err(IrrigationError::plot_not_found(plot_id));
        }
        info!(plot = plot_id, "plot deleted");
        self.shared
            .write()
            .await
            .record_system(format!("plot {plot_id} deleted"));
        Ok(())
    }

    /// Set crop and water amount and rebuild the slots. Without an explicit
    /// count the crop's slot density decides.
    pub async fn configure_plot(
        &self,
        plot_id: i64,
        crop_type: CropType,
        water_amount: i64,
        slots_count: Option<u32>,
    ) -> IrrigationResult<Plot> {
        if water_amount < 0 {
            return Err(IrrigationError::BadRequest(format!(
                "water_amount must not be negative, got {water_amount}"
            )));
        }

        let plot = self.get_plot(plot_id).await?;
        let slots = slots_count.unwrap_or_else(|| crop_type.slots_for_area(plot.length, plot.width));
        if !(1..=MAX_SLOTS).contains(&slots) {
            return Err(IrrigationError::BadRequest(format!(
                "slots_count must be between 1 and {MAX_SLOTS}, got {slots}"
            )));
        }

        if !self
            .db
            .configure_plot(plot_id, crop_type, water_amount, slots)
            .await?
        {
            return Err(IrrigationError::plot_not_found(plot_id));
        }

        info!(plot = plot_id, crop = %crop_type.as_str(), slots, "plot configured");
        self.get_plot(plot_id).await
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    pub async fn attach_sensor(
        &self,
        plot_id: i64,
        code: &str,
        status: Status,
    ) -> IrrigationResult<Sensor> {
        let code = check_code(code)?;
        let plot = self.get_plot(plot_id).await?;
        if plot.sensor.is_some() {
            return Err(Conflict::SensorAlreadyAttached.into());
        }

        let sensor_id = match self.db.insert_sensor(plot_id, code, status).await {
            Ok(id) => id,
            Err(e) if is_unique_violation(&e) => {
                // Either another request attached one first, or the code is taken.
                let current = self.get_plot(plot_id).await?;
                return Err(if current.sensor.is_some() {
                    Conflict::SensorAlreadyAttached.into()
                } else {
                    Conflict::DuplicateCode(code.to_string()).into()
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(plot = plot_id, sensor = sensor_id, code, %status, "sensor attached");
        self.get_sensor(sensor_id).await
    }

    pub async fn get_sensor(&self, sensor_id: i64) -> IrrigationResult<Sensor> {
        self.db
            .get_sensor(sensor_id)
            .await?
            .ok_or_else(|| IrrigationError::sensor_not_found(sensor_id))
    }

    pub async fn set_sensor_status(&self, sensor_id: i64, status: Status) -> IrrigationResult<Sensor> {
        if !self.db.set_sensor_status(sensor_id, status).await? {
            return Err(IrrigationError::sensor_not_found(sensor_id));
        }
        let sensor = self.get_sensor(sensor_id).await?;
        info!(sensor = sensor_id, plot = sensor.plot_id, %status, "sensor status changed");
        self.shared.write().await.record_system(format!(
            "sensor {} on plot {} is {status}",
            sensor.code, sensor.plot_id
        ));
        Ok(sensor)
    }

    pub async fn delete_sensor(&self, sensor_id: i64) -> IrrigationResult<()> {
        if !self.db.delete_sensor(sensor_id).await? {
            return Err(IrrigationError::sensor_not_found(sensor_id));
        }
        info!(sensor = sensor_id, "sensor deleted");
        Ok(())
    }
}
