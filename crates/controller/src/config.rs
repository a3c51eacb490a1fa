//! TOML config file loading, validation, environment overrides, and database
//! seeding for plots and sensors.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::catalog::MAX_SLOTS;
use crate::db::{Db, PlotSpec};
use crate::model::{CropType, Status};
use crate::retry::{RetrySettings, DEFAULT_INTERVAL_SEC, DEFAULT_TRIES_COUNT};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retry: RetryEntry,
    #[serde(default)]
    pub plots: Vec<PlotEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryEntry {
    pub tries_count: i64,
    pub interval_sec: i64,
}

impl Default for RetryEntry {
    fn default() -> Self {
        Self {
            tries_count: i64::from(DEFAULT_TRIES_COUNT),
            interval_sec: DEFAULT_INTERVAL_SEC as i64,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PlotEntry {
    pub code: String,
    pub length: f64,
    pub width: f64,
    pub crop_type: Option<CropType>,
    #[serde(default)]
    pub water_amount: i64,
    pub slots_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub code: String,
    pub plot_code: String,
    #[serde(default = "default_sensor_status")]
    pub status: Status,
}

fn default_sensor_status() -> Status {
    Status::Down
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_retry(&mut errors);
        self.validate_plots(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_retry(&self, errors: &mut Vec<String>) {
        let r = &self.retry;
        if r.tries_count < 1 || r.tries_count > i64::from(u32::MAX) {
            errors.push(format!(
                "retry: tries_count must be at least 1, got {}",
                r.tries_count
            ));
        }
        if r.interval_sec < 1 {
            errors.push(format!(
                "retry: interval_sec must be at least 1, got {}",
                r.interval_sec
            ));
        }
    }

    fn validate_plots(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, p) in self.plots.iter().enumerate() {
            let ctx = || {
                if p.code.trim().is_empty() {
                    format!("plots[{i}]")
                } else {
                    format!("plot '{}'", p.code)
                }
            };

            if p.code.trim().is_empty() {
                errors.push(format!("{}: code is empty", ctx()));
            } else if !seen.insert(p.code.as_str()) {
                errors.push(format!("{}: duplicate code", ctx()));
            }

            // ── Geometry ────────────────────────────────────────
            if !(p.length.is_finite() && p.length > 0.0) {
                errors.push(format!("{}: length must be positive, got {}", ctx(), p.length));
            }
            if !(p.width.is_finite() && p.width > 0.0) {
                errors.push(format!("{}: width must be positive, got {}", ctx(), p.width));
            }

            // ── Irrigation configuration ────────────────────────
            if p.water_amount < 0 {
                errors.push(format!(
                    "{}: water_amount must not be negative, got {}",
                    ctx(),
                    p.water_amount
                ));
            }
            if let Some(n) = p.slots_count {
                if n < 1 || n > i64::from(MAX_SLOTS) {
                    errors.push(format!(
                        "{}: slots_count must be between 1 and {MAX_SLOTS}, got {n}",
                        ctx()
                    ));
                }
                if p.crop_type.is_none() {
                    errors.push(format!("{}: slots_count needs a crop_type", ctx()));
                }
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let plot_codes: HashSet<&str> = self.plots.iter().map(|p| p.code.as_str()).collect();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut claimed: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.code.trim().is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.code)
                }
            };

            if s.code.trim().is_empty() {
                errors.push(format!("{}: code is empty", ctx()));
            } else if !seen.insert(s.code.as_str()) {
                errors.push(format!("{}: duplicate code", ctx()));
            }

            if s.plot_code.trim().is_empty() {
                errors.push(format!("{}: plot_code is empty", ctx()));
            } else if !plot_codes.contains(s.plot_code.as_str()) {
                errors.push(format!(
                    "{}: plot_code '{}' does not match any defined plot",
                    ctx(),
                    s.plot_code
                ));
            } else if !claimed.insert(s.plot_code.as_str()) {
                errors.push(format!(
                    "{}: plot '{}' already has a sensor",
                    ctx(),
                    s.plot_code
                ));
            }
        }
    }

    /// Apply `TRIES_COUNT` and `RETRY_INTERVAL_SEC` on top of the file.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = env("TRIES_COUNT") {
            self.retry.tries_count = v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("TRIES_COUNT is not an integer: {v:?}"))?;
        }
        if let Some(v) = env("RETRY_INTERVAL_SEC") {
            self.retry.interval_sec = v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("RETRY_INTERVAL_SEC is not an integer: {v:?}"))?;
        }
        Ok(())
    }

    /// Only meaningful on a validated config.
    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            max_attempts: u32::try_from(self.retry.tries_count).unwrap_or(DEFAULT_TRIES_COUNT),
            interval: Duration::from_secs(
                u64::try_from(self.retry.interval_sec).unwrap_or(DEFAULT_INTERVAL_SEC),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, override from the process environment, and validate.
pub fn load(path: &str) -> Result<Config> {
    load_with(path, |key| std::env::var(key).ok())
}

/// A missing file yields the defaults.
pub fn load_with(path: &str, env: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };

    config
        .apply_env_overrides(env)
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert all plots and sensors from the config into the database.
/// Irrigation and retry state are left alone.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for p in &config.plots {
        let plot_id = db
            .upsert_plot(&PlotSpec {
                code: p.code.clone(),
                length: p.length,
                width: p.width,
                crop_type: p.crop_type,
                water_amount: p.water_amount,
            })
            .await
            .with_context(|| format!("failed to upsert plot '{}'", p.code))?;

        if let Some(crop) = p.crop_type {
            let slots = match p.slots_count {
                Some(n) => u32::try_from(n)
                    .with_context(|| format!("plot '{}': slots_count out of range", p.code))?,
                None => crop.slots_for_area(p.length, p.width),
            };
            db.configure_plot(plot_id, crop, p.water_amount, slots)
                .await
                .with_context(|| format!("failed to configure plot '{}'", p.code))?;
        }
    }

    for s in &config.sensors {
        let plot_id = db
            .plot_id_by_code(&s.plot_code)
            .await?
            .with_context(|| format!("sensor '{}': plot '{}' not found", s.code, s.plot_code))?;
        db.upsert_sensor(&s.code, plot_id, s.status)
            .await
            .with_context(|| format!("failed to upsert sensor '{}'", s.code))?;
    }

    tracing::info!(
        plots = config.plots.len(),
        sensors = config.sensors.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
