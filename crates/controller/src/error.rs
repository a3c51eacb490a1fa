use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use time::OffsetDateTime;

/// Why a requested transition is not valid right now. The caller has to
/// re-query the plot before trying again.
#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
    RetryInProgress {
        attempts: u32,
        max_attempts: u32,
        last_attempt: Option<OffsetDateTime>,
    },
    AlreadyIrrigating {
        since: Option<OffsetDateTime>,
    },
    AlertActive,
    RetryScheduled,
    NoSensor,
    SensorAlreadyAttached,
    DuplicateCode(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::RetryInProgress {
                attempts,
                max_attempts,
                last_attempt,
            } => {
                write!(
                    f,
                    "retry in progress: sensor called {attempts}/{max_attempts} times"
                )?;
                if let Some(t) = last_attempt {
                    write!(f, ", last at {t}")?;
                }
                Ok(())
            }
            Conflict::AlreadyIrrigating { since: Some(t) } => {
                write!(f, "already irrigating since {t}")
            }
            Conflict::AlreadyIrrigating { since: None } => f.write_str("already irrigating"),
            Conflict::AlertActive => f.write_str(
                "sensor is DOWN and the plot has an active alert, fix the sensor first",
            ),
            Conflict::RetryScheduled => {
                f.write_str("sensor is DOWN, a retry schedule is arranged to re-call the sensor")
            }
            Conflict::NoSensor => f.write_str("plot has no sensor, attach one first"),
            Conflict::SensorAlreadyAttached => {
                f.write_str("can not attach more than one sensor to a plot")
            }
            Conflict::DuplicateCode(code) => write!(f, "code '{code}' is already in use"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IrrigationError {
    #[error("{0} doesn't exist")]
    NotFound(String),

    #[error("{0}")]
    Conflict(Conflict),

    #[error("{0}")]
    BadRequest(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl IrrigationError {
    pub fn plot_not_found(plot_id: i64) -> Self {
        Self::NotFound(format!("plot {plot_id}"))
    }

    pub fn sensor_not_found(sensor_id: i64) -> Self {
        Self::NotFound(format!("sensor {sensor_id}"))
    }
}

impl From<Conflict> for IrrigationError {
    fn from(c: Conflict) -> Self {
        Self::Conflict(c)
    }
}

impl From<JsonRejection> for IrrigationError {
    fn from(r: JsonRejection) -> Self {
        Self::BadRequest(r.body_text())
    }
}

impl From<PathRejection> for IrrigationError {
    fn from(r: PathRejection) -> Self {
        Self::BadRequest(r.body_text())
    }
}

impl IntoResponse for IrrigationError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            Self::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            Self::Conflict(c) => (StatusCode::CONFLICT, c.to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Store(e) => {
                tracing::error!("store error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type IrrigationResult<T> = Result<T, IrrigationError>;
