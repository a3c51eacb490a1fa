use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post, put};
use axum::Router;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::alerts::AlertRegistry;
use crate::catalog::PlotCatalog;
use crate::error::{IrrigationError, IrrigationResult};
use crate::irrigation::IrrigationEngine;
use crate::model::{CropType, Plot, Sensor, Status};
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<IrrigationEngine>,
    pub alerts: Arc<AlertRegistry>,
    pub catalog: Arc<PlotCatalog>,
    pub shared: SharedState,
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// `Json` whose rejection renders like every other API error.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = IrrigationError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

struct ApiPath<T>(T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = IrrigationError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreatePlot {
    code: String,
    length: f64,
    width: f64,
}

#[derive(Deserialize)]
struct ConfigurePlot {
    crop_type: CropType,
    water_amount: i64,
    slots_count: Option<u32>,
}

#[derive(Deserialize)]
struct AttachSensor {
    code: String,
    #[serde(default = "sensor_down")]
    status: Status,
}

#[derive(Deserialize)]
struct SensorStatus {
    status: Status,
}

fn sensor_down() -> Status {
    Status::Down
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/irrigate/start/{id}", post(start_irrigation))
        .route("/api/irrigate/end/{id}", post(end_irrigation))
        .route("/api/alert", get(list_alerts))
        .route("/api/alert/off/{id}", post(clear_alert))
        .route("/api/plots", get(list_plots).post(create_plot))
        .route("/api/plots/{id}", get(get_plot).delete(delete_plot))
        .route("/api/plots/{id}/config", put(configure_plot))
        .route("/api/plots/{id}/sensor", post(attach_sensor))
        .route("/api/sensors/{id}", get(get_sensor).delete(delete_sensor))
        .route("/api/sensors/{id}/status", put(set_sensor_status))
        .route("/api/status", get(api_status))
        .with_state(state)
}

// -- Irrigation ---------------------------------------------------------------

async fn start_irrigation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<Json<Plot>> {
    state.engine.start_irrigation(id).await.map(Json)
}

async fn end_irrigation(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<Json<Plot>> {
    state.engine.end_irrigation(id).await.map(Json)
}

// -- Alerts -------------------------------------------------------------------

async fn list_alerts(State(state): State<AppState>) -> IrrigationResult<Json<Vec<Plot>>> {
    state.alerts.list_alerted().await.map(Json)
}

async fn clear_alert(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<Json<Plot>> {
    state.alerts.clear_plot_alert(id).await.map(Json)
}

// -- Plots --------------------------------------------------------------------

async fn list_plots(State(state): State<AppState>) -> IrrigationResult<Json<Vec<Plot>>> {
    state.catalog.list_plots().await.map(Json)
}

async fn create_plot(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<CreatePlot>,
) -> IrrigationResult<(StatusCode, Json<Plot>)> {
    let plot = state
        .catalog
        .create_plot(&body.code, body.length, body.width)
        .await?;
    Ok((StatusCode::CREATED, Json(plot)))
}

async fn get_plot(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<Json<Plot>> {
    state.catalog.get_plot(id).await.map(Json)
}

async fn delete_plot(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<StatusCode> {
    state.catalog.delete_plot(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn configure_plot(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<ConfigurePlot>,
) -> IrrigationResult<Json<Plot>> {
    state
        .catalog
        .configure_plot(id, body.crop_type, body.water_amount, body.slots_count)
        .await
        .map(Json)
}

async fn attach_sensor(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<AttachSensor>,
) -> IrrigationResult<(StatusCode, Json<Sensor>)> {
    let sensor = state
        .catalog
        .attach_sensor(id, &body.code, body.status)
        .await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

// -- Sensors ------------------------------------------------------------------

async fn get_sensor(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<Json<Sensor>> {
    state.catalog.get_sensor(id).await.map(Json)
}

async fn set_sensor_status(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(body): ApiJson<SensorStatus>,
) -> IrrigationResult<Json<Sensor>> {
    state.catalog.set_sensor_status(id, body.status).await.map(Json)
}

async fn delete_sensor(
    State(state): State<AppState>,
    ApiPath(id): ApiPath<i64>,
) -> IrrigationResult<StatusCode> {
    state.catalog.delete_sensor(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Status -------------------------------------------------------------------

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `shutdown` resolves, then finish in-flight requests.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
