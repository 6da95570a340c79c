//! HTTP trigger for the daily forecast job.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use horoscopo_core::RunOutcome;
use horoscopo_gen::{
    maybe_build_scheduler, ChatCompletionGenerator, GenerationJob, JobConfig,
};
use horoscopo_store::PgForecastStore;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "horoscopo-web";

pub const MSG_SUCCESS: &str = "Previsões geradas com sucesso";
pub const MSG_ALREADY_GENERATED: &str = "already generated";

#[derive(Clone)]
pub struct AppState {
    pub job: Arc<GenerationJob>,
}

impl AppState {
    pub fn new(job: Arc<GenerationJob>) -> Self {
        Self { job }
    }
}

#[derive(Debug, Deserialize, Default)]
struct TriggerQuery {
    /// Target day override for backfills; defaults to today (UTC).
    /// Kept as a raw string so a bad value reaches the handler instead
    /// of tripping the extractor's plain-text rejection; the caller
    /// always gets a JSON body.
    date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/horoscopo/diario", any(trigger_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = JobConfig::from_env()?;
    let store = Arc::new(PgForecastStore::connect(&config.database_url).await?);
    let generator = Arc::new(ChatCompletionGenerator::new(&config)?);
    let job = Arc::new(GenerationJob::new(store, generator));

    if let Some(sched) = maybe_build_scheduler(&config, job.clone()).await? {
        sched.start().await?;
        info!(cron = %config.cron, "daily forecast scheduler started");
    }

    let port: u16 = std::env::var("HOROSCOPO_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "forecast trigger listening");
    axum::serve(listener, app(AppState::new(job))).await?;
    Ok(())
}

/// Method-agnostic trigger. `OPTIONS` is answered as a CORS pre-flight;
/// every other method runs the job for the target day.
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    Query(query): Query<TriggerQuery>,
) -> Response {
    if method == Method::OPTIONS {
        return with_cors(StatusCode::OK.into_response());
    }

    let day = match query.date.as_deref() {
        Some(raw) => match raw.parse::<NaiveDate>() {
            Ok(day) => day,
            Err(_) => {
                return with_cors(
                    (
                        StatusCode::BAD_REQUEST,
                        Json(serde_json::json!({
                            "error": format!("invalid date: {raw}"),
                        })),
                    )
                        .into_response(),
                );
            }
        },
        None => Utc::now().date_naive(),
    };
    match state.job.run(day).await {
        Ok(summary) => {
            let body = match &summary.outcome {
                RunOutcome::AlreadyComplete => serde_json::json!({
                    "message": MSG_ALREADY_GENERATED,
                    "count": summary.outcome.count(),
                }),
                RunOutcome::Generated { signs } => serde_json::json!({
                    "message": MSG_SUCCESS,
                    "count": signs.len(),
                    "signos": signs.iter().map(|s| s.label()).collect::<Vec<_>>(),
                }),
            };
            with_cors(Json(body).into_response())
        }
        Err(err) => {
            error!(%day, error = %err, "forecast run failed");
            with_cors(
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "error": err.to_string() })),
                )
                    .into_response(),
            )
        }
    }
}

fn with_cors(mut resp: Response) -> Response {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, x-client-info, apikey, content-type"),
    );
    resp
}
