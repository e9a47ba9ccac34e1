use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{
    DEFAULT_CONFIDENCE, DEFAULT_MAX_ITERATIONS, ProjectionError, Projector,
    RecurringExpenseTemplate, RecurringTotals, next_occurrence_after,
};

const MAX_PREVIEW_COUNT: usize = 100;

#[derive(Parser, Debug)]
#[command(
    name = "expense-projector",
    about = "Recurring expense projection engine for cash-flow forecasting"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Tracing filter directive, e.g. info or expense_projector=debug"
    )]
    pub log_level: String,
    #[command(flatten)]
    pub projection: ProjectionArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON projection API
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Print projected totals for a JSON file of templates
    Project {
        #[arg(long)]
        templates: PathBuf,
        #[arg(long, help = "First day of the walk (YYYY-MM-DD); defaults to today")]
        walk_start: Option<NaiveDate>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct ProjectionArgs {
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_MAX_ITERATIONS,
        help = "Safety cap on occurrences generated per template walk"
    )]
    pub max_iterations: usize,
    #[arg(
        long,
        global = true,
        default_value_t = DEFAULT_CONFIDENCE,
        help = "Confidence stamped on every generated occurrence (0 to 1)"
    )]
    pub confidence: f64,
    #[arg(
        long,
        global = true,
        default_value_t = 90,
        help = "Horizon in days when a request does not name one"
    )]
    pub horizon_days: u32,
    #[arg(
        long,
        global = true,
        default_value_t = 6,
        help = "Preview length when a request does not name one"
    )]
    pub preview_count: usize,
    #[arg(
        long,
        global = true,
        help = "Pin today's date (YYYY-MM-DD) instead of reading the local clock"
    )]
    pub reference_date: Option<NaiveDate>,
}

impl Default for ProjectionArgs {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            confidence: DEFAULT_CONFIDENCE,
            horizon_days: 90,
            preview_count: 6,
            reference_date: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    pub projector: Projector,
    pub default_horizon_days: u32,
    pub default_preview_count: usize,
    pub reference_date: Option<NaiveDate>,
}

impl ProjectionConfig {
    /// The pinned reference date, or the local calendar date.
    pub fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Local::now().date_naive())
    }
}

pub fn build_config(args: ProjectionArgs) -> Result<ProjectionConfig, String> {
    if args.max_iterations == 0 {
        return Err("--max-iterations must be > 0".to_string());
    }

    if !args.confidence.is_finite() || !(0.0..=1.0).contains(&args.confidence) {
        return Err("--confidence must be between 0 and 1".to_string());
    }

    if !(1..=MAX_PREVIEW_COUNT).contains(&args.preview_count) {
        return Err(format!(
            "--preview-count must be between 1 and {MAX_PREVIEW_COUNT}"
        ));
    }

    Ok(ProjectionConfig {
        projector: Projector::new()
            .with_max_iterations(args.max_iterations)
            .with_confidence(args.confidence),
        default_horizon_days: args.horizon_days,
        default_preview_count: args.preview_count,
        reference_date: args.reference_date,
    })
}

pub fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[derive(Debug, Deserialize)]
struct OccurrencesPayload {
    template: RecurringExpenseTemplate,
    #[serde(default)]
    horizon_days: Option<u32>,
    #[serde(default)]
    walk_start: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    template: RecurringExpenseTemplate,
    #[serde(default)]
    until: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct PreviewPayload {
    template: RecurringExpenseTemplate,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TotalsPayload {
    templates: Vec<RecurringExpenseTemplate>,
    #[serde(default)]
    horizon_days: Option<u32>,
    #[serde(default)]
    walk_start: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct NextOccurrencePayload {
    template: RecurringExpenseTemplate,
    #[serde(default)]
    from: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct DuePayload {
    templates: Vec<RecurringExpenseTemplate>,
    #[serde(default)]
    today: Option<NaiveDate>,
    #[serde(default)]
    recorded: HashMap<String, BTreeSet<NaiveDate>>,
}

#[derive(Debug, Deserialize)]
struct LedgerPayload {
    template: RecurringExpenseTemplate,
    #[serde(default)]
    today: Option<NaiveDate>,
    #[serde(default)]
    recorded: BTreeSet<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct NextOccurrenceResponse {
    template_id: String,
    from: NaiveDate,
    next_occurrence: NaiveDate,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type AppState = Arc<ProjectionConfig>;

pub fn build_router(config: ProjectionConfig) -> Router {
    Router::new()
        .route("/api/occurrences", post(occurrences_handler))
        .route("/api/occurrences/history", post(history_handler))
        .route("/api/preview", post(preview_handler))
        .route("/api/totals", post(totals_handler))
        .route("/api/next-occurrence", post(next_occurrence_handler))
        .route("/api/due", post(due_handler))
        .route("/api/status", post(status_handler))
        .route("/api/settle", post(settle_handler))
        .fallback(not_found_handler)
        .with_state(Arc::new(config))
}

pub async fn run_http_server(port: u16, config: ProjectionConfig) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = build_router(config);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "expense projection API listening");

    axum::serve(listener, app).await
}

pub fn run_project_command(
    config: &ProjectionConfig,
    templates_path: &Path,
    walk_start: Option<NaiveDate>,
) -> Result<RecurringTotals, String> {
    let raw = std::fs::read_to_string(templates_path)
        .map_err(|e| format!("failed to read {}: {e}", templates_path.display()))?;
    let templates = serde_json::from_str::<Vec<RecurringExpenseTemplate>>(&raw)
        .map_err(|e| format!("invalid templates JSON in {}: {e}", templates_path.display()))?;

    config
        .projector
        .total_recurring_expenses(
            &templates,
            config.default_horizon_days,
            walk_start.unwrap_or_else(|| config.today()),
        )
        .map_err(|e| e.to_string())
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn occurrences_handler(
    State(config): State<AppState>,
    payload: Result<Json<OccurrencesPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.enumerate(
        &payload.template,
        payload.horizon_days.unwrap_or(config.default_horizon_days),
        payload.walk_start.unwrap_or_else(|| config.today()),
    ))
}

async fn history_handler(
    State(config): State<AppState>,
    payload: Result<Json<HistoryPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.enumerate_from_start(
        &payload.template,
        payload.until.unwrap_or_else(|| config.today()),
    ))
}

async fn preview_handler(
    State(config): State<AppState>,
    payload: Result<Json<PreviewPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    let count = payload.count.unwrap_or(config.default_preview_count);
    if !(1..=MAX_PREVIEW_COUNT).contains(&count) {
        return rejected(ProjectionError::InvalidRequest(format!(
            "count must be between 1 and {MAX_PREVIEW_COUNT}"
        )));
    }

    engine_response(config.projector.preview_summary(&payload.template, count))
}

async fn totals_handler(
    State(config): State<AppState>,
    payload: Result<Json<TotalsPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.total_recurring_expenses(
        &payload.templates,
        payload.horizon_days.unwrap_or(config.default_horizon_days),
        payload.walk_start.unwrap_or_else(|| config.today()),
    ))
}

async fn next_occurrence_handler(
    State(config): State<AppState>,
    payload: Result<Json<NextOccurrencePayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    if let Err(e) = payload.template.validate() {
        return rejected(e);
    }

    let from = payload.from.unwrap_or_else(|| config.today());
    json_response(
        StatusCode::OK,
        NextOccurrenceResponse {
            next_occurrence: next_occurrence_after(&payload.template, from),
            template_id: payload.template.id,
            from,
        },
    )
}

async fn due_handler(
    State(config): State<AppState>,
    payload: Result<Json<DuePayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.due_expenses(
        &payload.templates,
        payload.today.unwrap_or_else(|| config.today()),
        &payload.recorded,
    ))
}

async fn status_handler(
    State(config): State<AppState>,
    payload: Result<Json<LedgerPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.template_status(
        &payload.template,
        payload.today.unwrap_or_else(|| config.today()),
        &payload.recorded,
    ))
}

async fn settle_handler(
    State(config): State<AppState>,
    payload: Result<Json<LedgerPayload>, JsonRejection>,
) -> Response {
    let payload = match parse_payload(payload) {
        Ok(payload) => payload,
        Err(response) => return response,
    };

    engine_response(config.projector.settle(
        &payload.template,
        payload.today.unwrap_or_else(|| config.today()),
        &payload.recorded,
    ))
}

fn parse_payload<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, Response> {
    match payload {
        Ok(Json(payload)) => Ok(payload),
        Err(rejection) => {
            let msg = rejection.body_text();
            warn!(error = %msg, "rejected malformed request payload");
            Err(error_response(rejection.status(), &msg))
        }
    }
}

fn engine_response<T: Serialize>(result: Result<T, ProjectionError>) -> Response {
    match result {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => rejected(e),
    }
}

fn rejected(err: ProjectionError) -> Response {
    warn!(error = %err, "rejected projection request");
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::STATUS_PREVIEW_COUNT;
    use serde_json::Value;

    fn sample_config() -> ProjectionConfig {
        let args = ProjectionArgs {
            reference_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..ProjectionArgs::default()
        };
        build_config(args).expect("valid config")
    }

    fn state() -> AppState {
        Arc::new(sample_config())
    }

    fn template_json() -> Value {
        serde_json::json!({
            "id": "tpl-1",
            "name": "Coworking desk",
            "amount": 100,
            "frequency": "monthly",
            "start_date": "2025-01-01",
            "next_occurrence": "2025-03-01",
            "vat_rate": 21,
            "is_vat_deductible": true,
            "business_use_percentage": 80
        })
    }

    fn template() -> RecurringExpenseTemplate {
        serde_json::from_value(template_json()).expect("template should parse")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("body should be JSON")
    }

    #[test]
    fn build_config_rejects_zero_iteration_cap() {
        let args = ProjectionArgs {
            max_iterations: 0,
            ..ProjectionArgs::default()
        };
        let err = build_config(args).expect_err("must reject zero cap");
        assert!(err.contains("--max-iterations"));
    }

    #[test]
    fn build_config_rejects_out_of_range_confidence() {
        let args = ProjectionArgs {
            confidence: 1.5,
            ..ProjectionArgs::default()
        };
        let err = build_config(args).expect_err("must reject confidence");
        assert!(err.contains("--confidence"));
    }

    #[test]
    fn build_config_rejects_oversized_preview_count() {
        let args = ProjectionArgs {
            preview_count: 101,
            ..ProjectionArgs::default()
        };
        let err = build_config(args).expect_err("must reject preview count");
        assert!(err.contains("--preview-count"));
    }

    #[test]
    fn config_today_prefers_reference_date() {
        let config = sample_config();
        assert_eq!(config.today(), NaiveDate::from_ymd_opt(2025, 3, 1).expect("date"));
    }

    #[test]
    fn cli_parses_serve_with_global_flags() {
        let cli = Cli::try_parse_from([
            "expense-projector",
            "serve",
            "--port",
            "9090",
            "--confidence",
            "0.8",
            "--reference-date",
            "2025-06-30",
        ])
        .expect("cli should parse");

        assert!(matches!(cli.command, Command::Serve { port: 9090 }));
        let config = build_config(cli.projection).expect("valid config");
        assert_eq!(config.projector.confidence(), 0.8);
        assert_eq!(config.reference_date, NaiveDate::from_ymd_opt(2025, 6, 30));
    }

    #[test]
    fn ledger_payload_parses_recorded_dates() {
        let json = serde_json::json!({
            "template": template_json(),
            "today": "2025-04-15",
            "recorded": ["2025-01-01", "2025-02-01"]
        });
        let payload: LedgerPayload = serde_json::from_value(json).expect("payload should parse");
        assert_eq!(payload.recorded.len(), 2);
        assert_eq!(payload.today, NaiveDate::from_ymd_opt(2025, 4, 15));
    }

    #[tokio::test]
    async fn occurrences_handler_returns_complete_projection() {
        let payload = OccurrencesPayload {
            template: template(),
            horizon_days: Some(31),
            walk_start: None,
        };
        let response = occurrences_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).map(|v| v.as_bytes()),
            Some(&b"no-store"[..])
        );

        let body = body_json(response).await;
        assert_eq!(body["status"], "complete");
        let occurrences = body["occurrences"].as_array().expect("occurrences array");
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[0]["date"], "2025-03-01");
        assert_eq!(occurrences[1]["date"], "2025-04-01");
        assert_eq!(occurrences[0]["deductible_vat_amount"], 16.8);
        assert_eq!(occurrences[0]["description"], "Coworking desk (monthly)");
    }

    #[tokio::test]
    async fn preview_handler_rejects_count_out_of_range() {
        let payload = PreviewPayload {
            template: template(),
            count: Some(0),
        };
        let response = preview_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .expect("error message")
                .contains("count must be between 1 and 100")
        );
    }

    #[tokio::test]
    async fn preview_handler_uses_default_count_and_reports_metrics() {
        let payload = PreviewPayload {
            template: template(),
            count: None,
        };
        let response = preview_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["metrics"]["count"], 6);
        assert_eq!(body["metrics"]["annual_cost"], 1452.0);
        assert_eq!(body["template"]["frequency"], "monthly");
    }

    #[tokio::test]
    async fn totals_handler_rejects_invalid_template() {
        let mut bad = template();
        bad.vat_rate = 250.0;
        let payload = TotalsPayload {
            templates: vec![template(), bad],
            horizon_days: None,
            walk_start: None,
        };
        let response = totals_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().expect("error").contains("vat_rate"));
    }

    #[tokio::test]
    async fn next_occurrence_handler_steps_from_reference_date() {
        let payload = NextOccurrencePayload {
            template: template(),
            from: None,
        };
        let response = next_occurrence_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["from"], "2025-03-01");
        assert_eq!(body["next_occurrence"], "2025-04-01");
    }

    #[tokio::test]
    async fn settle_handler_reports_nothing_outstanding_as_bad_request() {
        let payload = LedgerPayload {
            template: template(),
            today: NaiveDate::from_ymd_opt(2025, 2, 10),
            recorded: BTreeSet::from([
                NaiveDate::from_ymd_opt(2025, 1, 1).expect("date"),
                NaiveDate::from_ymd_opt(2025, 2, 1).expect("date"),
            ]),
        };
        let response = settle_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn due_handler_lists_due_templates() {
        let payload = DuePayload {
            templates: vec![template()],
            today: NaiveDate::from_ymd_opt(2025, 3, 5),
            recorded: HashMap::new(),
        };
        let response = due_handler(State(state()), Ok(Json(payload))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let due = body.as_array().expect("array of due expenses");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0]["occurrences_due"], 3);
        assert_eq!(due[0]["last_occurrence_date"], "2025-03-01");
    }

    #[test]
    fn project_command_reports_missing_file() {
        let err = run_project_command(
            &sample_config(),
            Path::new("does/not/exist.json"),
            None,
        )
        .expect_err("missing file");
        assert!(err.contains("failed to read"));
    }

    #[test]
    fn project_command_totals_templates_from_file() {
        let path = std::env::temp_dir().join(format!(
            "expense-projector-templates-{}.json",
            std::process::id()
        ));
        let templates = serde_json::json!([template_json()]);
        std::fs::write(&path, templates.to_string()).expect("write temp file");

        let config = build_config(ProjectionArgs {
            horizon_days: 31,
            reference_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..ProjectionArgs::default()
        })
        .expect("valid config");
        let totals = run_project_command(&config, &path, None)
            .expect("totals should compute");
        let _ = std::fs::remove_file(&path);

        assert_eq!(totals.occurrences.len(), 2);
        assert!((totals.total - 242.0).abs() < 1e-9);
    }

    #[test]
    fn status_preview_matches_configured_constant() {
        let status = sample_config()
            .projector
            .template_status(
                &template(),
                NaiveDate::from_ymd_opt(2025, 3, 1).expect("date"),
                &BTreeSet::new(),
            )
            .expect("valid template");
        assert_eq!(status.next_occurrences.len(), STATUS_PREVIEW_COUNT);
        assert_eq!(status.expected_occurrences, 3);
    }
}
