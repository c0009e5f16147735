//! Core library for SafeSend. This module wires the send policy engine to an
//! HTTP surface: the client captures the outgoing message, posts it to
//! `/evaluate-send`, and applies the returned completion and field rewrites.

pub mod address;
pub mod channel;
mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod host;
pub mod state;
pub mod telemetry;
pub mod trust;

pub use config::{AppConfig, RotationConfig};
pub use engine::{Completion, Decision, DecisionState, EngineSettings, PolicyMode, SendPolicyEngine};

use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use crate::address::{ItemKind, RecipientField, RecipientInput, RecipientRef};
use crate::channel::PresetChannel;
use crate::error::HostError;
use crate::hooks::{HookPipeline, HookStatus};
use crate::host::{CustomProperties, FieldSnapshot, MessageBody, SnapshotChanges, SnapshotHost};
use crate::telemetry::{open_shared, AuditLogFields, DecisionLogFields, TelemetrySink, SCHEMA_VERSION};
use crate::trust::{FileTrustSource, StaticTrustSource, TrustSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Failed,
}

/// A recipient field the client could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFailure {
    pub status: FetchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One recipient field as captured by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Failed(FieldFailure),
    Value(RecipientInput),
}

impl FieldValue {
    fn snapshot(&self) -> FieldSnapshot {
        match self {
            FieldValue::Value(input) => Ok(input.clone()),
            FieldValue::Failed(f) => Err(HostError::Failed(
                f.error
                    .clone()
                    .unwrap_or_else(|| "recipient fetch failed".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    #[serde(default)]
    pub item_type: ItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bcc: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_attendees: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional_attendees: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
    #[serde(default)]
    pub custom_properties: CustomProperties,
    /// What the confirmation dialog returned; absent when it was closed
    /// without an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialog_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,
}

impl EvaluateRequest {
    fn field(&self, field: RecipientField) -> Option<&FieldValue> {
        match field {
            RecipientField::To => self.to.as_ref(),
            RecipientField::Cc => self.cc.as_ref(),
            RecipientField::Bcc => self.bcc.as_ref(),
            RecipientField::RequiredAttendees => self.required_attendees.as_ref(),
            RecipientField::OptionalAttendees => self.optional_attendees.as_ref(),
        }
    }

    /// Build the in-memory host the engine evaluates against.
    pub fn to_host(&self) -> SnapshotHost {
        let mut host = SnapshotHost::new(self.item_type).with_properties(self.custom_properties.clone());
        if let Some(id) = &self.item_id {
            host = host.with_item_id(id.clone());
        }
        for &field in self.item_type.recipient_fields() {
            if let Some(value) = self.field(field) {
                host = host.with_field(field, value.snapshot());
            }
        }
        if let Some(subject) = &self.subject {
            host = host.with_subject(subject.clone());
        }
        if let Some(body) = &self.body {
            host = host.with_body(body.clone());
        }
        host
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub allow_event: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub outcome: DecisionState,
    pub external_recipients: Vec<String>,
    /// Property bag to store back on the message.
    pub custom_properties: CustomProperties,
    /// Only the fields that were rewritten.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub recipients: BTreeMap<String, Vec<RecipientRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<MessageBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialog_url: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub audit_suppressed: bool,
}

impl EvaluateResponse {
    fn from_decision(decision: &Decision, mut changes: SnapshotChanges) -> Self {
        if decision.state != DecisionState::Remediated {
            // A failed remediation may have restored fields; nothing to apply.
            changes.recipients.clear();
        }
        let Completion {
            allow_event,
            error_message,
        } = decision.completion();
        Self {
            allow_event,
            error_message,
            outcome: decision.state,
            external_recipients: decision.external.iter().map(|r| r.email.clone()).collect(),
            custom_properties: changes.properties,
            recipients: changes
                .recipients
                .into_iter()
                .map(|(field, list)| {
                    let refs = list
                        .into_iter()
                        .map(|r| RecipientRef {
                            email_address: r.email,
                            display_name: (!r.display_name.is_empty()).then_some(r.display_name),
                        })
                        .collect();
                    (field.as_str().to_string(), refs)
                })
                .collect(),
            subject: changes.subject,
            body: changes.body,
            dialog_url: decision.dialog.as_ref().map(|d| d.url.clone()),
            audit_suppressed: false,
        }
    }

    /// What the client sees when a block is only recorded: the send goes
    /// ahead and the message is left untouched.
    fn suppressed(mut self, original: &CustomProperties) -> Self {
        self.allow_event = true;
        self.error_message = None;
        self.custom_properties = original.clone();
        self.recipients.clear();
        self.subject = None;
        self.body = None;
        self.audit_suppressed = true;
        self
    }
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Counters exposed on `/metrics`.
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub blocks_total: AtomicU64,
    pub audit_suppressed_total: AtomicU64,
    pub fail_open_total: AtomicU64,
    pub hook_failures_total: AtomicU64,
    /// Indexed like [`DecisionState::ALL`].
    pub outcomes: Vec<AtomicU64>,
    pub hist_buckets: Vec<u64>,
    pub hist_counts: Vec<AtomicU64>,
    pub hist_sum_ms: AtomicU64,
    pub hist_count: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        let buckets: Vec<u64> = vec![1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];
        Self {
            requests_total: AtomicU64::new(0),
            blocks_total: AtomicU64::new(0),
            audit_suppressed_total: AtomicU64::new(0),
            fail_open_total: AtomicU64::new(0),
            hook_failures_total: AtomicU64::new(0),
            outcomes: DecisionState::ALL.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            hist_buckets: buckets,
            hist_sum_ms: AtomicU64::new(0),
            hist_count: AtomicU64::new(0),
        }
    }

    fn observe_latency(&self, ms: u64) {
        self.hist_sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.hist_count.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = self.hist_buckets.iter().position(|ub| ms <= *ub) {
            self.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record(&self, decision: &Decision, suppressed: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = DecisionState::ALL.iter().position(|s| *s == decision.state) {
            self.outcomes[idx].fetch_add(1, Ordering::Relaxed);
        }
        if !decision.allow() {
            self.blocks_total.fetch_add(1, Ordering::Relaxed);
        }
        if suppressed {
            self.audit_suppressed_total.fetch_add(1, Ordering::Relaxed);
        }
        if decision.error.as_ref().is_some_and(|e| e.fails_open()) {
            self.fail_open_total.fetch_add(1, Ordering::Relaxed);
        }
        let failed_hooks = decision
            .hooks
            .iter()
            .filter(|h| matches!(h.status, HookStatus::Failed(_)))
            .count() as u64;
        self.hook_failures_total.fetch_add(failed_hooks, Ordering::Relaxed);
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: SendPolicyEngine,
    pub allowed_tokens: Option<HashSet<String>>,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
    /// Record would-be blocks but answer with allow.
    pub audit_only: bool,
    pub telemetry: TelemetrySink,
    pub metrics: Arc<Metrics>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Assemble the engine and telemetry from a parsed configuration.
pub fn build_state(config: AppConfig) -> AppState {
    let trust: Arc<dyn TrustSource> = match &config.trust_config_path {
        Some(path) => Arc::new(FileTrustSource::new(path.clone(), config.fallback_trust.clone())),
        None => Arc::new(StaticTrustSource(config.fallback_trust.clone())),
    };
    let hooks = HookPipeline::new(&config.hook_order, &config.hook_config);
    let settings = EngineSettings {
        mode: config.policy_mode,
        match_mode: config.match_mode,
        fetch_timeout: config.fetch_timeout_ms.map(Duration::from_millis),
        dialog_url: config.dialog_url.clone(),
    };
    let engine = SendPolicyEngine::new(settings, trust, hooks);

    if config.log_file.is_none() {
        tracing::warn!("decision log disabled: LOG_FILE not set");
    }
    let decisions = open_shared(config.log_file.as_deref(), &config.rotation, "decision");
    let audit = open_shared(config.audit_log_file.as_deref(), &config.rotation, "audit");
    let telemetry = TelemetrySink::new(decisions, audit, config.log_stdout, config.log_sample_n);

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    tracing::info!(
        mode = %config.policy_mode,
        match_mode = %config.match_mode,
        hooks = ?engine.hooks().names(),
        audit_only = config.audit_only,
        "engine configured"
    );

    AppState {
        engine,
        allowed_tokens: config.allowed_tokens,
        max_request_bytes: config.max_request_bytes,
        audit_only: config.audit_only,
        telemetry,
        metrics: Arc::new(Metrics::new()),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    }
}

/// Build state from environment variables, see [`AppConfig::from_env`].
pub async fn build_state_from_env() -> Result<AppState, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env().map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
    Ok(build_state(config))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/evaluate-send", post(evaluate_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> axum::response::Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

fn authorization_error() -> ErrorResponse {
    ErrorResponse {
        error_code: 2001,
        message: "Unauthorized".into(),
        http_status: 401,
    }
}

fn too_large(message: String) -> ErrorResponse {
    ErrorResponse {
        error_code: 4001,
        message,
        http_status: 413,
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ErrorResponse> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(authorization_error)?;
    let (scheme, token) = raw.split_once(' ').ok_or_else(authorization_error)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return Err(authorization_error());
    }
    Ok(token)
}

fn ensure_authorized(
    headers: &HeaderMap,
    allowed_tokens: Option<&HashSet<String>>,
) -> Result<(), ErrorResponse> {
    let token = extract_bearer_token(headers)?;
    match allowed_tokens {
        Some(tokens) if !tokens.contains(token) => Err(authorization_error()),
        _ => Ok(()),
    }
}

fn ensure_within_limit(headers: &HeaderMap, limit: Option<usize>) -> Result<(), ErrorResponse> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let declared = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    match declared {
        Some(len) if len > limit => Err(too_large(format!(
            "Request too large ({} bytes > limit {} bytes)",
            len, limit
        ))),
        _ => Ok(()),
    }
}

/// Handler for `/evaluate-send`. Runs one send attempt through the engine
/// and reports the completion plus any message changes.
async fn evaluate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> axum::response::Response {
    if let Err(err) = ensure_within_limit(&headers, state.max_request_bytes) {
        return respond_with_error(err);
    }
    if let Err(err) = ensure_authorized(&headers, state.allowed_tokens.as_ref()) {
        return respond_with_error(err);
    }
    let request = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection),
    };

    let start = Instant::now();
    let mode = request.mode.unwrap_or(state.engine.settings().mode);
    let host = request.to_host();
    let channel = PresetChannel::new(request.dialog_reply.clone());
    let decision = state.engine.evaluate_with_mode(&host, &channel, mode).await;

    let would_block = !decision.allow();
    let suppressed = state.audit_only && would_block;
    let would_be = EvaluateResponse::from_decision(&decision, host.changes());
    let response = if suppressed {
        would_be.clone().suppressed(&request.custom_properties)
    } else {
        would_be.clone()
    };
    let latency_ms = engine::millis(start.elapsed());
    state.metrics.observe_latency(latency_ms);
    state.metrics.record(&decision, suppressed);

    let correlation = headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let record = serde_json::json!({
        "schemaVersion": SCHEMA_VERSION,
        "ts": chrono::Utc::now().to_rfc3339(),
        "correlationId": correlation,
        "itemId": request.item_id,
        "itemKind": request.item_type.as_str(),
        "mode": mode.as_str(),
        "outcome": decision.state.as_str(),
        "allowEvent": response.allow_event,
        "externalCount": decision.external.len(),
        "error": decision.error.as_ref().map(|e| e.to_string()),
        "latencyMs": latency_ms,
        "auditSuppressed": if suppressed { Some(true) } else { None },
        "hooks": decision.hooks.iter().map(|h| serde_json::json!({
            "hook": h.name,
            "status": match &h.status {
                HookStatus::Applied => "applied",
                HookStatus::Skipped => "skipped",
                HookStatus::Failed(_) => "failed",
            },
            "ms": h.elapsed_ms,
        })).collect::<Vec<_>>(),
    });
    state.telemetry.emit_decision(
        &record,
        &DecisionLogFields {
            outcome: decision.state.as_str(),
            allow_event: response.allow_event,
            mode: mode.as_str(),
            external_count: decision.external.len(),
            latency_ms,
            audit_suppressed: suppressed,
        },
    );

    if suppressed {
        let audit = serde_json::json!({
            "schemaVersion": SCHEMA_VERSION,
            "ts": chrono::Utc::now().to_rfc3339(),
            "correlationId": correlation,
            "auditOnly": true,
            "wouldBlock": true,
            "wouldResponse": &would_be,
            "request": &request,
        });
        state.telemetry.emit_audit(
            &audit,
            &AuditLogFields {
                outcome: decision.state.as_str(),
                external_count: decision.external.len(),
            },
        );
    }

    (StatusCode::OK, Json(response)).into_response()
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> axum::response::Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
            let message = match state.max_request_bytes {
                Some(limit) => format!("Request too large (body exceeded limit {} bytes)", limit),
                None => "Request too large".to_string(),
            };
            respond_with_error(too_large(message))
        }
        other => other.into_response(),
    }
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let settings = state.engine.settings();
    let json = serde_json::json!({
        "status": "ok",
        "mode": settings.mode.as_str(),
        "matchMode": settings.match_mode.as_str(),
        "hookCount": state.engine.hooks().len(),
        "auditOnly": state.audit_only,
    });
    (StatusCode::OK, Json(json)).into_response()
}

fn counter(buf: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write as _;
    writeln!(buf, "# HELP {} {}", name, help).ok();
    writeln!(buf, "# TYPE {} counter", name).ok();
    writeln!(buf, "{} {}", name, value).ok();
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let m = &state.metrics;
    let mut buf = String::new();

    counter(
        &mut buf,
        "safesend_requests_total",
        "Total send attempts evaluated",
        m.requests_total.load(Ordering::Relaxed),
    );
    counter(
        &mut buf,
        "safesend_blocks_total",
        "Blocking decisions (pre audit override)",
        m.blocks_total.load(Ordering::Relaxed),
    );
    counter(
        &mut buf,
        "safesend_audit_suppressed_total",
        "Blocks suppressed due to audit-only mode",
        m.audit_suppressed_total.load(Ordering::Relaxed),
    );
    counter(
        &mut buf,
        "safesend_fail_open_total",
        "Sends allowed because recipients or the warning flag were unavailable",
        m.fail_open_total.load(Ordering::Relaxed),
    );
    counter(
        &mut buf,
        "safesend_hook_failures_total",
        "Post-allow hooks that failed",
        m.hook_failures_total.load(Ordering::Relaxed),
    );

    writeln!(&mut buf, "# HELP safesend_decisions_total Decisions per outcome").ok();
    writeln!(&mut buf, "# TYPE safesend_decisions_total counter").ok();
    for (state_kind, count) in DecisionState::ALL.iter().zip(m.outcomes.iter()) {
        writeln!(
            &mut buf,
            "safesend_decisions_total{{outcome=\"{}\"}} {}",
            state_kind,
            count.load(Ordering::Relaxed)
        )
        .ok();
    }

    writeln!(
        &mut buf,
        "# HELP safesend_request_latency_ms Evaluation latency histogram milliseconds"
    )
    .ok();
    writeln!(&mut buf, "# TYPE safesend_request_latency_ms histogram").ok();
    let count = m.hist_count.load(Ordering::Relaxed);
    let mut cumulative: u64 = 0;
    for (ub, c) in m.hist_buckets.iter().zip(m.hist_counts.iter()) {
        cumulative += c.load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "safesend_request_latency_ms_bucket{{le=\"{}\"}} {}",
            ub, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "safesend_request_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(
        &mut buf,
        "safesend_request_latency_ms_sum {}",
        m.hist_sum_ms.load(Ordering::Relaxed)
    )
    .ok();
    writeln!(&mut buf, "safesend_request_latency_ms_count {}", count).ok();

    counter(
        &mut buf,
        "safesend_telemetry_lines_total",
        "Decision/audit JSON lines written",
        state.telemetry.lines_total(),
    );
    counter(
        &mut buf,
        "safesend_telemetry_write_errors_total",
        "Decision/audit JSON line write failures",
        state.telemetry.write_errors_total(),
    );
    writeln!(
        &mut buf,
        "# HELP safesend_log_file_size_bytes Current size of the active decision log (0 if disabled)\n# TYPE safesend_log_file_size_bytes gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "safesend_log_file_size_bytes {}",
        state.telemetry.file_size_bytes()
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP safesend_build_info Build information\n# TYPE safesend_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "safesend_build_info{{version=\"{}\",schemaVersion=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        SCHEMA_VERSION
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP safesend_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE safesend_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "safesend_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP safesend_process_uptime_seconds Process uptime seconds\n# TYPE safesend_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "safesend_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
