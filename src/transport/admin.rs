//! `/api/admin/keys` CRUD surface (spec.md §6 "CLI surface",
//! SPEC_FULL.md §4.14), gated by the admin bootstrap key via
//! [`crate::middleware::admin_auth_middleware`] at the router layer.

use super::AppState;
use crate::core::key_record::{clamp_input_credits, ApiKeyRecord, KeyOptions, KeyQuota};
use crate::utils::json_safety::strip_dangerous_keys;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const MAX_QUOTA: i64 = 1_000_000_000;
const MAX_AUTO_TOPUP_THRESHOLD: i64 = 100_000_000;
const MAX_AUTO_TOPUP_MAX_DAILY: u32 = 1_000_000_000;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub spending_limit: i64,
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
    #[serde(default)]
    pub denied_tools: HashSet<String>,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub quota: Option<KeyQuota>,
}

#[derive(Debug, Serialize)]
pub struct CreateKeyResponse {
    pub api_key: String,
    pub record: ApiKeyRecord,
}

pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    strip_dangerous_keys(&mut body);
    let req: CreateKeyRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))).into_response()
        }
    };

    if req.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "name must not be empty"}))).into_response();
    }

    let opts = KeyOptions {
        spending_limit: clamp_input_credits(req.spending_limit),
        allowed_tools: req.allowed_tools,
        denied_tools: req.denied_tools,
        expires_at: None,
        ip_allowlist: req.ip_allowlist,
        tags: HashMap::new(),
        namespace: req.namespace,
        quota: req.quota.map(clamp_quota),
        auto_topup: None,
    };

    let (api_key, record) = state.gate.keystore.create_key(&req.name, clamp_input_credits(req.credits), opts);

    (StatusCode::CREATED, Json(CreateKeyResponse { api_key, record })).into_response()
}

pub async fn get_key(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> impl IntoResponse {
    match state.gate.keystore.peek_key(&key) {
        Some(record) => (StatusCode::OK, Json(json!(record))).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "key not found"}))).into_response(),
    }
}

pub async fn list_keys(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let keys: Vec<Value> = state
        .gate
        .keystore
        .all_keys()
        .into_iter()
        .map(|(key, record)| json!({"apiKey": key, "record": record}))
        .collect();
    (StatusCode::OK, Json(json!({"keys": keys})))
}

pub async fn revoke_key(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> impl IntoResponse {
    if state.gate.keystore.revoke_key(&key) {
        (StatusCode::OK, Json(json!({"revoked": true}))).into_response()
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"error": "key not found"}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    /// Positive to add credits, negative to deduct.
    pub delta: i64,
}

pub async fn adjust_credits(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    strip_dangerous_keys(&mut body);
    let req: AdjustCreditsRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))).into_response()
        }
    };

    let result = if req.delta >= 0 {
        state.gate.keystore.add_credits(&key, req.delta)
    } else {
        state.gate.keystore.deduct_credits(&key, -req.delta)
    };

    match result {
        Ok(new_balance) => (StatusCode::OK, Json(json!({"balance": new_balance}))).into_response(),
        Err(()) => (StatusCode::NOT_FOUND, Json(json!({"error": "key not found"}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub namespace: Option<String>,
}

pub async fn usage_summary(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UsageQuery>,
) -> impl IntoResponse {
    let filter = crate::core::usage_meter::SummaryFilter { since: None, namespace: q.namespace };
    let summary = state.gate.usage_meter.get_summary(&filter);
    (StatusCode::OK, Json(json!(summary)))
}

pub async fn concurrency_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(state.gate.concurrency.snapshot())))
}

pub async fn usage_csv(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.gate.usage_meter.to_csv() {
        Ok(csv) => ([("content-type", "text/csv")], csv).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "usage CSV export failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to export usage").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetAutoTopupRequest {
    pub threshold: i64,
    pub amount: i64,
    pub max_daily: u32,
}

pub async fn set_auto_topup(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(mut body): Json<Value>,
) -> impl IntoResponse {
    strip_dangerous_keys(&mut body);
    let req: SetAutoTopupRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))).into_response()
        }
    };

    let policy = crate::core::key_record::AutoTopup {
        threshold: clamp_auto_topup_threshold(req.threshold),
        amount: clamp_input_credits(req.amount),
        max_daily: clamp_auto_topup_max_daily(req.max_daily),
    };

    let result = state.gate.keystore.with_record_mut(&key, |record| {
        record.auto_topup = Some(policy);
    });

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"updated": true}))).into_response(),
        Err(()) => (StatusCode::NOT_FOUND, Json(json!({"error": "key not found"}))).into_response(),
    }
}

fn clamp_quota(q: KeyQuota) -> KeyQuota {
    KeyQuota {
        daily_calls: q.daily_calls.clamp(0, MAX_QUOTA),
        monthly_calls: q.monthly_calls.clamp(0, MAX_QUOTA),
        daily_credits: q.daily_credits.clamp(0, MAX_QUOTA),
        monthly_credits: q.monthly_credits.clamp(0, MAX_QUOTA),
    }
}

fn clamp_auto_topup_threshold(n: i64) -> i64 {
    n.clamp(0, MAX_AUTO_TOPUP_THRESHOLD)
}

fn clamp_auto_topup_max_daily(n: u32) -> u32 {
    n.min(MAX_AUTO_TOPUP_MAX_DAILY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Gate, KeyStore};
    use crate::webhook::WebhookDispatcher;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn clamp_quota_caps_all_fields() {
        let q = KeyQuota {
            daily_calls: MAX_QUOTA + 1,
            monthly_calls: -5,
            daily_credits: 10,
            monthly_credits: MAX_QUOTA * 2,
        };
        let clamped = clamp_quota(q);
        assert_eq!(clamped.daily_calls, MAX_QUOTA);
        assert_eq!(clamped.monthly_calls, 0);
        assert_eq!(clamped.daily_credits, 10);
        assert_eq!(clamped.monthly_credits, MAX_QUOTA);
    }

    #[test]
    fn clamp_auto_topup_threshold_caps_at_max() {
        assert_eq!(clamp_auto_topup_threshold(MAX_AUTO_TOPUP_THRESHOLD + 1), MAX_AUTO_TOPUP_THRESHOLD);
        assert_eq!(clamp_auto_topup_threshold(-1), 0);
    }

    async fn test_state() -> Arc<AppState> {
        let gate = Arc::new(Gate::new(KeyStore::new(None), Default::default()));
        let webhook = Arc::new(WebhookDispatcher::new(Default::default()));
        Arc::new(AppState {
            gate,
            webhook,
            redis_limiter: None,
            free_methods: HashSet::new(),
            admin_bootstrap_key: "test-bootstrap".into(),
            scoped_token: Arc::new(crate::middleware::scoped_token::ScopedTokenService::new("test-secret")),
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_key_rejects_empty_name() {
        let state = test_state().await;
        let body = json!({"name": "  "});
        let response = create_key(State(state), Json(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_key_then_adjust_credits_round_trips() {
        let state = test_state().await;
        let body = json!({"name": "acct", "credits": 100});
        let response = create_key(State(state.clone()), Json(body)).await.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let created = body_json(response).await;
        let api_key = created["api_key"].as_str().unwrap().to_string();

        let response =
            adjust_credits(State(state.clone()), Path(api_key.clone()), Json(json!({"delta": -30})))
                .await
                .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let balance = body_json(response).await;
        assert_eq!(balance["balance"], 70);
    }

    #[tokio::test]
    async fn adjust_credits_on_unknown_key_is_404() {
        let state = test_state().await;
        let response = adjust_credits(State(state), Path("gw_nope".into()), Json(json!({"delta": 10})))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn revoke_unknown_key_is_404() {
        let state = test_state().await;
        let response = revoke_key(State(state), Path("gw_nope".into())).await.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
