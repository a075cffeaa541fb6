//! `POST /mcp` and `POST /mcp/batch` JSON-RPC handlers (spec.md §6).

use super::{rpc_error_code, AppState};
use crate::core::gate::{CallContext, ToolCall};
use crate::error::DenyReason;
use crate::utils::json_safety::strip_dangerous_keys;
use axum::{
    extract::{Json, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    fn failure(id: Option<Value>, code: i64, message: String, data: Option<Value>) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(JsonRpcError { code, message, data }) }
    }
}

static NEED_HAVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"need (\d+)").unwrap());

/// Builds the x402-style payment data block spec.md §6 mandates for
/// `insufficient_credits` / `spending_limit_exceeded` / `team_budget_exceeded`.
fn payment_data(reason: &str, credits_available: i64) -> Value {
    let credits_required = NEED_HAVE
        .captures(reason)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .unwrap_or(credits_available.max(0) + 1);

    json!({
        "version": "1",
        "scheme": "credits",
        "creditsRequired": credits_required,
        "creditsAvailable": credits_available,
        "topUpUrl": "/api/admin/keys/topup",
        "pricingUrl": "/api/admin/pricing",
        "accepts": ["X-API-Key", "Bearer"],
    })
}

/// A presented credential: either a raw API key, or an API key narrowed to
/// a tool subset by a scoped token (spec.md §4.2 step 5).
struct Credential {
    api_key: String,
    scoped_tools: Option<std::collections::HashSet<String>>,
}

fn extract_credential(state: &AppState, headers: &HeaderMap) -> Option<Credential> {
    if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(Credential { api_key: v.to_string(), scoped_tools: None });
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))?;

    match state.scoped_token.validate(bearer) {
        Ok(claims) => Some(Credential { api_key: claims.key, scoped_tools: Some(claims.tools) }),
        // Not a scoped token we can decode (or an expired/forged one) —
        // fall back to treating it as a raw API key.
        Err(_) => Some(Credential { api_key: bearer.to_string(), scoped_tools: None }),
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<Ipv4Addr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse().ok())
}

pub async fn handle_mcp(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    strip_dangerous_keys(&mut req.params);

    if state.free_methods.contains(&req.method) {
        return (StatusCode::OK, Json(JsonRpcResponse::success(req.id, json!({"ok": true}))));
    }

    if req.method != "tools/call" {
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::failure(req.id, -32601, format!("unknown method: {}", req.method), None)),
        );
    }

    let Some(credential) = extract_credential(&state, &headers) else {
        let reason = DenyReason::MissingApiKey.to_string();
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::failure(req.id, rpc_error_code(&reason), reason, None)),
        );
    };
    let api_key = credential.api_key;

    let tool = req.params.get("tool").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let args = req.params.get("args").cloned();
    let client_ip = extract_client_ip(&headers);

    let ctx = CallContext { api_key: &api_key, client_ip, key_group_pricing: None };
    let call = ToolCall { tool: &tool, args: args.as_ref(), scoped_tools: credential.scoped_tools.as_ref() };

    if let Some(limiter) = &state.redis_limiter {
        limiter.record(&format!("{}:tool:{}", api_key, tool)).await;
    }

    let decision = state.gate.evaluate(ctx, call).await;

    if !decision.allowed {
        let reason_str = decision.reason.clone().unwrap_or_default();
        let code = rpc_error_code(&reason_str);
        let data = if code == -32402 { Some(payment_data(&reason_str, decision.remaining_credits)) } else { None };
        return (StatusCode::OK, Json(JsonRpcResponse::failure(req.id, code, reason_str, data)));
    }

    (
        StatusCode::OK,
        Json(JsonRpcResponse::success(
            req.id,
            json!({
                "allowed": decision.allowed,
                "reason": decision.reason,
                "creditsCharged": decision.credits_charged,
                "remainingCredits": decision.remaining_credits,
            }),
        )),
    )
}

pub async fn handle_mcp_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    strip_dangerous_keys(&mut req.params);

    let Some(credential) = extract_credential(&state, &headers) else {
        let reason = DenyReason::MissingApiKey.to_string();
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::failure(req.id, rpc_error_code(&reason), reason, None)),
        );
    };
    let api_key = credential.api_key;
    let scoped_tools = credential.scoped_tools;

    let calls_value = req.params.get("calls").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let tools: Vec<String> = calls_value
        .iter()
        .map(|c| c.get("tool").and_then(|v| v.as_str()).unwrap_or("").to_string())
        .collect();
    let args: Vec<Option<Value>> = calls_value.iter().map(|c| c.get("args").cloned()).collect();

    let client_ip = extract_client_ip(&headers);
    let ctx = CallContext { api_key: &api_key, client_ip, key_group_pricing: None };
    let calls: Vec<ToolCall> = tools
        .iter()
        .zip(args.iter())
        .map(|(tool, arg)| ToolCall { tool, args: arg.as_ref(), scoped_tools: scoped_tools.as_ref() })
        .collect();

    let batch = state.gate.evaluate_batch(ctx, calls).await;

    let results: Vec<Value> = batch
        .decisions
        .iter()
        .map(|d| {
            json!({
                "allowed": d.allowed,
                "reason": d.reason,
                "creditsCharged": d.credits_charged,
                "remainingCredits": d.remaining_credits,
            })
        })
        .collect();

    (
        StatusCode::OK,
        Json(JsonRpcResponse::success(
            req.id,
            json!({
                "allAllowed": batch.all_allowed,
                "failedIndex": batch.failed_index,
                "results": results,
            }),
        )),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_record::KeyOptions;
    use crate::core::{Gate, KeyStore};
    use crate::webhook::WebhookDispatcher;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn test_state() -> (Arc<AppState>, String) {
        let gate = Arc::new(Gate::new(KeyStore::new(None), Default::default()));
        let (api_key, _) = gate.keystore.create_key("tester", 50, KeyOptions::default());
        let webhook = Arc::new(WebhookDispatcher::new(Default::default()));
        let state = Arc::new(AppState {
            gate,
            webhook,
            redis_limiter: None,
            free_methods: ["initialize".to_string()].into(),
            admin_bootstrap_key: "x".into(),
            scoped_token: Arc::new(crate::middleware::scoped_token::ScopedTokenService::new("test-secret")),
        });
        (state, api_key)
    }

    #[tokio::test]
    async fn free_method_bypasses_gate_without_api_key() {
        let (state, _) = test_state().await;
        let req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(1)),
            method: "initialize".into(),
            params: Value::Null,
        };
        let response = handle_mcp(State(state), HeaderMap::new(), Json(req)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let resp = body_json(response).await;
        assert!(resp.get("error").is_none());
    }

    #[tokio::test]
    async fn tools_call_without_api_key_is_denied_with_missing_key_code() {
        let (state, _) = test_state().await;
        let req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(2)),
            method: "tools/call".into(),
            params: json!({"tool": "search"}),
        };
        let response = handle_mcp(State(state), HeaderMap::new(), Json(req)).await.into_response();
        let resp = body_json(response).await;
        assert_eq!(resp["error"]["code"], -32401);
    }

    #[tokio::test]
    async fn tools_call_with_valid_key_succeeds() {
        let (state, api_key) = test_state().await;
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&api_key).unwrap());
        let req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(3)),
            method: "tools/call".into(),
            params: json!({"tool": "search"}),
        };
        let response = handle_mcp(State(state), headers, Json(req)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let resp = body_json(response).await;
        assert!(resp.get("error").is_none());
        assert_eq!(resp["result"]["allowed"], true);
    }

    #[tokio::test]
    async fn scoped_token_narrows_tool_access() {
        let (state, api_key) = test_state().await;
        let mut tools = std::collections::HashSet::new();
        tools.insert("search".to_string());
        let token = state.scoped_token.issue(&api_key, tools, 60).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());

        let allowed_req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(10)),
            method: "tools/call".into(),
            params: json!({"tool": "search"}),
        };
        let response = handle_mcp(State(state.clone()), headers.clone(), Json(allowed_req)).await.into_response();
        let resp = body_json(response).await;
        assert_eq!(resp["result"]["allowed"], true);

        let denied_req = JsonRpcRequest {
            jsonrpc: "2.0".into(),
            id: Some(json!(11)),
            method: "tools/call".into(),
            params: json!({"tool": "translate"}),
        };
        let response = handle_mcp(State(state), headers, Json(denied_req)).await.into_response();
        let resp = body_json(response).await;
        assert_eq!(resp["error"]["message"], "token_tool_not_allowed: translate not in scoped token");
    }

    #[test]
    fn payment_data_parses_need_from_reason() {
        let data = payment_data("insufficient_credits: need 13, have 10", 10);
        assert_eq!(data["creditsRequired"], 13);
        assert_eq!(data["creditsAvailable"], 10);
        assert_eq!(data["scheme"], "credits");
    }

    #[test]
    fn rpc_error_code_maps_families() {
        assert_eq!(rpc_error_code("insufficient_credits: need 1, have 0"), -32402);
        assert_eq!(rpc_error_code("rate_limited: 5 calls/min exceeded"), -32001);
        assert_eq!(rpc_error_code("missing_api_key"), -32401);
        assert_eq!(rpc_error_code("key_revoked"), -32603);
    }
}
