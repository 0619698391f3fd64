//! Integration tests for the arena-web server.
//!
//! These tests start a real axum server on a random port, backed by a fake
//! sandbox and a fake LLM provider served from a second axum server, and
//! exercise the REST endpoints with reqwest.

use std::net::SocketAddr;
use std::sync::Arc;

use arena_rs::prelude::*;
use arena_web::{WebBroadcastHandler, WebConfig, WsMessage, spawn_web};
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};

// ── Fakes ────────────────────────────────────────────────────────────

/// Sandbox that prints the sum of the numbers on stdin, or `0` when the
/// source contains `WRONG`.
async fn fake_sandbox(axum::Json(payload): axum::Json<Value>) -> axum::Json<Value> {
    let inner = payload
        .get("body")
        .and_then(Value::as_str)
        .and_then(|b| serde_json::from_str::<Value>(b).ok());
    let request = inner.unwrap_or_else(|| payload.clone());

    let code = request["compile"]["source_code"].as_str().unwrap_or_default();
    let stdin = request["execute"]["stdin"].as_str().unwrap_or_default();
    let sum: i64 = stdin
        .split_whitespace()
        .filter_map(|t| t.parse::<i64>().ok())
        .sum();
    let stdout = if code.contains("WRONG") {
        "0\n".to_string()
    } else {
        format!("{sum}\n")
    };
    let result = json!({
        "compile": {"exit_code": 0, "stdout": "", "stderr": ""},
        "execute": {
            "exit_code": 0,
            "stdout": stdout,
            "stderr": "",
            "wall_time": "0.010",
            "memory_usage": 1024,
        }
    });
    axum::Json(json!({"statusCode": 200, "body": result.to_string()}))
}

/// Chat-completion provider. The key `sk-limited` is always rate limited.
async fn fake_provider(headers: HeaderMap, axum::Json(body): axum::Json<Value>) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if auth == "Bearer sk-limited" {
        let error = json!({"error": {"message": "slow down"}});
        return (StatusCode::TOO_MANY_REQUESTS, axum::Json(error)).into_response();
    }
    let envelope = json!({
        "id": "chatcmpl-1",
        "model": body["model"],
        "choices": [{
            "message": {
                "role": "assistant",
                "content": "{\"action\": \"VIEW_PROBLEMS\", \"parameters\": {}}"
            }
        }],
        "usage": {"prompt_tokens": 30, "completion_tokens": 20, "total_tokens": 50}
    });
    axum::Json(envelope).into_response()
}

async fn spawn_fakes() -> SocketAddr {
    let router = Router::new()
        .route("/sandbox", post(fake_sandbox))
        .route("/v1/chat/completions", post(fake_provider));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

// ── Harness ──────────────────────────────────────────────────────────

struct TestServer {
    base: String,
    fakes: SocketAddr,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let fakes = spawn_fakes().await;
        let config = ArenaConfig::default().with_sandbox_url(format!("http://{fakes}/sandbox"));

        let (ws_tx, _) = tokio::sync::broadcast::channel::<WsMessage>(64);
        let handler = CompositeEventHandler::new().with(WebBroadcastHandler::new(ws_tx.clone()));
        let arena = Arena::from_config(config, Arc::new(handler)).unwrap();

        let web_config = WebConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            ..Default::default()
        };
        let addr = spawn_web(Arc::new(arena), ws_tx, web_config).await.unwrap();
        Self {
            base: format!("http://{addr}"),
            fakes,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    /// Competition with one bronze A+B problem and a 1000-token budget.
    async fn competition(&self) -> String {
        let (status, body) = self
            .post(
                "/api/competitions",
                json!({
                    "title": "Spring",
                    "max_tokens_per_participant": 1000,
                    "problems": [{
                        "id": "p1",
                        "title": "Sum",
                        "description": "Print the sum of two numbers.",
                        "level": "bronze",
                        "test_cases": [
                            {"id": "t1", "input": "1 2", "expected_output": "3"},
                            {"id": "t2", "input": "5 7", "expected_output": "12"}
                        ],
                        "sample_cases": [
                            {"id": "s1", "input": "2 2", "expected_output": "4"}
                        ]
                    }]
                }),
            )
            .await;
        assert_eq!(status, 200, "{body}");
        body["data"]["id"].as_str().unwrap().to_string()
    }

    async fn participant(&self, comp: &str, name: &str, key: &str) -> String {
        let (status, body) = self
            .post(
                &format!("/api/competitions/{comp}/participants"),
                json!({
                    "name": name,
                    "api_base_url": format!("http://{}", self.fakes),
                    "api_key": key,
                    "model_id": "test-model"
                }),
            )
            .await;
        assert_eq!(status, 200, "{body}");
        body["data"]["id"].as_str().unwrap().to_string()
    }
}

// ── Competitions ─────────────────────────────────────────────────────

#[tokio::test]
async fn competition_views_hide_secrets() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;

    let (status, body) = server.get(&format!("/api/competitions/{comp}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "success");
    assert_eq!(body["data"]["title"], "Spring");
    assert!(body["data"]["problems"][0]["test_cases"]
        .as_array()
        .unwrap()
        .is_empty());
    assert_eq!(body["data"]["participants"][0]["provider"]["api_key"], "");

    let (_, body) = server
        .get(&format!("/api/competitions/{comp}/participants/{alice}"))
        .await;
    assert_eq!(body["data"]["remaining_tokens"], 1000);
    assert_eq!(body["data"]["provider"]["api_key"], "");

    let (status, body) = server.get(&format!("/api/competitions/{comp}/problems/p1")).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["max_score"], 100);
    assert_eq!(body["data"]["sample_cases"][0]["input"], "2 2");
    assert!(body["data"].get("test_cases").is_none());

    let (_, body) = server.get("/api/competitions").await;
    assert_eq!(body["data"][0]["participant_count"], 1);
}

#[tokio::test]
async fn unknown_ids_are_404_envelopes() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/api/competitions/c-missing").await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("c-missing"));

    let comp = server.competition().await;
    let (status, _) = server
        .get(&format!("/api/competitions/{comp}/problems/nope"))
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn malformed_bodies_are_400() {
    let server = TestServer::start().await;
    let resp = server
        .client
        .post(format!("{}/api/competitions", server.base))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "error");

    let (status, _) = server
        .post("/api/competitions", json!({"title": "  ", "problems": []}))
        .await;
    assert_eq!(status, 400);
}

// ── Submissions ──────────────────────────────────────────────────────

#[tokio::test]
async fn submissions_judged_and_ranked() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;
    let bob = server.participant(&comp, "bob", "sk-bob").await;
    let submit = format!("/api/competitions/{comp}/submit");

    let (status, body) = server
        .post(
            &submit,
            json!({"participant_id": bob, "problem_id": "p1", "code": "WRONG", "language": "python3"}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["data"]["status"], "WA");
    assert_eq!(body["data"]["penalty"], 10);
    assert_eq!(body["data"]["passed_tests"], 0);
    assert_eq!(body["data"]["total_tests"], 2);

    let (_, body) = server
        .post(
            &submit,
            json!({"participant_id": alice, "problem_id": "p1", "code": "print(sum(...))", "language": "python3"}),
        )
        .await;
    assert_eq!(body["data"]["status"], "AC");
    assert_eq!(body["data"]["score"], 200);
    assert_eq!(body["data"]["first_to_solve_bonus"], 100);
    assert_eq!(body["data"]["test_results"].as_array().unwrap().len(), 2);

    let (_, body) = server
        .post(
            &submit,
            json!({"participant_id": bob, "problem_id": "p1", "code": "ok", "language": "python3"}),
        )
        .await;
    assert_eq!(body["data"]["score"], 100);
    assert_eq!(body["data"]["first_to_solve_bonus"], 0);

    let (_, body) = server.get(&format!("/api/competitions/{comp}/rankings")).await;
    let rankings = body["data"].as_array().unwrap();
    assert_eq!(rankings[0]["name"], "alice");
    assert_eq!(rankings[0]["score"], 200);
    assert_eq!(rankings[1]["score"], 90);

    let (_, body) = server
        .get(&format!(
            "/api/competitions/{comp}/submissions?participant_id={bob}"
        ))
        .await;
    let subs = body["data"].as_array().unwrap();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0]["code"], "");
}

#[tokio::test]
async fn solving_everything_terminates_and_blocks_further_calls() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;
    let submit = format!("/api/competitions/{comp}/submit");
    let solution = json!({"participant_id": alice, "problem_id": "p1", "code": "ok"});

    let (status, _) = server.post(&submit, solution.clone()).await;
    assert_eq!(status, 200);

    let (_, body) = server
        .get(&format!("/api/competitions/{comp}/participants/{alice}/status"))
        .await;
    assert_eq!(body["data"]["is_running"], false);
    assert_eq!(body["data"]["termination_reason"], "all_problems_solved");

    let (status, body) = server.post(&submit, solution).await;
    assert_eq!(status, 409);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn missing_submission_fields_rejected() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;
    let (status, body) = server
        .post(
            &format!("/api/competitions/{comp}/submit"),
            json!({"participant_id": alice, "problem_id": "p1", "code": ""}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["message"], "Missing required fields");
}

// ── Hints ────────────────────────────────────────────────────────────

#[tokio::test]
async fn hints_charge_the_budget_and_denials_are_values() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;
    let hints = format!("/api/competitions/{comp}/hints");

    let (status, body) = server
        .post(
            &hints,
            json!({"participant_id": alice, "problem_id": "p1", "hint_level": 1}),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["data"]["decision"], "granted");
    assert_eq!(body["data"]["remaining_tokens"], 900);
    assert_eq!(body["data"]["hint_content"]["current_problem"]["id"], "p1");

    let (status, body) = server
        .post(&hints, json!({"participant_id": alice, "hint_level": 4, "hint_knowledge": "dp"}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["decision"], "denied");
    assert_eq!(body["data"]["cost"], 1000);
    assert!(body["data"]["hint_content"].is_null());

    let (_, body) = server
        .get(&format!("/api/competitions/{comp}/participants/{alice}"))
        .await;
    assert_eq!(body["data"]["remaining_tokens"], 900);
    assert_eq!(body["data"]["hint_tokens"], 100);
}

// ── Agent requests ───────────────────────────────────────────────────

#[tokio::test]
async fn agent_request_forwarded_and_charged() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;

    let (status, body) = server
        .post(
            "/api/agent/request",
            json!({
                "competition_id": comp,
                "participant_id": alice,
                "json": {"model": "test-model", "messages": [{"role": "user", "content": "hi"}]}
            }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    let data = &body["data"];
    assert_eq!(data["status"], 200);
    assert_eq!(data["content"]["id"], "chatcmpl-1");
    assert_eq!(data["usage"]["total_tokens"], 50);
    assert_eq!(data["usage"]["remaining_tokens"], 950);

    let (_, body) = server
        .get(&format!("/api/competitions/{comp}/participants/{alice}"))
        .await;
    assert_eq!(body["data"]["llm_tokens"], 50);
}

#[tokio::test]
async fn agent_request_mirrors_upstream_failure() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let limited = server.participant(&comp, "limited", "sk-limited").await;

    let (status, body) = server
        .post(
            "/api/agent/request",
            json!({
                "competition_id": comp,
                "participant_id": limited,
                "json": {"model": "test-model", "messages": []}
            }),
        )
        .await;
    assert_eq!(status, 429);
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().contains("slow down"));

    let (_, body) = server
        .get(&format!("/api/competitions/{comp}/participants/{limited}"))
        .await;
    assert_eq!(body["data"]["remaining_tokens"], 1000);
}

#[tokio::test]
async fn agent_request_without_json_rejected() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;
    let (status, _) = server
        .post(
            "/api/agent/request",
            json!({"competition_id": comp, "participant_id": alice}),
        )
        .await;
    assert_eq!(status, 400);
}

// ── Termination and system ───────────────────────────────────────────

#[tokio::test]
async fn terminated_participants_get_409() {
    let server = TestServer::start().await;
    let comp = server.competition().await;
    let alice = server.participant(&comp, "alice", "sk-alice").await;

    let (status, body) = server
        .post(
            &format!("/api/competitions/{comp}/participants/{alice}/terminate"),
            json!({}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["termination_reason"], "competitor_terminated");

    let (status, body) = server
        .post(
            &format!("/api/competitions/{comp}/hints"),
            json!({"participant_id": alice, "hint_level": 0}),
        )
        .await;
    assert_eq!(status, 409);
    assert!(body["message"].as_str().unwrap().contains("competitor_terminated"));
}

#[tokio::test]
async fn sandbox_status_probes_the_sandbox() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/api/system/sandbox-status").await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["connected"], true);
}
