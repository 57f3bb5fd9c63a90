//! Integration tests for the server API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use netchecker_server::api::{create_router, AppState};
use prometheus::Registry;
use server_lib::{
    AgentMetrics, AgentStore, CacheJanitor, MembershipSource, StalenessPolicy, StaticMembership,
    StructuredLogger,
};
use server_lib::store::VolatileStore;
use std::sync::Arc;
use tower::ServiceExt;

fn report(pod: &str) -> String {
    serde_json::json!({
        "report_interval": 5,
        "nodename": "node-1",
        "podname": pod,
        "hostdate": "2024-03-01T10:00:00Z",
        "uptime": 42,
        "nslookup": {"kubernetes": ["10.0.0.1"]},
        "network_probes": [{
            "URL": "http://kubernetes",
            "ConnectionResult": 1,
            "HTTPCode": 200,
            "Total": 10,
            "ContentTransfer": 1,
            "TCPConnection": 2,
            "DNSLookup": 3,
            "Connect": 4,
            "ServerProcessing": 5
        }],
        "ips": {"eth0": ["10.1.0.5"]}
    })
    .to_string()
}

struct TestApp {
    router: Router,
    membership: Option<Arc<StaticMembership>>,
}

fn setup_test_app(expected: Option<&[&str]>) -> TestApp {
    let metrics = AgentMetrics::with_registry(Registry::new()).unwrap();
    let store: Arc<dyn AgentStore> =
        Arc::new(VolatileStore::new(metrics.clone(), StalenessPolicy::default()));
    let membership = expected.map(|ids| Arc::new(StaticMembership::new(ids.iter().copied())));
    let janitor = Arc::new(CacheJanitor::new(
        store.clone(),
        membership
            .clone()
            .map(|m| m as Arc<dyn MembershipSource>),
        StructuredLogger::new("volatile"),
    ));
    let state = Arc::new(AppState::new(
        store,
        janitor,
        metrics,
        StructuredLogger::new("volatile"),
    ));

    TestApp {
        router: create_router(state),
        membership,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

fn post_report(name: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/api/v1/agents/{name}"))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_ping_returns_ok() {
    let app = setup_test_app(None);
    let (status, _) = send(&app.router, get("/api/v1/ping")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_post_then_get_agent() {
    let app = setup_test_app(None);

    let (status, body) = send(&app.router, post_report("agent-pod", report("agent-pod"))).await;
    assert_eq!(status, StatusCode::OK);
    let accepted: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(accepted["podname"], "agent-pod");
    assert!(accepted["last_updated"].is_string());

    let (status, body) = send(&app.router, get("/api/v1/agents/agent-pod")).await;
    assert_eq!(status, StatusCode::OK);
    let fetched: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(fetched, accepted);
    assert_eq!(fetched["network_probes"][0]["HTTPCode"], 200);
}

#[tokio::test]
async fn test_invalid_report_is_bad_request() {
    let app = setup_test_app(None);

    let (status, _) = send(&app.router, post_report("agent-pod", "{not json".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let zero_interval =
        report("agent-pod").replace("\"report_interval\":5", "\"report_interval\":0");
    let (status, _) = send(&app.router, post_report("agent-pod", zero_interval)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_agent_is_not_found() {
    let app = setup_test_app(None);
    let (status, _) = send(&app.router, get("/api/v1/agents/ghost")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_agents_purges_unexpected() {
    let app = setup_test_app(Some(&["agent-pod", "agent-pod-hostnet"]));
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;
    send(&app.router, post_report("old-pod", report("old-pod"))).await;

    let (status, body) = send(&app.router, get("/api/v1/agents/")).await;
    assert_eq!(status, StatusCode::OK);
    let agents: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let names: Vec<&String> = agents.as_object().unwrap().keys().collect();
    assert_eq!(names, vec!["agent-pod"]);
}

#[tokio::test]
async fn test_connectivity_check_reports_absent_agents() {
    let app = setup_test_app(Some(&["agent-pod", "agent-pod-hostnet"]));
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;

    let (status, body) = send(&app.router, get("/api/v1/connectivity_check")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        result["message"],
        "Connectivity check fails. Reason: there are absent or outdated pods; look up the payload"
    );
    assert_eq!(result["absent"], serde_json::json!(["agent-pod-hostnet"]));
    assert!(result.get("outdated").is_none());
}

#[tokio::test]
async fn test_connectivity_check_passes_when_all_report() {
    let app = setup_test_app(Some(&["agent-pod", "agent-pod-hostnet"]));
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;
    send(
        &app.router,
        post_report("agent-pod-hostnet", report("agent-pod-hostnet")),
    )
    .await;

    let (status, body) = send(&app.router, get("/api/v1/connectivity_check")).await;
    assert_eq!(status, StatusCode::OK);
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        result["message"],
        "All 2 pods successfully reported back to the server"
    );

    // A pod leaving the cluster is purged and no longer counted
    app.membership
        .as_ref()
        .unwrap()
        .replace(["agent-pod"])
        .await;
    let (status, body) = send(&app.router, get("/api/v1/connectivity_check")).await;
    assert_eq!(status, StatusCode::OK);
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        result["message"],
        "All 1 pods successfully reported back to the server"
    );
}

#[tokio::test]
async fn test_connectivity_check_without_membership() {
    let app = setup_test_app(None);
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;

    let (status, body) = send(&app.router, get("/api/v1/connectivity_check")).await;
    assert_eq!(status, StatusCode::OK);
    let result: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        result["message"],
        "All 1 pods successfully reported back to the server"
    );
}

#[tokio::test]
async fn test_metrics_expose_agent_series() {
    let app = setup_test_app(None);
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;

    let (status, body) = send(&app.router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("ncagent_report_count_total{agent=\"node-1-private_network\"} 1"));
    assert!(text.contains("ncagent_http_probe_code"));
}

#[tokio::test]
async fn test_metrics_survive_purge_of_pod_on_same_node() {
    let app = setup_test_app(Some(&["agent-pod", "old-pod"]));
    send(&app.router, post_report("old-pod", report("old-pod"))).await;
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;

    app.membership
        .as_ref()
        .unwrap()
        .replace(["agent-pod"])
        .await;
    let (status, _) = send(&app.router, get("/api/v1/agents/")).await;
    assert_eq!(status, StatusCode::OK);
    send(&app.router, post_report("agent-pod", report("agent-pod"))).await;

    let (_, body) = send(&app.router, get("/metrics")).await;
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("ncagent_report_count_total{agent=\"node-1-private_network\"} 3"));
}
