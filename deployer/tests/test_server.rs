//! HTTP front door tests

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use sitedeploy::deploy::fsm::SiteEvent;
use sitedeploy::deploy::orchestrator::{self, Orchestrator};
use sitedeploy::models::job::{JobData, ProviderKind};
use sitedeploy::providers::ProviderRegistry;
use sitedeploy::queue::{JobQueue, MemoryJobQueue};
use sitedeploy::server::serve::router;
use sitedeploy::server::state::ServerState;
use sitedeploy::store::{MemorySiteStore, SiteStore};

struct Harness {
    app: Router,
    queue: Arc<MemoryJobQueue>,
    store: Arc<MemorySiteStore>,
}

fn harness() -> Harness {
    let queue = Arc::new(MemoryJobQueue::new());
    let store = Arc::new(MemorySiteStore::new());
    let orchestrator = Arc::new(Orchestrator::new(
        ProviderRegistry::new(),
        store.clone(),
        orchestrator::Options::default(),
    ));
    let state = ServerState::new(queue.clone(), store.clone(), orchestrator);
    Harness {
        app: router(Arc::new(state)),
        queue,
        store,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_and_version() {
    let h = harness();

    let (status, body) = send(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "sitedeploy");
    assert!(body["timestamp"].is_string());

    let (status, body) = send(&h.app, Method::GET, "/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_trigger_enqueues_job() {
    let h = harness();
    let (status, body) = send(
        &h.app,
        Method::POST,
        "/deployments/trigger",
        Some(json!({
            "siteId": "s1",
            "bundlePath": "/tmp/bundles/s1",
            "provider": "vercel",
            "priority": 5,
            "options": { "provider": "vercel", "teamId": "team_1" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    let job_id = body["jobId"].as_str().unwrap().to_string();

    let (status, stats) = send(&h.app, Method::GET, "/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["totalProcessed"], 0);

    let job = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.priority, 5);
}

#[tokio::test]
async fn test_trigger_rejects_bad_input() {
    let h = harness();

    let (status, body) = send(
        &h.app,
        Method::POST,
        "/deployments/trigger",
        Some(json!({ "bundlePath": "/tmp/b", "provider": "vercel" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = send(
        &h.app,
        Method::POST,
        "/deployments/trigger",
        Some(json!({ "siteId": "s1", "bundlePath": "/tmp/b", "provider": "vercel", "priority": 5000 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &h.app,
        Method::POST,
        "/deployments/trigger",
        Some(json!({
            "siteId": "s1",
            "bundlePath": "/tmp/b",
            "provider": "vercel",
            "options": { "provider": "netlify", "accountSlug": "acme" }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Validation"));

    assert_eq!(h.queue.stats().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_site_status() {
    let h = harness();

    let (status, body) = send(&h.app, Method::GET, "/deployments/nope/status", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    h.store.transition_site("s1", SiteEvent::Build).await.unwrap();
    let (status, body) = send(&h.app, Method::GET, "/deployments/s1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["siteId"], "s1");
    assert_eq!(body["status"], "building");
    assert!(body["deployedUrl"].is_null());

    h.store
        .transition_site(
            "s1",
            SiteEvent::Succeed {
                provider: ProviderKind::Vercel,
                deployed_url: "https://s1.vercel.app".to_string(),
                deployment_id: "dpl_1".to_string(),
            },
        )
        .await
        .unwrap();
    let (_, body) = send(&h.app, Method::GET, "/deployments/s1/status", None).await;
    assert_eq!(body["status"], "live");
    assert_eq!(body["deployedUrl"], "https://s1.vercel.app");
    assert!(body["lastDeployedAt"].is_string());
}

#[tokio::test]
async fn test_delete_and_rollback() {
    let h = harness();

    let (status, _) = send(&h.app, Method::DELETE, "/sites/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    h.store.transition_site("s1", SiteEvent::Build).await.unwrap();
    let (status, body) = send(&h.app, Method::DELETE, "/sites/s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");

    let (status, body) = send(
        &h.app,
        Method::POST,
        "/sites/s1/rollback",
        Some(json!({ "targetDeploymentId": "dpl_0" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_dead_letter_endpoints() {
    let h = harness();
    h.queue
        .enqueue(JobData::new("s1", "/tmp/bundles/s1", ProviderKind::Netlify), 0)
        .await
        .unwrap();
    let job = h.queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    h.queue.dead_letter(&job, "bundle is missing index.html").await.unwrap();

    let (status, body) = send(&h.app, Method::GET, "/queue/failed?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["error"], "bundle is missing index.html");
    assert_eq!(body[0]["job"]["siteId"], "s1");

    let (status, _) = send(&h.app, Method::POST, "/queue/failed/7/retry", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&h.app, Method::POST, "/queue/failed/0/retry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job.id.as_str());

    let (status, body) = send(&h.app, Method::DELETE, "/queue/failed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 0);

    let (status, body) = send(&h.app, Method::GET, "/queue/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["queueSizes"]["pending"], 1);
}
