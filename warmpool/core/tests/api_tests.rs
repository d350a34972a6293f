//! Admin HTTP surface tests against a real listener

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use common::{controller_with, fast_config, StubProvider};
use warmpool_core::{
    serve, ApiState, LogFilter, MemoryStateStore, Outcome, PoolController, PoolPhase,
};

const KEY: &str = "correct horse battery staple";

struct Harness {
    base: String,
    client: reqwest::Client,
    controller: PoolController,
    provider: Arc<StubProvider>,
    _shutdown: oneshot::Sender<()>,
}

impl Harness {
    async fn start() -> Self {
        let mut config = fast_config();
        config.admin.api_key = Some(KEY.to_string());
        Self::start_with(config).await
    }

    async fn start_with(config: warmpool_core::ControllerConfig) -> Self {
        let provider = StubProvider::new(Duration::from_millis(10));
        let controller =
            controller_with(config, Arc::new(MemoryStateStore::new()), provider.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let state = ApiState::new(controller.clone());
        tokio::spawn(async move {
            serve(listener, state, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            controller,
            provider,
            _shutdown: tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn denied(&self, action: &str) -> usize {
        self.controller
            .audit()
            .query(&LogFilter {
                action: Some(action.into()),
                ..Default::default()
            })
            .unwrap()
            .rows
            .iter()
            .filter(|row| row.outcome == Outcome::Denied)
            .count()
    }
}

#[tokio::test]
async fn test_healthz_needs_no_key() {
    let h = Harness::start().await;
    let response = h.client.get(h.url("/healthz")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_key_is_forbidden_and_audited() {
    let h = Harness::start().await;

    let response = h.client.get(h.url("/pool")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "FORBIDDEN");

    let rows = h
        .controller
        .audit()
        .query(&LogFilter {
            action: Some("view_pool".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rows.total, 1);
    let row = &rows.rows[0];
    assert_eq!(row.outcome, Outcome::Denied);
    assert_eq!(row.route, "GET /pool");
    assert_eq!(row.actor, None);
    assert_eq!(row.ip.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn test_wrong_key_wins_over_bad_body() {
    let h = Harness::start().await;

    let response = h
        .client
        .post(h.url("/pool"))
        .header("x-admin-key", "guess")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.denied("configure_pool"), 1);
    assert_eq!(h.provider.creates(), 0);

    // the presented key is fingerprinted, never stored
    let rows = h.controller.audit().query(&LogFilter::default()).unwrap();
    let actor = rows.rows[0].actor.clone().unwrap();
    assert_ne!(actor, "guess");
    assert_eq!(actor, h.controller.audit().fingerprint("guess"));
}

#[tokio::test]
async fn test_unconfigured_key_forbids_everything() {
    let h = Harness::start_with(fast_config()).await;
    let response = h
        .client
        .post(h.url("/pool/terminate"))
        .header("x-admin-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.denied("terminate_pool"), 1);
}

#[tokio::test]
async fn test_configure_get_and_terminate() {
    let h = Harness::start().await;

    let configured: Value = h
        .client
        .post(h.url("/pool"))
        .header("x-admin-key", KEY)
        .json(&json!({ "desiredSize": 1, "safeMode": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(configured["desiredSize"], 1);
    assert_eq!(configured["safeMode"], true);

    // configure schedules provisioning in the background
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.controller.status().unwrap().phase() != PoolPhase::Warm {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let pool: Value = h
        .client
        .get(h.url("/pool"))
        .header("x-admin-api-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(pool["instance"]["status"], "running");
    assert_eq!(pool["instance"]["contractId"], "contract-1");

    let response = h
        .client
        .post(h.url("/pool/terminate"))
        .header("x-admin-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let terminated: Value = response.json().await.unwrap();
    assert_eq!(terminated["outcome"]["result"], "terminated");
    assert_eq!(terminated["pool"]["instance"], Value::Null);
    assert_eq!(h.provider.destroys(), 1);
}

#[tokio::test]
async fn test_bad_configure_body_is_rejected() {
    let h = Harness::start().await;
    let response = h
        .client
        .post(h.url("/pool"))
        .header("x-admin-key", KEY)
        .json(&json!({ "desiredSize": "lots" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.provider.creates(), 0);
}

#[tokio::test]
async fn test_logs_are_paginated() {
    let h = Harness::start().await;
    for _ in 0..3 {
        h.client.get(h.url("/pool")).send().await.unwrap();
    }

    let page: Value = h
        .client
        .get(h.url("/logs?limit=2&action=view_pool"))
        .header("x-admin-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 3);
    assert_eq!(page["rows"].as_array().unwrap().len(), 2);

    let as_of = page["asOf"].as_u64().unwrap();
    let rest: Value = h
        .client
        .get(h.url(&format!("/logs?limit=2&offset=2&action=view_pool&asOf={as_of}")))
        .header("x-admin-key", KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rest["rows"].as_array().unwrap().len(), 1);

    // reading the log is itself audited
    let views = h
        .controller
        .audit()
        .query(&LogFilter {
            action: Some("view_logs".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(views.total, 2);
}

#[tokio::test]
async fn test_bad_log_query_is_rejected() {
    let h = Harness::start().await;
    let response = h
        .client
        .get(h.url("/logs?limit=many"))
        .header("x-admin-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
