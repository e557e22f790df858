// Integration tests for the HTTP control surface

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{engines, test_config, ScriptedLlm, ScriptedStt, ScriptedTts};
use std::sync::Arc;
use tower::ServiceExt;
use voice_gateway::{create_router, AppState, OpenAuthenticator, Pipeline};

fn app() -> axum::Router {
    let config = test_config();
    let pipeline = Arc::new(Pipeline::new(
        engines(
            Arc::new(ScriptedStt::saying("olá")),
            Arc::new(ScriptedLlm::replying(&["Olá!"])),
            Arc::new(ScriptedTts::new(1)),
        ),
        &config,
    ));
    create_router(AppState::new(pipeline, Arc::new(OpenAuthenticator), config))
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
}

#[tokio::test]
async fn test_no_sessions_initially() {
    let response = app()
        .oneshot(Request::get("/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "[]");
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let response = app()
        .oneshot(Request::get("/sessions/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app()
        .oneshot(
            Request::post("/sessions/nope/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_text(response).await.contains("Session nope not found"));
}

#[tokio::test]
async fn test_voice_endpoint_requires_upgrade() {
    let response = app()
        .oneshot(Request::get("/ws/voice").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}
