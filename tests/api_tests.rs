use std::sync::Arc;

use actix_web::{App, test, web};
use edgectl::{
    AppConfig, AppError, AppState, BindingSnapshot, Controller, LineSnapshot, MockGpioBackend,
    SideEffect, Spawner,
};
use serde_json::Value;

struct NullSpawner;

impl Spawner for NullSpawner {
    fn spawn_detached(&self, _effect: &SideEffect) -> Result<(), AppError> {
        Ok(())
    }
}

fn sample_config() -> AppConfig {
    serde_json::from_str(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1"
            },
            "outputs": [
                { "name": "led", "line": 20, "lock_direction": true }
            ],
            "inputs": [
                {
                    "name": "button",
                    "line": 26,
                    "debounce_ms": 200,
                    "output": "led",
                    "action": "off",
                    "side_effect": {
                        "path": "/usr/bin/scripts/1stscript.sh",
                        "args": ["--pressed"]
                    }
                }
            ]
        }
        "#,
    )
    .expect("valid sample config")
}

async fn running() -> (Arc<MockGpioBackend>, AppState<MockGpioBackend>) {
    let backend = Arc::new(MockGpioBackend::default());
    let controller = Arc::new(Controller::new(
        Arc::new(sample_config()),
        backend.clone(),
        Arc::new(NullSpawner),
    ));
    controller.start().await.expect("controller starts");
    (backend, AppState { controller })
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .service($state.api_scope("/api/v1")),
        )
        .await
    };
}

#[actix_rt::test]
async fn lists_exported_lines() {
    let (_backend, state) = running().await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/lines").to_request();
    let lines: Vec<LineSnapshot> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(lines.len(), 2);

    let led = lines.iter().find(|l| l.line == 20).unwrap();
    assert!(led.level);
    assert!(led.exported);
    assert!(led.direction_locked);

    state.controller.stop().await.unwrap();
}

#[actix_rt::test]
async fn line_value_tracks_edges() {
    let (backend, state) = running().await;
    let app = app!(state);

    let req = test::TestRequest::get()
        .uri("/api/v1/line/20/value")
        .to_request();
    let value: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(value, 1);

    backend.press(26).unwrap();

    let req = test::TestRequest::get()
        .uri("/api/v1/line/20/value")
        .to_request();
    let value: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(value, 0);

    let req = test::TestRequest::get().uri("/api/v1/bindings").to_request();
    let bindings: Vec<BindingSnapshot> = test::call_and_read_body_json(&app, req).await;
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].presses, 1);
    assert_eq!(bindings[0].debounce_ms, 200);

    state.controller.stop().await.unwrap();
}

#[actix_rt::test]
async fn unknown_line_returns_404() {
    let (_backend, state) = running().await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/line/999").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);

    state.controller.stop().await.unwrap();
}

#[actix_rt::test]
async fn bad_line_id_returns_400() {
    let (_backend, state) = running().await;
    let app = app!(state);

    let req = test::TestRequest::get().uri("/api/v1/line/led").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    state.controller.stop().await.unwrap();
}

#[actix_rt::test]
async fn wrong_method_returns_405() {
    let (_backend, state) = running().await;
    let app = app!(state);

    let req = test::TestRequest::post()
        .uri("/api/v1/line/20/value")
        .set_payload("1")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 405);

    state.controller.stop().await.unwrap();
}

#[actix_rt::test]
async fn stopped_controller_exposes_nothing() {
    let (_backend, state) = running().await;
    let app = app!(state);
    state.controller.stop().await.unwrap();

    let req = test::TestRequest::get().uri("/api/v1/status").to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["state"], "stopped");

    let req = test::TestRequest::get().uri("/api/v1/lines").to_request();
    let lines: Vec<LineSnapshot> = test::call_and_read_body_json(&app, req).await;
    assert!(lines.is_empty());

    let req = test::TestRequest::get().uri("/api/v1/line/20").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
