mod common;

use actix_web::{App, http::StatusCode, test, web};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::TestService;
use runjail::report::{ExecutionResult, Verdict};
use runjail::routes::ErrorResponse;
use runjail::web_server::configure;

macro_rules! init_app {
    ($service:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($service.scheduler.clone()))
                .configure(configure),
        )
        .await
    };
}

#[actix_web::test]
async fn test_post_run_success() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    let req = test::TestRequest::post()
        .uri("/run")
        .set_json(json!({ "language": "sh", "source": "echo hi" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let result: ExecutionResult = test::read_body_json(resp).await;
    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(result.stdout, "hi\n");
}

#[actix_web::test]
async fn test_post_run_verdict_is_not_an_http_error() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    let req = test::TestRequest::post()
        .uri("/run")
        .set_json(json!({ "language": "sh", "source": "exit 1" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["verdict"], "RuntimeError");
    assert_eq!(body["exit_code"], 1);
}

#[actix_web::test]
async fn test_post_run_unknown_language() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    let req = test::TestRequest::post()
        .uri("/run")
        .set_json(json!({ "language": "brainfuck", "source": "+" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.reason, "ERR_NOT_FOUND");
    assert_eq!(body.code, 3);
}

#[actix_web::test]
async fn test_post_run_invalid_json() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    for payload in [
        json!({ "language": "sh" }),
        json!({ "language": "sh", "source": "true", "limits": { "cpu": 1 } }),
        json!({ "language": "sh", "source": "true", "limits": { "memory_bytes": -1 } }),
    ] {
        let req = test::TestRequest::post()
            .uri("/run")
            .set_json(payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.reason, "ERR_INVALID_ARGUMENT");
        assert_eq!(body.code, 1);
    }
}

#[actix_web::test]
async fn test_post_run_limit_above_rule() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    let req = test::TestRequest::post()
        .uri("/run")
        .set_json(json!({
            "language": "sh",
            "source": "true",
            "limits": { "wall_time_sec": 60.0 }
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: ErrorResponse = test::read_body_json(resp).await;
    assert!(body.message.contains("wall_time_sec"));
}

#[actix_web::test]
async fn test_post_run_while_shutting_down() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);
    service.scheduler.shutdown();

    let req = test::TestRequest::post()
        .uri("/run")
        .set_json(json!({ "language": "sh", "source": "true" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.reason, "ERR_UNAVAILABLE");
}

#[actix_web::test]
async fn test_health() {
    let service = TestService::start(1, 2);
    let app = init_app!(service);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(
        body,
        json!({ "status": "ok", "queued": 0, "languages": ["sh", "shc"] })
    );
}
