use super::*;

#[tokio::test]
async fn health_reports_storage_backend() {
    let (app, _, _) = test_app(Config::default());
    let response = send(&app, get_request("/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["storage"], "memory");
}

#[tokio::test]
async fn openapi_spec_is_served() {
    let (app, _, _) = test_app(Config::default());
    let response = send(&app, get_request("/openapi.json")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["paths"]["/api/upload/merge"].is_object());
}

#[tokio::test]
async fn swagger_ui_can_be_disabled() {
    let (app, _, _) = test_app(Config::default());
    let response = send(&app, get_request("/swagger-ui/")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let mut config = Config::default();
    config.server.swagger_ui = false;
    let (app, _, _) = test_app(config);
    let response = send(&app, get_request("/swagger-ui/")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_headers_follow_config() {
    let request = || {
        Request::builder()
            .uri("/health")
            .header("Origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap()
    };

    let (app, _, _) = test_app(Config::default());
    let response = send(&app, request()).await;
    assert!(response.headers().contains_key("access-control-allow-origin"));

    let mut config = Config::default();
    config.server.cors_enabled = false;
    let (app, _, _) = test_app(config);
    let response = send(&app, request()).await;
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn artifacts_follow_configured_public_path() {
    let mut config = Config::default();
    config.storage.public_path = "/media/".into();
    let (app, _, _) = test_app(config);

    let response = send(
        &app,
        multipart_request(
            "/api/upload/simple",
            &[FormPart::File {
                file_name: "clip.mov",
                content_type: "video/quicktime",
                data: b"moov",
            }],
        ),
    )
    .await;
    let url = body_json(response).await["data"]["url"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(url.starts_with("/media/"));

    let response = send(&app, get_request(&url)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/quicktime");
}
