use super::*;
use crate::storage::Storage;

const SESSION: &str = "1700000000000-0badcafe-motion.mp4";

fn chunk_request<'a>(uri: &str, index: &'a str, total: &'a str, data: &'a [u8]) -> Request<Body> {
    multipart_request(
        uri,
        &[
            FormPart::Text("chunkIndex", index),
            FormPart::Text("totalChunks", total),
            FormPart::Text("fileId", SESSION),
            FormPart::Text("fileName", "motion.mp4"),
            FormPart::File {
                file_name: "motion.mp4",
                content_type: "application/octet-stream",
                data,
            },
        ],
    )
}

#[tokio::test]
async fn chunked_upload_merges_and_serves_artifact() {
    let (app, _, storage) = test_app(Config::default());

    // Sent out of order through both chunk endpoints
    for (uri, index, data) in [
        ("/api/upload", "2", &b"-end"[..]),
        ("/api/upload/chunk", "0", &b"start-"[..]),
        ("/api/upload", "1", &b"middle"[..]),
    ] {
        let response = send(&app, chunk_request(uri, index, "3", data)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["chunkIndex"], index.parse::<u32>().unwrap());
        assert_eq!(json["data"]["received"], true);
    }
    assert_eq!(storage.staged_chunk_count().await, 3);

    let response = send(
        &app,
        json_request(
            "POST",
            "/api/upload/merge",
            serde_json::json!({"fileId": SESSION, "fileName": "motion.mp4", "totalChunks": 3}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["type"], "video");
    let url = json["data"]["url"].as_str().unwrap().to_string();
    assert!(url.starts_with("/uploads/") && url.ends_with("-motion.mp4"));
    assert_eq!(storage.staged_chunk_count().await, 0);

    let response = send(&app, get_request(&url)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(response.headers()["cache-control"], "public, max-age=86400");
    assert_eq!(body_bytes(response).await, b"start-middle-end");
}

#[tokio::test]
async fn resent_chunk_overwrites_previous_write() {
    let (app, _, _) = test_app(Config::default());
    send(&app, chunk_request("/api/upload/chunk", "0", "1", b"stale")).await;
    send(&app, chunk_request("/api/upload/chunk", "0", "1", b"fresh")).await;

    let response = send(
        &app,
        json_request(
            "POST",
            "/api/upload/merge",
            serde_json::json!({"fileId": SESSION, "fileName": "motion.mp4", "totalChunks": 1}),
        ),
    )
    .await;
    let url = body_json(response).await["data"]["url"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(body_bytes(send(&app, get_request(&url)).await).await, b"fresh");
}

#[tokio::test]
async fn whole_file_upload_infers_kind_from_content_type() {
    let (app, _, _) = test_app(Config::default());
    let response = send(
        &app,
        multipart_request(
            "/api/upload",
            &[FormPart::File {
                file_name: "portrait.png",
                content_type: "image/png",
                data: b"\x89PNG....",
            }],
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["type"], "image");
    assert!(
        json["data"]["url"]
            .as_str()
            .unwrap()
            .ends_with("-portrait.png")
    );
}

#[tokio::test]
async fn simple_upload_without_file_is_rejected() {
    let (app, _, _) = test_app(Config::default());
    for uri in ["/api/upload", "/api/upload/simple"] {
        let response = send(
            &app,
            multipart_request(uri, &[FormPart::Text("fileName", "x.png")]),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_error(&body_json(response).await, "InvalidParameter");
    }
}

#[tokio::test]
async fn chunk_endpoint_requires_chunk_fields() {
    let (app, _, _) = test_app(Config::default());
    let response = send(
        &app,
        multipart_request(
            "/api/upload/chunk",
            &[
                FormPart::Text("chunkIndex", "0"),
                FormPart::File {
                    file_name: "motion.mp4",
                    content_type: "application/octet-stream",
                    data: b"abc",
                },
            ],
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_error(&body_json(response).await, "InvalidParameter");
}

#[tokio::test]
async fn out_of_range_or_malformed_chunks_are_rejected() {
    let (app, _, storage) = test_app(Config::default());

    for (index, total) in [("3", "3"), ("-1", "3"), ("one", "3")] {
        let response = send(&app, chunk_request("/api/upload/chunk", index, total, b"x")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "index {index}");
        assert_error(&body_json(response).await, "InvalidParameter");
    }
    assert_eq!(storage.staged_chunk_count().await, 0);
}

#[tokio::test]
async fn traversal_session_ids_are_rejected() {
    let (app, _, _) = test_app(Config::default());
    let response = send(
        &app,
        multipart_request(
            "/api/upload/chunk",
            &[
                FormPart::Text("chunkIndex", "0"),
                FormPart::Text("totalChunks", "1"),
                FormPart::Text("fileId", "../../etc"),
                FormPart::File {
                    file_name: "x.mp4",
                    content_type: "application/octet-stream",
                    data: b"x",
                },
            ],
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn merge_with_missing_chunk_fails_and_keeps_staging() {
    let (app, _, storage) = test_app(Config::default());
    send(&app, chunk_request("/api/upload/chunk", "0", "3", b"a")).await;
    send(&app, chunk_request("/api/upload/chunk", "2", "3", b"c")).await;

    let response = send(
        &app,
        json_request(
            "POST",
            "/api/upload/merge",
            serde_json::json!({"fileId": SESSION, "fileName": "motion.mp4", "totalChunks": 3}),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_error(&json, "AssemblyError");
    assert_eq!(json["error"]["details"]["missing"], serde_json::json!([1]));
    assert_eq!(storage.staged_chunk_count().await, 2);
}

#[tokio::test]
async fn malformed_merge_body_uses_error_envelope() {
    let (app, _, _) = test_app(Config::default());
    let response = send(
        &app,
        json_request("POST", "/api/upload/merge", serde_json::json!({"fileId": SESSION})),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_error(&body_json(response).await, "InvalidParameter");
}

#[tokio::test]
async fn oversized_bodies_get_413() {
    let mut config = Config::default();
    config.upload.max_body_bytes = 1024;
    config.upload.limits.max_image_bytes = 16;
    let (app, _, _) = test_app(config);

    let big = vec![7u8; 4096];
    let response = send(&app, chunk_request("/api/upload/chunk", "0", "1", &big)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_error(&body_json(response).await, "PayloadTooLarge");

    let response = send(
        &app,
        multipart_request(
            "/api/upload/simple",
            &[FormPart::File {
                file_name: "photo.jpg",
                content_type: "image/jpeg",
                data: &[1u8; 64],
            }],
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unknown_artifact_is_404() {
    let (app, _, _) = test_app(Config::default());
    let response = send(&app, get_request("/uploads/does-not-exist.mp4")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_error(&body_json(response).await, "NotFound");
}

#[tokio::test]
async fn api_key_guards_api_routes_only() {
    let mut config = Config::default();
    config.server.api_key = Some("s3cret".into());
    let (app, _, storage) = test_app(config);
    storage
        .put_artifact("abc-still.png", bytes::Bytes::from_static(b"png"))
        .await
        .unwrap();

    let response = send(&app, chunk_request("/api/upload/chunk", "0", "1", b"x")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_error(&body_json(response).await, "Unauthorized");

    let mut request = chunk_request("/api/upload/chunk", "0", "1", b"x");
    request
        .headers_mut()
        .insert("x-api-key", "s3cret".parse().unwrap());
    assert_eq!(send(&app, request).await.status(), StatusCode::OK);

    assert_eq!(
        send(&app, get_request("/uploads/abc-still.png")).await.status(),
        StatusCode::OK
    );
    assert_eq!(send(&app, get_request("/health")).await.status(), StatusCode::OK);
}
