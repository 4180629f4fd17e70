//! End-to-end tests of the HTTP facade against a mock archive host.
//!
//! Each test builds a real ZIP/Zarr/blosc archive, serves it with range
//! support from wiremock, wires a full component stack around a stub
//! signed-URL collaborator and drives the axum router directly.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request as WireRequest, Respond, ResponseTemplate};

use stackscope_server::config::ServerConfig;
use stackscope_server::http::create_router;
use stackscope_server::service::AppState;
use stackscope_store::error::{Error, Result};
use stackscope_store::provider::SignedUrlProvider;
use stackscope_store::types::TILE_BYTES;

const ZARRAY_256: &str = r#"{
    "zarr_format": 2,
    "shape": [131072, 131072],
    "chunks": [256, 256],
    "dtype": "|u1",
    "compressor": {"id": "blosc", "cname": "zstd", "clevel": 5, "shuffle": 1, "blocksize": 0},
    "order": "C",
    "fill_value": 0,
    "filters": null
}"#;

fn blosc_frame(payload: &[u8]) -> Vec<u8> {
    let compressed = zstd::bulk::compress(payload, 5).unwrap();
    let block: &[u8] = if compressed.len() >= payload.len() { payload } else { &compressed };

    let cbytes = 16 + 4 + 4 + block.len();
    let mut frame = Vec::with_capacity(cbytes);
    frame.push(2);
    frame.push(1);
    frame.push(0x01 | (4 << 5));
    frame.push(1);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&(cbytes as u32).to_le_bytes());
    frame.extend_from_slice(&20u32.to_le_bytes());
    frame.extend_from_slice(&(block.len() as u32).to_le_bytes());
    frame.extend_from_slice(block);
    frame
}

fn build_archive(chunks: &[((u32, u32), Vec<u8>)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);

    writer.start_file("scale0/.zarray", options).unwrap();
    writer.write_all(ZARRAY_256.as_bytes()).unwrap();
    for ((y, x), payload) in chunks {
        writer.start_file(format!("scale0/{y}.{x}"), options).unwrap();
        writer.write_all(&blosc_frame(payload)).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

struct RangeHost {
    body: Vec<u8>,
}

impl Respond for RangeHost {
    fn respond(&self, request: &WireRequest) -> ResponseTemplate {
        let total = self.body.len();
        let Some(range) = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
        else {
            return ResponseTemplate::new(200).set_body_bytes(self.body.clone());
        };

        let (start, end) = if let Some(suffix) = range.strip_prefix('-') {
            let len: usize = suffix.parse().unwrap_or(0);
            (total.saturating_sub(len), total - 1)
        } else {
            let mut parts = range.splitn(2, '-');
            let start: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let end: usize = parts
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(total - 1)
                .min(total - 1);
            (start, end)
        };

        ResponseTemplate::new(206)
            .insert_header("Content-Range", format!("bytes {start}-{end}/{total}"))
            .set_body_bytes(self.body[start..=end].to_vec())
    }
}

/// Maps the archive member path to a URL on the mock host.
struct PathProvider {
    base: String,
    refuse: bool,
}

#[async_trait]
impl SignedUrlProvider for PathProvider {
    async fn signed_url(&self, dataset: &str, member: &str) -> Result<String> {
        if self.refuse {
            return Err(Error::url_unavailable(dataset, member, "refused"));
        }
        Ok(format!("{}/{}", self.base, member))
    }
}

async fn router_for(server: &MockServer, archives: &[(&str, Vec<u8>)], refuse: bool) -> axum::Router {
    for (route, archive) in archives {
        Mock::given(method("GET"))
            .and(path(format!("/{route}")))
            .respond_with(RangeHost { body: archive.clone() })
            .mount(server)
            .await;
    }

    let provider = Arc::new(PathProvider { base: server.uri(), refuse });
    let config = ServerConfig::for_tests(server.uri());
    let state = AppState::with_provider(&config, provider).unwrap();
    create_router(state)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

const TS: &str = "2025-04-29_16-38-27";

#[tokio::test]
async fn test_tile_endpoint_serves_chunk_as_png() {
    let server = MockServer::start().await;
    let archive = build_archive(&[((0, 0), vec![128u8; TILE_BYTES])]);
    let router = router_for(
        &server,
        &[(&format!("{TS}/BF_LED_matrix_full.zip"), archive)],
        false,
    )
    .await;

    let response = router
        .oneshot(
            Request::get("/tile?dataset_id=ds&scale=0&x=0&y=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/png"
    );

    let png = body_bytes(response).await;
    let decoded = image::load_from_memory(&png).unwrap().into_luma8();
    assert_eq!(decoded.dimensions(), (256, 256));
    assert!(decoded.pixels().all(|p| p.0 == [128]));
}

#[tokio::test]
async fn test_tile_endpoint_serves_zero_png_for_absent_chunk() {
    let server = MockServer::start().await;
    let archive = build_archive(&[((0, 0), vec![128u8; TILE_BYTES])]);
    let router = router_for(
        &server,
        &[(&format!("{TS}/BF_LED_matrix_full.zip"), archive)],
        false,
    )
    .await;

    let response = router
        .oneshot(
            Request::get("/tile?dataset_id=ds&scale=0&x=5&y=5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let png = body_bytes(response).await;
    let decoded = image::load_from_memory(&png).unwrap().into_luma8();
    assert!(decoded.pixels().all(|p| p.0 == [0]));
}

#[tokio::test]
async fn test_merged_tile_screen_blends_brightfield_and_fluorescence() {
    let server = MockServer::start().await;
    let bf_archive = build_archive(&[((0, 0), vec![128u8; TILE_BYTES])]);
    let fluor_archive = build_archive(&[((0, 0), vec![200u8; TILE_BYTES])]);
    let router = router_for(
        &server,
        &[
            (&format!("{TS}/BF_LED_matrix_full.zip"), bf_archive),
            (&format!("{TS}/Fluorescence_488_nm_Ex.zip"), fluor_archive),
        ],
        false,
    )
    .await;

    let response = router
        .oneshot(
            Request::get("/merged-tile?dataset_id=ds&channels=0,12&scale=0&x=0&y=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let png = body_bytes(response).await;
    let decoded = image::load_from_memory(&png).unwrap().into_rgb8();

    // Reference screen blend: base 128/255, 488 layer tinted (34,255,34).
    let base = 128.0f32 / 255.0;
    let layer = [
        200.0f32 / 255.0 * (34.0 / 255.0),
        200.0f32 / 255.0,
        200.0f32 / 255.0 * (34.0 / 255.0),
    ];
    let expected = [
        ((1.0 - (1.0 - base) * (1.0 - layer[0])) * 255.0).round() as u8,
        ((1.0 - (1.0 - base) * (1.0 - layer[1])) * 255.0).round() as u8,
        ((1.0 - (1.0 - base) * (1.0 - layer[2])) * 255.0).round() as u8,
    ];
    assert_eq!(decoded.get_pixel(0, 0).0, expected);
}

#[tokio::test]
async fn test_unknown_channel_key_is_bad_request() {
    let server = MockServer::start().await;
    let router = router_for(&server, &[], false).await;

    let response = router
        .oneshot(
            Request::get("/tile?dataset_id=ds&channel=7&scale=0&x=0&y=0")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_settings_are_bad_request() {
    let server = MockServer::start().await;
    let router = router_for(&server, &[], false).await;

    let response = router
        .oneshot(
            Request::get("/tile?dataset_id=ds&scale=0&x=0&y=0&contrast=2.5")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_reports_ok_on_readable_archive() {
    let server = MockServer::start().await;
    let archive = build_archive(&[((0, 0), vec![1u8; TILE_BYTES])]);
    let router = router_for(
        &server,
        &[(&format!("{TS}/BF_LED_matrix_full.zip"), archive)],
        false,
    )
    .await;

    // The router is consumed per call; clone for the repeat probe.
    let response = router
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");

    // A second probe on a healthy system succeeds from the cached chunk.
    let again = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body_bytes(again).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["cache_hits"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn test_health_surfaces_collaborator_refusal() {
    let server = MockServer::start().await;
    let router = router_for(&server, &[], true).await;

    let response = router
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["detail"].as_str().unwrap().contains("unavailable"));
}

#[tokio::test]
async fn test_prefetch_reports_accepted_count() {
    let server = MockServer::start().await;
    let archive = build_archive(&[((0, 0), vec![1u8; TILE_BYTES])]);
    let router = router_for(
        &server,
        &[(&format!("{TS}/BF_LED_matrix_full.zip"), archive)],
        false,
    )
    .await;

    let response = router
        .oneshot(
            Request::get("/prefetch?dataset_id=ds&scale=0&tiles=0.0,0.1,1.0&priority=20")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value =
        serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["accepted"], 3);
}
