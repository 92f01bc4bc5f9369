// SPDX-License-Identifier: GPL-3.0-or-later
use std::sync::Arc;

use harmony_config::{ProviderEndpointConfig, ProvidersConfig};
use harmony_providers::{
    DownloadRequestFile, Provider, ProviderError, ProviderGateway, ProviderHealthMonitor,
    OverallHealth, ProbeStatus,
};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_config(metadata_url: &str, peer_url: &str) -> ProvidersConfig {
    ProvidersConfig {
        max_concurrency: 4,
        metadata: ProviderEndpointConfig {
            base_url: metadata_url.to_string(),
            timeout_ms: 2_000,
            retry_max: 3,
            backoff_base_ms: 10,
            jitter_pct: 0.0,
            api_key: None,
        },
        peer: ProviderEndpointConfig {
            base_url: peer_url.to_string(),
            timeout_ms: 2_000,
            retry_max: 3,
            backoff_base_ms: 10,
            jitter_pct: 0.0,
            api_key: None,
        },
        health: Default::default(),
    }
}

async fn gateway_for(metadata: &MockServer, peer: &MockServer) -> ProviderGateway {
    ProviderGateway::from_config(&gateway_config(&metadata.uri(), &peer.uri())).unwrap()
}

fn track_search_body() -> serde_json::Value {
    json!({
        "tracks": [{
            "id": "trk-1",
            "title": "Paranoid Android",
            "artist": "Radiohead",
            "album": "OK Computer",
            "duration_secs": 387,
            "isrc": "GBAYE9700123"
        }]
    })
}

#[tokio::test]
async fn search_tracks_parses_results() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/search/tracks"))
        .and(query_param("q", "radiohead"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(track_search_body()))
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let tracks = gateway.search_tracks("radiohead", 5).await.unwrap();

    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].title, "Paranoid Android");
    assert_eq!(tracks[0].isrc.as_deref(), Some("GBAYE9700123"));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    // two 503s, then success; retry_max=3 absorbs them
    Mock::given(method("GET"))
        .and(path("/v1/search/tracks"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&metadata)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/search/tracks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(track_search_body()))
        .expect(1)
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let tracks = gateway.search_tracks("radiohead", 5).await.unwrap();
    assert_eq!(tracks.len(), 1);
}

#[tokio::test]
async fn retries_exhaust_into_transient_error() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/search/tracks"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let error = gateway.search_tracks("radiohead", 5).await.unwrap_err();
    assert!(matches!(error, ProviderError::Transient(_)));
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/artists/art-1/albums"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let error = gateway.get_artist_albums("art-1").await.unwrap_err();
    assert!(matches!(error, ProviderError::Auth(_)));
}

#[tokio::test]
async fn rate_limit_hint_is_honored_then_retried() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/playlists/pl-9"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&metadata)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/playlists/pl-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pl-9",
            "name": "Monday mix",
            "tracks": []
        })))
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let playlist = gateway.get_playlist("pl-9").await.unwrap();
    assert_eq!(playlist.name, "Monday mix");
}

#[tokio::test]
async fn missing_isrc_is_none_not_error() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/tracks/isrc/USXXX0000001"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let track = gateway.get_track_by_isrc("USXXX0000001").await.unwrap();
    assert!(track.is_none());
}

#[tokio::test]
async fn peer_download_roundtrip() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v0/transfers/downloads/crow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "tkt-7",
            "username": "crow"
        })))
        .mount(&peer)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v0/transfers/downloads/crow/tkt-7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
        .mount(&peer)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let files = vec![DownloadRequestFile {
        filename: "Radiohead - Paranoid Android.flac".to_string(),
        size_bytes: Some(31_337_000),
        priority: None,
    }];
    let ticket = gateway.enqueue_peer_download("crow", &files).await.unwrap();
    assert_eq!(ticket.id, "tkt-7");

    let state = gateway.poll_peer_download(&ticket).await.unwrap();
    assert_eq!(
        state,
        harmony_providers::DownloadTicketState::Running
    );
}

#[tokio::test]
async fn peer_search_parses_results() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v0/searches"))
        .and(query_param("query", "radiohead paranoid android"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{
                "username": "crow",
                "free_upload_slots": 2,
                "queue_length": 0,
                "files": [{
                    "filename": "Music/Radiohead/OK Computer/07 Paranoid Android.flac",
                    "size_bytes": 31337000,
                    "bitrate": 1411,
                    "duration_secs": 387
                }]
            }]
        })))
        .mount(&peer)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let results = gateway
        .search_peer("radiohead paranoid android")
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].username, "crow");
    assert_eq!(results[0].files.len(), 1);
}

#[tokio::test]
async fn health_monitor_publishes_overall_verdict() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&metadata)
        .await;
    // peer daemon is down
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&peer)
        .await;

    let gateway = Arc::new(gateway_for(&metadata, &peer).await);
    let monitor = ProviderHealthMonitor::new(gateway, Default::default());

    let snapshot = monitor.probe_once().await;
    assert_eq!(snapshot.metadata, ProbeStatus::Ok);
    assert_eq!(snapshot.peer, ProbeStatus::Down);
    assert_eq!(snapshot.overall, OverallHealth::Down);

    // subscribers observe the published snapshot
    let rx = monitor.subscribe();
    assert_eq!(rx.borrow().overall, OverallHealth::Down);
}

#[tokio::test]
async fn health_probe_has_no_retries() {
    let metadata = MockServer::start().await;
    let peer = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&metadata)
        .await;

    let gateway = gateway_for(&metadata, &peer).await;
    let error = gateway.check_health(Provider::Metadata).await.unwrap_err();
    assert!(matches!(error, ProviderError::Transient(_)));
}
