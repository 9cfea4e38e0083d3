// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Integration tests for the download engine
//!
//! Every collaborator is faked; the synced root is a temp directory.

mod common;

use std::sync::atomic::Ordering;

use common::{eventually, serve_file, Fixture};
use serde_json::json;
use mediafetch::error::EngineError;
use mediafetch::SourceKind;

// =============================================================================
// SCAN AND SNAPSHOT
// =============================================================================

#[tokio::test]
async fn test_scan_classifies_synced_root() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    let count = manager.refresh_disk_downloads().await.unwrap();
    assert_eq!(count, 3);

    let inception = manager.get(&fx.id_of("Inception.mp4")).unwrap();
    assert!(inception.is_local_to_client);
    assert!(inception.has_uploaded_client);
    assert_eq!(inception.size, 10);

    let alien = manager.get(&fx.id_of("Horror/Alien.mp4")).unwrap();
    assert!(alien.is_uploading_client);
    assert!(!alien.has_uploaded_client);
    assert_eq!(alien.collection.as_deref(), Some("Horror"));

    let heat = manager.get(&fx.id_of("Heat.mkv")).unwrap();
    assert!(!heat.is_local_to_client);
    assert_eq!(heat.size, 700_000_000);

    assert_eq!(manager.collections().get("Horror"), Some(&1));
}

#[tokio::test]
async fn test_rescan_leaves_oauth_items_alone() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_remote().await.unwrap();
    manager.refresh_disk_downloads().await.unwrap();
    assert!(manager.get("100").is_some());

    std::fs::remove_file(fx.root().join("Inception.mp4")).unwrap();
    manager.refresh_disk_downloads().await.unwrap();

    assert!(manager.get(&fx.id_of("Inception.mp4")).is_none());
    let job = manager.get("100").unwrap();
    assert_eq!(job.source, SourceKind::OAuth);
    assert!(job.is_downloading_cloud);
}

#[tokio::test]
async fn test_associations_survive_restart() {
    let fx = Fixture::new(0);
    let id = fx.id_of("Inception.mp4");
    {
        let manager = fx.manager();
        manager.read_from_disk().await.unwrap();
        manager.refresh_remote().await.unwrap();
        manager.associate(&id, "tt1375666").await.unwrap();
        manager.associate("100", "tt0000100").await.unwrap();
        manager.shutdown().await.unwrap();
    }

    let manager = fx.manager();
    manager.read_from_disk().await.unwrap();
    assert_eq!(manager.get(&id).unwrap().association_id, "tt1375666");

    let restored = manager.get("100").unwrap();
    assert_eq!(restored.association_id, "tt0000100");
    assert!(restored.has_downloaded_cloud);
    assert!(!restored.is_downloading_cloud);

    let mut ids = manager.associated_ids();
    ids.sort();
    assert_eq!(ids, vec!["tt0000100".to_string(), "tt1375666".to_string()]);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_ignored() {
    let fx = Fixture::new(0);
    let path = fx.config.snapshot_path.clone();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{not json").unwrap();

    let manager = fx.manager();
    manager.read_from_disk().await.unwrap();
    assert_eq!(manager.stats().total, 3);
    assert_eq!(manager.stats().associated, 0);
}

#[tokio::test]
async fn test_associate_unknown_id() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    let err = manager.associate("missing", "tt1").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// =============================================================================
// GATED OPERATIONS
// =============================================================================

#[tokio::test]
async fn test_evict_requires_upload() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();

    let err = manager.evict(&fx.id_of("Horror/Alien.mp4")).await.unwrap_err();
    match err {
        EngineError::PreconditionFailed(name) => assert_eq!(name, "hasUploadedClient"),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(fx.commands.evicted.lock().unwrap().is_empty());

    let id = fx.id_of("Inception.mp4");
    manager.evict(&id).await.unwrap();
    assert_eq!(
        fx.commands.evicted.lock().unwrap().as_slice(),
        &[fx.root().join("Inception.mp4")]
    );
    assert!(!manager.get(&id).unwrap().is_local_to_client);
}

#[tokio::test]
async fn test_evict_placeholder_is_rejected() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();

    let err = manager.evict(&fx.id_of("Heat.mkv")).await.unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(ref n) if n == "isLocalToClient"));
}

#[tokio::test]
async fn test_add_to_collection_moves_file() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();
    let id = fx.id_of("Inception.mp4");
    manager.associate(&id, "tt1375666").await.unwrap();

    let new_id = manager.add_to_collection(&id, "Drama").await.unwrap();
    assert_eq!(new_id, fx.id_of("Drama/Inception.mp4"));
    assert!(fx.root().join("Drama").join("Inception.mp4").exists());
    assert!(!fx.root().join("Inception.mp4").exists());

    manager.refresh_disk_downloads().await.unwrap();
    let moved = manager.get(&new_id).unwrap();
    assert_eq!(moved.association_id, "tt1375666");
    assert_eq!(moved.collection.as_deref(), Some("Drama"));
    assert_eq!(manager.collections().get("Drama"), Some(&1));
    assert!(manager.get(&id).is_none());
}

#[tokio::test]
async fn test_placeholder_moves_as_stub() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();

    let new_id = manager.add_to_collection(&fx.id_of("Heat.mkv"), "Crime").await.unwrap();
    assert_eq!(new_id, fx.id_of("Crime/Heat.mkv"));
    assert!(fx.root().join("Crime").join(".Heat.mkv.icloud").exists());
    assert!(!fx.root().join(".Heat.mkv.icloud").exists());

    manager.refresh_disk_downloads().await.unwrap();
    let moved = manager.get(&new_id).unwrap();
    assert!(!moved.is_local_to_client);
    assert_eq!(moved.size, 700_000_000);
    assert_eq!(moved.collection.as_deref(), Some("Crime"));

    let url = manager.stream_url(&new_id).await.unwrap();
    assert_eq!(url, "http://stream/.Heat.mkv.icloud");
}

#[tokio::test]
async fn test_add_to_collection_rejects_bad_names() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();
    let id = fx.id_of("Inception.mp4");

    for name in ["", "a/b", ".."] {
        let err = manager.add_to_collection(&id, name).await.unwrap_err();
        assert!(matches!(err, EngineError::PreconditionFailed(_)), "name {:?}", name);
    }
    assert!(fx.root().join("Inception.mp4").exists());
}

#[tokio::test]
async fn test_rename_needs_association() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();
    let id = fx.id_of("Inception.mp4");

    let err = manager.rename(&id, "Inception (2010)").await.unwrap_err();
    assert!(matches!(err, EngineError::PreconditionFailed(ref n) if n == "imdb_id"));

    manager.associate(&id, "tt1375666").await.unwrap();
    let name = manager
        .rename(&id, "Mission: Impossible - Fallout (2018)")
        .await
        .unwrap();
    assert_eq!(name, "Mission.Impossible.Fallout.2018.mp4");
    assert!(fx.root().join(&name).exists());
}

#[tokio::test]
async fn test_stream_url() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    manager.refresh_disk_downloads().await.unwrap();

    let url = manager.stream_url(&fx.id_of("Inception.mp4")).await.unwrap();
    assert_eq!(url, "http://stream/Inception.mp4");

    let err = manager.stream_url("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// =============================================================================
// SUBMISSION AND QUEUE
// =============================================================================

#[tokio::test]
async fn test_admitted_submission_is_watched() {
    let fx = Fixture::new(0);
    {
        let mut listing = fx.remote.listing.lock().unwrap();
        *listing = serde_json::json!({
            "transfers": [{"id": 500, "name": "Submitted", "progress": "1", "progress_url": "p"}],
            "folders": []
        });
    }
    let manager = fx.manager();

    let admission = manager.submit("magnet:?xt=urn:btih:abc", "tt0133093", false).await.unwrap();
    assert!(!admission.is_enqueued());

    let item = manager.get("500").unwrap();
    assert_eq!(item.association_id, "tt0133093");
    assert_eq!(item.remote_hash.as_deref(), Some("abc"));
    assert!(item.is_downloading_cloud);
    assert_eq!(manager.active_jobs(), 1);

    manager.cancel_job("500").unwrap();
    assert!(eventually(|| manager.active_jobs() == 0).await);
    assert!(matches!(manager.cancel_job("500"), Err(EngineError::NotFound(_))));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_full_remote_escalates_then_admits() {
    let fx = Fixture::new(5);
    let manager = fx.manager();

    let admission = manager.submit("magnet:?xt=urn:btih:def", "tt1", false).await.unwrap();
    assert!(admission.is_enqueued());
    assert_eq!(manager.stats().pending, 1);

    let remote = fx.remote.clone();
    assert!(eventually(|| remote.submissions.load(Ordering::SeqCst) >= 6).await);
    assert!(eventually(|| manager.stats().pending == 0).await);

    // One escalation after the fourth consecutive failure inside the drain.
    let deletes = fx.remote.deletes.lock().unwrap().clone();
    assert_eq!(deletes, vec![r#"[{"id":"100","type":"transfer"}]"#.to_string()]);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_background_download_unknown_id() {
    let fx = Fixture::new(0);
    let manager = fx.manager();
    let err = manager
        .start_background_download("missing", "http://127.0.0.1:9/x", "x.mp4")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// =============================================================================
// CLIENT TRANSFER
// =============================================================================

const MOVIE_BYTES: usize = 4096;

#[tokio::test]
async fn test_background_download_lands_renamed() {
    let fx = Fixture::new(0);
    *fx.remote.listing.lock().unwrap() = json!({
        "transfers": [],
        "folders": [{"id": 100, "name": "Big Movie", "size": MOVIE_BYTES}]
    });
    let manager = fx.manager();
    manager.refresh_remote().await.unwrap();
    manager.associate("100", "tt0133093").await.unwrap();

    let url = serve_file("movie.mp4", vec![7u8; MOVIE_BYTES]).await;
    manager
        .start_background_download("100", &url, "movie.mp4")
        .await
        .unwrap();
    assert!(manager.get("100").unwrap().is_downloading_client);

    let remote = fx.remote.clone();
    assert!(
        eventually(|| !remote.deletes.lock().unwrap().is_empty() && manager.active_jobs() == 0).await
    );

    let landed = fx.root().join("The.Matrix.1999.mp4");
    assert_eq!(std::fs::metadata(&landed).unwrap().len(), MOVIE_BYTES as u64);
    assert!(!fx.root().join("movie.mp4").exists());
    assert_eq!(
        fx.remote.deletes.lock().unwrap().as_slice(),
        &[r#"[{"id":"100","type":"folder"}]"#.to_string()]
    );

    let job = manager.get("100").unwrap();
    assert!(job.has_downloaded_client && !job.is_downloading_client);
    assert_eq!(job.progress, 101.0);

    let entry = manager.get(&fx.id_of("The.Matrix.1999.mp4")).unwrap();
    assert_eq!(entry.source, SourceKind::Disk);
    assert_eq!(entry.association_id, "tt0133093");
    assert_eq!(entry.progress, 101.0);
    assert_eq!(entry.size, MOVIE_BYTES as i64);
}

#[tokio::test]
async fn test_finished_job_is_fetched_by_watcher() {
    let fx = Fixture::new(0);
    *fx.remote.listing.lock().unwrap() = json!({
        "transfers": [],
        "folders": [{"id": 500, "name": "Submitted", "size": MOVIE_BYTES}]
    });
    *fx.remote.files.lock().unwrap() = json!([
        {"id": 1, "name": "sample.mp4", "size": 10, "play_video": true},
        {"id": 2, "name": "Matrix.mp4", "size": MOVIE_BYTES, "play_video": true}
    ]);
    *fx.remote.file_url.lock().unwrap() = serve_file("Matrix.mp4", vec![1u8; MOVIE_BYTES]).await;
    let manager = fx.manager();

    let admission = manager.submit("magnet:?xt=urn:btih:abc", "tt0133093", false).await.unwrap();
    assert!(!admission.is_enqueued());

    let remote = fx.remote.clone();
    assert!(
        eventually(|| !remote.deletes.lock().unwrap().is_empty() && manager.active_jobs() == 0).await
    );

    assert!(fx.root().join("The.Matrix.1999.mp4").exists());
    assert_eq!(
        fx.remote.deletes.lock().unwrap().as_slice(),
        &[r#"[{"id":"500","type":"folder"}]"#.to_string()]
    );
    let job = manager.get("500").unwrap();
    assert!(job.has_downloaded_cloud && job.has_downloaded_client);
    assert_eq!(
        manager.get(&fx.id_of("The.Matrix.1999.mp4")).unwrap().association_id,
        "tt0133093"
    );
    manager.shutdown().await.unwrap();
}
