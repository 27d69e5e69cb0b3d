//! High-level assertion helpers for common test patterns.
//!
//! This module provides declarative assertion functions that encapsulate
//! the most common test patterns: upload-then-download round trips, placement
//! diversity, and typed failure checks.

#![allow(dead_code)]

use super::fixtures::TestNetwork;
use shardvault::{integrity, FileId, FileManifest, Result, VaultError};
use std::collections::HashSet;

/// Asserts that a file downloads back to exactly `expected`.
pub async fn assert_download_matches(net: &TestNetwork, file_id: &FileId, password: &str, expected: &[u8]) {
    let bytes = net
        .engine
        .download(file_id, password)
        .await
        .expect("Download should have succeeded");
    assert_eq!(bytes, expected, "Downloaded bytes should match the original");
}

/// Asserts that upload-then-download reproduces `data` and returns the file id.
pub async fn assert_roundtrip(net: &TestNetwork, data: &[u8], password: &str) -> FileId {
    let file_id = net
        .engine
        .upload(data, password)
        .await
        .expect("Upload should have succeeded");
    assert_download_matches(net, &file_id, password, data).await;
    file_id
}

/// Asserts the manifest is internally consistent and no peer holds two shards.
pub fn assert_manifest_well_formed(manifest: &FileManifest) {
    assert!(integrity::verify_manifest(manifest), "Manifest should verify");
    let holders: HashSet<_> = manifest.holders().collect();
    assert_eq!(
        holders.len(),
        manifest.shards.len(),
        "Every shard should live on a distinct peer"
    );
}

/// Asserts that a result is a placement failure.
pub fn assert_placement_failure<T: std::fmt::Debug>(result: Result<T>) {
    match result {
        Err(VaultError::PlacementFailure { .. }) => {}
        other => panic!("Expected PlacementFailure, got {:?}", other),
    }
}

/// Asserts that a result is an authentication failure.
pub fn assert_authentication_failure<T: std::fmt::Debug>(result: Result<T>) {
    match result {
        Err(VaultError::AuthenticationFailure) => {}
        other => panic!("Expected AuthenticationFailure, got {:?}", other),
    }
}
