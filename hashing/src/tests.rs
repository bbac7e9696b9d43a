// Copyright 2025 EdgeFS project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use super::{Digest, Fingerprint, Hasher, EMPTY_DIGEST, EMPTY_FINGERPRINT};

#[test]
fn fingerprint_hex_round_trip() {
    let hex = "0123456789abcdeffedcba98765432100000000000000000ffffffffffffffff";
    let fingerprint = Fingerprint::from_hex_string(hex).unwrap();
    assert_eq!(fingerprint.to_hex(), hex);
}

#[test]
fn fingerprint_rejects_bad_hex() {
    assert!(Fingerprint::from_hex_string("abc").is_err());
    assert!(Fingerprint::from_hex_string("not hex at all").is_err());
}

#[test]
fn digest_of_empty_bytes_is_the_empty_digest() {
    assert_eq!(Digest::of_bytes(b""), EMPTY_DIGEST);
    assert_eq!(Digest::of_bytes(b"").hash, EMPTY_FINGERPRINT);
}

#[test]
fn digest_of_bytes_matches_known_vector() {
    // sha256("hello")
    let digest = Digest::of_bytes(b"hello");
    assert_eq!(
        digest.hash.to_hex(),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(digest.size_bytes, 5);
}

#[test]
fn incremental_hasher_agrees_with_one_shot() {
    let mut hasher = Hasher::new();
    hasher.update(b"hel");
    hasher.update(b"lo");
    assert_eq!(hasher.finish(), Digest::of_bytes(b"hello"));
}

#[test]
fn digest_json_round_trip() {
    let digest = Digest::of_bytes(b"some content");
    let json = serde_json::to_string(&digest).unwrap();
    assert!(json.contains("fingerprint"));
    let back: Digest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, digest);
}
