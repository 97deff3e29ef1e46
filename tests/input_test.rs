//! Target descriptor round trips and scan hash behavior.

use talos::input::{MetaInput, RawRequestResponse};

#[test]
fn json_round_trip_preserves_semantic_fields() {
    let mut input = MetaInput::with_custom_ip("https://example.com:8443", "203.0.113.7");
    input.raw_request = Some(RawRequestResponse {
        url: "https://example.com:8443/login".into(),
        method: "POST".into(),
        request: "POST /login HTTP/1.1\r\n\r\nuser=admin".into(),
        response: None,
    });
    // Populate the private hash before serializing.
    let _ = input.scan_hash("apache-detect");

    let serialized = input.marshal().expect("marshal");
    assert!(serialized.contains("\"customIP\""));
    assert!(serialized.contains("\"raw-request\""));
    assert!(!serialized.contains("hash"), "hash must never serialize");

    let restored = MetaInput::unmarshal(&serialized).expect("unmarshal");
    assert_eq!(restored, input);
}

#[test]
fn scan_hash_is_memoized() {
    let input = MetaInput::new("https://example.com");
    let first = input.scan_hash("apache-detect");
    // A changed field must not alter the memoized value.
    let second = input.scan_hash("different-template");
    assert_eq!(first, second, "second call must return the cached value");
}

#[test]
fn clone_recomputes_and_agrees_on_equal_fields() {
    let input = MetaInput::with_custom_ip("https://example.com", "10.0.0.9");
    let original = input.scan_hash("tomcat-detect");

    let cloned = input.clone();
    let recomputed = cloned.scan_hash("tomcat-detect");
    assert_eq!(
        original, recomputed,
        "fresh computation on an equal clone must agree"
    );

    let other = MetaInput::new("https://example.com");
    assert_ne!(other.scan_hash("tomcat-detect"), original);
}

#[test]
fn hash_is_raw_sixteen_bytes() {
    let input = MetaInput::new("https://example.com");
    assert_eq!(input.scan_hash("t").len(), 16);
}

#[test]
fn raw_request_drives_target_and_id() {
    let mut input = MetaInput::default();
    input.raw_request = Some(RawRequestResponse {
        url: "http://captured.example/admin".into(),
        method: "GET".into(),
        request: "GET /admin HTTP/1.1\r\n\r\n".into(),
        response: None,
    });
    assert_eq!(input.target(), "http://captured.example/admin");
    assert!(!input.id().is_empty());
}
