//! S3Store against a mock S3 endpoint
//!
//! the store uses a blocking client, so every store call runs on a blocking
//! thread while the mock server runs on the test runtime.

use std::io::Read;
use std::time::Duration;

use devport::store::sigv4::Credentials;
use devport::{digest_bytes, LookupKey, ObjectStore, Payload, S3Options, S3Store, StoreKey};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store(uri: &str, retry_window: Duration) -> S3Store {
    S3Store::new(S3Options {
        endpoint: uri.to_string(),
        bucket: "devport-cache".to_string(),
        region: "us-east-1".to_string(),
        credentials: Credentials {
            access_key_id: "devport-admin".to_string(),
            secret_access_key: "devport-password".to_string(),
        },
        path_style: true,
        retry_window,
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

/// run `f` off the async runtime, where the blocking client is allowed
async fn blocking<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap()
}

fn object_path(content: &[u8]) -> String {
    format!("/devport-cache/{}", digest_bytes(content).to_hex())
}

fn no_such(code: &str) -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_string(format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Error><Code>{code}</Code><Message>not found</Message></Error>"
    ))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exists_maps_head_status() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path(object_path(b"present")))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let uri = server.uri();
    let (present, absent) = blocking(move || {
        let store = store(&uri, Duration::ZERO);
        (
            store.exists(&StoreKey::Object(digest_bytes(b"present"))).unwrap(),
            store.exists(&StoreKey::Object(digest_bytes(b"absent"))).unwrap(),
        )
    })
    .await;

    assert!(present);
    assert!(!absent);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_declares_object_digest() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(object_path(b"hello")))
        .and(header(
            "x-amz-content-sha256",
            digest_bytes(b"hello").to_hex().as_str(),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    blocking(move || {
        store(&uri, Duration::ZERO)
            .put(
                &StoreKey::Object(digest_bytes(b"hello")),
                &Payload::Bytes(b"hello".to_vec()),
            )
            .unwrap()
    })
    .await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"hello");
    let auth = requests[0].headers.get("authorization").unwrap().to_str().unwrap();
    assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=devport-admin/"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_streams_file_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("index.js");
    let content = vec![b'x'; 200_000];
    std::fs::write(&file, &content).unwrap();

    let uri = server.uri();
    let digest = digest_bytes(&content);
    blocking(move || {
        let payload = Payload::file(&file).unwrap();
        store(&uri, Duration::ZERO)
            .put(&StoreKey::Object(digest), &payload)
            .unwrap()
    })
    .await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].body.len(), 200_000);
    let declared = requests[0].headers.get("x-amz-content-sha256").unwrap();
    assert_eq!(declared.to_str().unwrap(), digest.to_hex());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_manifest_declares_body_hash() {
    let server = MockServer::start().await;
    let body = br#"{"files":{}}"#.to_vec();
    Mock::given(method("PUT"))
        .and(path("/devport-cache/manifests/abc123.json"))
        .and(header(
            "x-amz-content-sha256",
            digest_bytes(&body).to_hex().as_str(),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    blocking(move || {
        store(&uri, Duration::ZERO)
            .put(
                &StoreKey::Manifest(LookupKey::new("abc123").unwrap()),
                &Payload::Bytes(body),
            )
            .unwrap()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_put_content_changed_since_hashing_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(400).set_body_string(
            "<Error><Code>XAmzContentSHA256Mismatch</Code><Message>mismatch</Message></Error>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let err = blocking(move || {
        // keyed by the digest of the old content, carrying new content
        store(&uri, Duration::from_secs(5))
            .put(
                &StoreKey::Object(digest_bytes(b"before")),
                &Payload::Bytes(b"after".to_vec()),
            )
            .unwrap_err()
    })
    .await;

    match err {
        devport::Error::Remote { status, message, .. } => {
            assert_eq!(status, 400);
            assert_eq!(message, "XAmzContentSHA256Mismatch");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_returns_body_and_distinguishes_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/devport-cache/manifests/abc.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"files\":{}}"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(no_such("NoSuchKey"))
        .mount(&server)
        .await;

    let uri = server.uri();
    let (body, missing) = blocking(move || {
        let store = store(&uri, Duration::ZERO);
        let mut body = String::new();
        store
            .get(&StoreKey::Manifest(LookupKey::new("abc").unwrap()))
            .unwrap()
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        let missing = store
            .get(&StoreKey::Object(digest_bytes(b"nope")))
            .unwrap()
            .is_none();
        (body, missing)
    })
    .await;

    assert_eq!(body, "{\"files\":{}}");
    assert!(missing);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_bucket_is_an_error_not_a_miss() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(no_such("NoSuchBucket"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/devport-cache"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let uri = server.uri();
    let (get, access) = blocking(move || {
        let store = store(&uri, Duration::ZERO);
        (
            store.get(&StoreKey::Object(digest_bytes(b"x"))).map(|r| r.is_some()),
            store.check_access(),
        )
    })
    .await;

    assert!(matches!(get, Err(devport::Error::Remote { status: 404, .. })));
    assert!(matches!(access, Err(devport::Error::Remote { status: 404, .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .with_priority(2)
        .mount(&server)
        .await;

    let uri = server.uri();
    let exists = blocking(move || {
        store(&uri, Duration::from_secs(10))
            .exists(&StoreKey::Object(digest_bytes(b"x")))
            .unwrap()
    })
    .await;

    assert!(exists);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(403).set_body_string(
            "<Error><Code>AccessDenied</Code><Message>denied</Message></Error>",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let result = blocking(move || {
        store(&uri, Duration::from_secs(10)).put(
            &StoreKey::Object(digest_bytes(b"x")),
            &Payload::Bytes(b"x".to_vec()),
        )
    })
    .await;

    match result {
        Err(devport::Error::Remote {
            status, message, ..
        }) => {
            assert_eq!(status, 403);
            assert_eq!(message, "AccessDenied");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}
