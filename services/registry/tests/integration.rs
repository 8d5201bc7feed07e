//! Integration tests for the OCI registry

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use bytes::Bytes;
use registry::access::ReadOnly;
use registry::ephemeral::EphemeralFactory;
use registry::store::{BlobStore, ObjectBlobStore, RedirectPolicy};
use registry::{Digest, RegistryBuilder};
use serde_json::{Value, json};
use storage::{MemoryStorage, Storage};
use tower::ServiceExt;

const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Helper to create a test registry
fn test_registry() -> Router {
    RegistryBuilder::new().build().unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    let body = body_json(response).await;
    body["errors"][0]["code"].as_str().unwrap().to_string()
}

fn header_value<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing {name} header"))
        .to_str()
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Push a blob in a single request, returning its digest.
async fn push_blob(app: &Router, repository: &str, data: &'static [u8]) -> Digest {
    let digest = Digest::sha256(data);
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/{repository}/blobs/uploads/?digest={digest}"))
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(data))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    digest
}

fn image_manifest(config: &Digest, subject: Option<&Digest>) -> Value {
    let mut manifest = json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config.to_string(),
            "size": 7,
        },
        "layers": [],
    });
    if let Some(subject) = subject {
        manifest["subject"] = json!({
            "mediaType": OCI_MANIFEST,
            "digest": subject.to_string(),
            "size": 100,
        });
    }
    manifest
}

async fn put_manifest(
    app: &Router,
    repository: &str,
    reference: &str,
    media_type: &str,
    manifest: &Value,
) -> Response<Body> {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri(format!("/v2/{repository}/manifests/{reference}"))
            .header(header::CONTENT_TYPE, media_type)
            .body(Body::from(serde_json::to_vec(manifest).unwrap()))
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_api_version_check() {
    let app = test_registry();

    let response = send(&app, get("/v2/")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header_value(&response, "docker-distribution-api-version"),
        "registry/2.0"
    );
}

#[tokio::test]
async fn chunked_upload_assembles_blob() {
    let app = test_registry();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, "range"), "0-0");
    let location = header_value(&response, "location").to_string();
    let session = header_value(&response, "docker-upload-uuid").to_string();
    assert!(location.ends_with(&session));

    for (chunk, range, expected) in [("AAAA", "0-3", "0-3"), ("BBBB", "4-7", "0-7")] {
        let response = send(
            &app,
            Request::builder()
                .method("PATCH")
                .uri(&location)
                .header(header::CONTENT_RANGE, range)
                .body(Body::from(chunk))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header_value(&response, "range"), expected);
    }

    let response = send(&app, get(&location)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_value(&response, "range"), "0-7");

    let digest = Digest::sha256(b"AAAABBBB");
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_value(&response, "location"),
        format!("/v2/acme/app/blobs/{digest}")
    );
    assert_eq!(header_value(&response, "docker-content-digest"), digest.to_string());

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "AAAABBBB");
}

#[tokio::test]
async fn out_of_order_chunk_is_rejected() {
    let app = test_registry();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = header_value(&response, "location").to_string();
    let session = header_value(&response, "docker-upload-uuid").to_string();

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-3")
            .body(Body::from("AAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "8-11")
            .body(Body::from("CCCC"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    // Probing through the blob path reports the session too.
    let response = send(&app, get(&format!("/v2/acme/app/blobs/{session}"))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_value(&response, "range"), "0-3");
}

/// Start an upload session, returning its location and id.
async fn start_upload(app: &Router) -> (String, String) {
    let response = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    (
        header_value(&response, "location").to_string(),
        header_value(&response, "docker-upload-uuid").to_string(),
    )
}

#[tokio::test]
async fn final_chunk_must_match_its_range() {
    let app = test_registry();
    let (location, session) = start_upload(&app).await;
    let digest = Digest::sha256(b"AA");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .header(header::CONTENT_RANGE, "0-1")
            .body(Body::from("AAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    // Nothing from the rejected chunk was kept.
    let response = send(&app, get(&format!("/v2/acme/app/blobs/{session}"))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_value(&response, "range"), "0-0");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .header(header::CONTENT_RANGE, "0-1")
            .body(Body::from("AA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "AA");
}

#[tokio::test]
async fn chunk_must_match_its_range() {
    let app = test_registry();
    let (location, session) = start_upload(&app).await;

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-1")
            .body(Body::from("AAAAAAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-3")
            .header(header::CONTENT_LENGTH, "8")
            .body(Body::from("AAAAAAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{session}"))).await;
    assert_eq!(header_value(&response, "range"), "0-0");

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-3")
            .body(Body::from("AAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_value(&response, "range"), "0-3");
}

#[tokio::test]
async fn mismatched_upload_is_not_stored() {
    let app = test_registry();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let location = header_value(&response, "location").to_string();

    let claimed = Digest::sha256(b"something else");
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={claimed}"))
            .body(Body::from("actual content"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{claimed}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");

    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(&location)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn single_shot_push_head_and_ranges() {
    let app = test_registry();
    let digest = push_blob(&app, "acme/app", b"0123456789").await;
    let path = format!("/v2/acme/app/blobs/{digest}");

    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri(&path)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, "content-length"), "10");
    assert_eq!(header_value(&response, "docker-content-digest"), digest.to_string());

    let response = send(
        &app,
        Request::builder()
            .uri(&path)
            .header(header::RANGE, "bytes=2-5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header_value(&response, "content-range"), "bytes 2-5/10");
    assert_eq!(body_bytes(response).await, "2345");

    let response = send(
        &app,
        Request::builder()
            .uri(&path)
            .header(header::RANGE, "bytes=0-1,4-5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "RANGE_INVALID");
}

#[tokio::test]
async fn single_shot_push_verifies_declared_size() {
    let app = test_registry();
    let digest = Digest::sha256(b"short");

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/v2/acme/app/blobs/uploads/?digest={digest}"))
            .body(Body::from("not what was promised"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_repository_mount() {
    let app = test_registry();
    let digest = push_blob(&app, "acme/base", b"shared layer").await;

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v2/acme/app/blobs/uploads/?mount={digest}&from=acme/base"
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        header_value(&response, "location"),
        format!("/v2/acme/app/blobs/{digest}")
    );

    let missing = Digest::sha256(b"never pushed");
    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!(
                "/v2/acme/app/blobs/uploads/?mount={missing}&from=acme/base"
            ))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn manifest_push_and_pull() {
    let app = test_registry();
    let config = push_blob(&app, "acme/app", b"config!").await;
    let manifest = image_manifest(&config, None);
    let bytes = serde_json::to_vec(&manifest).unwrap();
    let digest = Digest::sha256(&bytes);

    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_value(&response, "docker-content-digest"), digest.to_string());
    assert_eq!(
        header_value(&response, "location"),
        format!("/v2/acme/app/manifests/{digest}")
    );

    for reference in ["v1".to_string(), digest.to_string()] {
        let response = send(&app, get(&format!("/v2/acme/app/manifests/{reference}"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_value(&response, "content-type"), OCI_MANIFEST);
        assert_eq!(body_bytes(response).await, bytes);
    }

    let response = send(
        &app,
        Request::builder()
            .method("HEAD")
            .uri("/v2/acme/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, "content-length"), bytes.len().to_string());

    // Re-pushing identical content is accepted.
    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get("/v2/acme/app/manifests/v2")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");

    let response = send(&app, get("/v2/acme/other/manifests/v1")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}

#[tokio::test]
async fn tag_conflict_keeps_original() {
    let app = test_registry();
    let m1 = image_manifest(&Digest::sha256(b"config one"), None);
    let m2 = image_manifest(&Digest::sha256(b"config two"), None);

    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &m1).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &m2).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "TAG_INVALID");

    let response = send(&app, get("/v2/acme/app/manifests/v1")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, serde_json::to_vec(&m1).unwrap());

    // The conflicting push left nothing behind under its digest.
    let d2 = Digest::sha256(&serde_json::to_vec(&m2).unwrap());
    let response = send(&app, get(&format!("/v2/acme/app/manifests/{d2}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn index_requires_children() {
    let app = test_registry();
    let child = image_manifest(&Digest::sha256(b"config"), None);
    let child_bytes = serde_json::to_vec(&child).unwrap();
    let child_digest = Digest::sha256(&child_bytes);

    let index = json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [{
            "mediaType": OCI_MANIFEST,
            "digest": child_digest.to_string(),
            "size": child_bytes.len(),
            "platform": {"architecture": "amd64", "os": "linux"},
        }],
    });

    let response = put_manifest(&app, "acme/app", "multi", OCI_INDEX, &index).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");
    assert!(
        body["errors"][0]["message"]
            .as_str()
            .unwrap()
            .contains(&child_digest.to_string())
    );

    let response = send(&app, get("/v2/acme/app/tags/list")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");

    let response = put_manifest(&app, "acme/app", &child_digest.to_string(), OCI_MANIFEST, &child).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = put_manifest(&app, "acme/app", "multi", OCI_INDEX, &index).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get("/v2/acme/app/manifests/multi")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, "content-type"), OCI_INDEX);
    assert_eq!(body_bytes(response).await, serde_json::to_vec(&index).unwrap());
}

#[tokio::test]
async fn digest_reference_must_match_body() {
    let app = test_registry();
    let manifest = image_manifest(&Digest::sha256(b"config"), None);
    let wrong = Digest::sha256(b"wrong");

    let response = put_manifest(&app, "acme/app", &wrong.to_string(), OCI_MANIFEST, &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");
}

#[tokio::test]
async fn manifest_validation() {
    let app = RegistryBuilder::new().max_manifest_size(64).build().unwrap();
    let manifest = image_manifest(&Digest::sha256(b"config"), None);

    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "SIZE_INVALID");

    let app = test_registry();
    let response = put_manifest(&app, "acme/app", "v1", "application/json", &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");

    let response = put_manifest(&app, "acme/app", "bad~tag", OCI_MANIFEST, &manifest).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri("/v2/acme/app/manifests/v1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "UNSUPPORTED");
}

#[tokio::test]
async fn tags_paginate_with_link() {
    let app = test_registry();
    let manifest = image_manifest(&Digest::sha256(b"config"), None);
    for tag in ["c", "a", "b"] {
        let response = put_manifest(&app, "acme/app", tag, OCI_MANIFEST, &manifest).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = send(&app, get("/v2/acme/app/tags/list")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"name": "acme/app", "tags": ["a", "b", "c"]})
    );

    let response = send(&app, get("/v2/acme/app/tags/list?n=2")).await;
    assert_eq!(
        header_value(&response, "link"),
        "</v2/acme/app/tags/list?n=2&last=b>; rel=\"next\""
    );
    assert_eq!(body_json(response).await["tags"], json!(["a", "b"]));

    let response = send(&app, get("/v2/acme/app/tags/list?n=2&last=b")).await;
    assert!(response.headers().get(header::LINK).is_none());
    assert_eq!(body_json(response).await["tags"], json!(["c"]));

    let response = send(&app, get("/v2/acme/app/tags/list?n=lots")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn catalog_lists_repositories() {
    let app = test_registry();
    let manifest = image_manifest(&Digest::sha256(b"config"), None);
    for repository in ["acme/web", "acme/api"] {
        put_manifest(&app, repository, "latest", OCI_MANIFEST, &manifest).await;
    }

    let response = send(&app, get("/v2/_catalog")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["acme/api", "acme/web"]})
    );

    let response = send(&app, get("/_catalog?n=1")).await;
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["acme/api"]})
    );
}

#[tokio::test]
async fn referrers_list_subjects() {
    let app = test_registry();
    let subject = image_manifest(&Digest::sha256(b"config"), None);
    let response = put_manifest(&app, "acme/app", "v1", OCI_MANIFEST, &subject).await;
    let subject_digest: Digest = header_value(&response, "docker-content-digest")
        .parse()
        .unwrap();

    let unrelated = image_manifest(&Digest::sha256(b"other config"), None);
    put_manifest(&app, "acme/app", "v2", OCI_MANIFEST, &unrelated).await;

    let mut signature = image_manifest(&Digest::sha256(b"sig config"), Some(&subject_digest));
    signature["config"]["mediaType"] = json!("application/vnd.example.signature");
    signature["annotations"] = json!({"org.example.signed-by": "ci"});
    let signature_bytes = serde_json::to_vec(&signature).unwrap();
    let signature_digest = Digest::sha256(&signature_bytes);

    let response = put_manifest(
        &app,
        "acme/app",
        &signature_digest.to_string(),
        OCI_MANIFEST,
        &signature,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_value(&response, "oci-subject"), subject_digest.to_string());

    let response = send(&app, get(&format!("/v2/acme/app/referrers/{subject_digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_value(&response, "content-type"), OCI_INDEX);
    assert!(response.headers().get("oci-filters-applied").is_none());
    let index = body_json(response).await;
    assert_eq!(index["mediaType"], OCI_INDEX);
    assert_eq!(
        index["manifests"],
        json!([{
            "mediaType": OCI_MANIFEST,
            "digest": signature_digest.to_string(),
            "size": signature_bytes.len(),
            "artifactType": "application/vnd.example.signature",
            "annotations": {"org.example.signed-by": "ci"},
        }])
    );

    let response = send(
        &app,
        get(&format!(
            "/v2/acme/app/referrers/{subject_digest}?artifactType=application/vnd.example.sbom"
        )),
    )
    .await;
    assert_eq!(header_value(&response, "oci-filters-applied"), "artifactType");
    assert_eq!(body_json(response).await["manifests"], json!([]));

    let response = send(&app, get("/v2/acme/app/referrers/sha256:nope")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, get(&format!("/v2/acme/empty/referrers/{subject_digest}"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["manifests"], json!([]));
}

#[tokio::test]
async fn referrers_can_be_disabled() {
    let app = RegistryBuilder::new().referrers(false).build().unwrap();
    let digest = Digest::sha256(b"anything");

    let response = send(&app, get(&format!("/v2/acme/app/referrers/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "UNSUPPORTED");
}

#[tokio::test]
async fn authorizer_denies_pushes() {
    let app = RegistryBuilder::new().authorizer(ReadOnly).build().unwrap();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");

    let response = send(&app, get("/v2/acme/app/tags/list")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "NAME_UNKNOWN");
}

#[tokio::test]
async fn malformed_names_and_paths() {
    let app = test_registry();

    for path in ["/v2/app/tags/list", "/v2/acme/team/app/manifests/v1", "/v2/Acme/app/tags/list"] {
        let response = send(&app, get(path)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{path}");
        assert_eq!(error_code(response).await, "NAME_INVALID");
    }

    let response = send(&app, get("/v2/acme/app/blobs/sha256:short")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, get("/v2/acme/app/elsewhere")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/tags/list")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri("/v2/acme/app/blobs/uploads/not-a-session")
            .body(Body::from("data"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn object_storage_backend_redirects_downloads() {
    let storage: Storage = MemoryStorage::with_buckets(&["registry"])
        .with_presign_base(url::Url::parse("https://objects.example.com").unwrap())
        .into();
    let scratch = tempfile::tempdir().unwrap();
    let ephemeral = EphemeralFactory::new(Some(scratch.path().to_path_buf().try_into().unwrap()));
    let blobs = ObjectBlobStore::new(storage.bucket("registry"), ephemeral)
        .with_redirect(RedirectPolicy::default());
    let app = RegistryBuilder::new()
        .blobs(BlobStore::full(Arc::new(blobs)))
        .build()
        .unwrap();

    let response = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/v2/acme/app/blobs/uploads/")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let location = header_value(&response, "location").to_string();

    let response = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(&location)
            .header(header::CONTENT_RANGE, "0-3")
            .body(Body::from("AAAA"))
            .unwrap(),
    )
    .await;
    assert_eq!(header_value(&response, "range"), "0-3");

    let digest = Digest::sha256(b"AAAABBBB");
    let response = send(
        &app,
        Request::builder()
            .method("PUT")
            .uri(format!("{location}?digest={digest}"))
            .header(header::CONTENT_RANGE, "4-7")
            .body(Body::from("BBBB"))
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, get(&format!("/v2/acme/app/blobs/{digest}"))).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert!(
        header_value(&response, "location")
            .starts_with("https://objects.example.com/registry/blobs/sha256/")
    );
}
