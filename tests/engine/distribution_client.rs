use anyhow::Result;
use bytes::Bytes;
use registry_mirror::registry::distribution::{MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_INDEX};
use registry_mirror::{
    CredentialPair, DistributionClient, ImageRegistry, Manifest, RegistryClientOptions,
    RegistryError,
};

use crate::support::fakes::sha256_digest;
use crate::support::helpers::init_tracing;
use crate::support::mock_registry::{MockRegistry, MockRegistryServer};

const REPOSITORY: &str = "team/app";

fn client(server: &MockRegistryServer) -> DistributionClient {
    DistributionClient::new(
        server.url(),
        Some(CredentialPair::new("robot", "robot-password")),
        &RegistryClientOptions::default(),
    )
    .expect("client should build")
}

#[tokio::test]
async fn ping_accepts_an_auth_challenge() -> Result<()> {
    init_tracing();
    let server = MockRegistryServer::start(MockRegistry::new()).await?;

    let anonymous =
        DistributionClient::new(server.url(), None, &RegistryClientOptions::default())?;
    anonymous.ping().await?;
    assert!(anonymous.host().starts_with("127.0.0.1:"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tag_listing_follows_links_with_one_token() -> Result<()> {
    init_tracing();
    let registry = MockRegistry::new();
    registry.add_tags(REPOSITORY, &["1.0", "1.1", "1.2", "2.0", "latest"]);
    let server = MockRegistryServer::start(registry.clone()).await?;
    let client = client(&server);

    let tags = client.list_tags(REPOSITORY).await?;
    assert_eq!(tags, vec!["1.0", "1.1", "1.2", "2.0", "latest"]);

    let requests = registry.token_requests();
    assert_eq!(requests.len(), 1, "pages after the first reuse the cached token");
    assert_eq!(requests[0].scope.as_deref(), Some("repository:team/app:pull"));
    assert_eq!(requests[0].service.as_deref(), Some("mock-registry"));
    assert_eq!(requests[0].basic_user.as_deref(), Some("robot"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn manifests_carry_media_type_and_digest() -> Result<()> {
    init_tracing();
    let registry = MockRegistry::new();
    let body = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
    let digest = registry.add_manifest(REPOSITORY, "multi", MEDIA_TYPE_OCI_INDEX, body);
    let server = MockRegistryServer::start(registry.clone()).await?;
    let client = client(&server);

    let manifest = client.get_manifest(REPOSITORY, "multi").await?;
    assert_eq!(manifest.media_type, MEDIA_TYPE_OCI_INDEX);
    assert_eq!(manifest.digest.as_deref(), Some(digest.as_str()));
    assert_eq!(manifest.body.as_ref(), body.as_slice());
    assert!(manifest.is_index());

    assert!(client.manifest_exists(REPOSITORY, &digest).await?);
    assert!(!client.manifest_exists(REPOSITORY, "missing").await?);

    let err = client
        .get_manifest(REPOSITORY, "missing")
        .await
        .expect_err("unknown tag should fail");
    assert!(matches!(err, RegistryError::Status { status: 404, .. }), "unexpected error: {err}");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn blobs_and_manifests_can_be_pushed() -> Result<()> {
    init_tracing();
    let registry = MockRegistry::new();
    let server = MockRegistryServer::start(registry.clone()).await?;
    let client = client(&server);

    let layer = Bytes::from_static(b"layer bytes");
    let digest = sha256_digest(&layer);
    assert!(!client.blob_exists(REPOSITORY, &digest).await?);

    client.put_blob(REPOSITORY, &digest, layer.clone()).await?;
    assert_eq!(registry.uploads(), 1);
    assert_eq!(registry.blob(REPOSITORY, &digest), Some(layer.clone()));
    assert!(client.blob_exists(REPOSITORY, &digest).await?);
    assert_eq!(client.get_blob(REPOSITORY, &digest).await?, layer);

    let manifest = Manifest {
        media_type: MEDIA_TYPE_DOCKER_MANIFEST.into(),
        digest: None,
        body: Bytes::from_static(br#"{"schemaVersion":2}"#),
    };
    client.put_manifest(REPOSITORY, "v1", &manifest).await?;

    let (media_type, body) = registry
        .manifest(REPOSITORY, "v1")
        .expect("manifest should be stored");
    assert_eq!(media_type, MEDIA_TYPE_DOCKER_MANIFEST);
    assert_eq!(body, manifest.body);

    let scopes: Vec<_> = registry
        .token_requests()
        .into_iter()
        .filter_map(|request| request.scope)
        .collect();
    assert!(scopes.contains(&"repository:team/app:pull".to_owned()));
    assert!(scopes.contains(&"repository:team/app:pull,push".to_owned()));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stored_blobs_are_pulled_with_a_pull_token() -> Result<()> {
    init_tracing();
    let registry = MockRegistry::new();
    let digest = registry.add_blob(REPOSITORY, b"base layer");
    let server = MockRegistryServer::start(registry.clone()).await?;
    let client = client(&server);

    assert!(client.blob_exists(REPOSITORY, &digest).await?);
    assert_eq!(
        client.get_blob(REPOSITORY, &digest).await?,
        Bytes::from_static(b"base layer")
    );
    assert!(!client.blob_exists(REPOSITORY, &sha256_digest(b"other layer")).await?);
    assert_eq!(registry.uploads(), 0);

    let scopes: Vec<_> = registry
        .token_requests()
        .into_iter()
        .filter_map(|request| request.scope)
        .collect();
    assert!(scopes.iter().all(|scope| scope == "repository:team/app:pull"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn corrupted_upload_is_rejected() -> Result<()> {
    init_tracing();
    let registry = MockRegistry::new();
    let server = MockRegistryServer::start(registry.clone()).await?;
    let client = client(&server);

    let wrong_digest = sha256_digest(b"something else");
    let err = client
        .put_blob(REPOSITORY, &wrong_digest, Bytes::from_static(b"layer bytes"))
        .await
        .expect_err("digest mismatch should fail");
    assert!(matches!(err, RegistryError::Status { status: 400, .. }), "unexpected error: {err}");
    assert_eq!(registry.blob(REPOSITORY, &wrong_digest), None);

    server.shutdown().await;
    Ok(())
}
