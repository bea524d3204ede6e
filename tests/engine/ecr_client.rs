use std::sync::Arc;

use anyhow::Result;
use registry_mirror::registry::AwsCredentials;
use registry_mirror::{
    DestinationCache, DestinationRegistry, EcrClient, RegistryClientOptions, RegistryError,
    Telemetry,
};

use crate::support::helpers::init_tracing;
use crate::support::mock_ecr::{MockEcr, MockEcrServer};

const ACCOUNT_ID: &str = "123456789012";

fn credentials() -> AwsCredentials {
    AwsCredentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        session_token: None,
    }
}

fn client(server: &MockEcrServer, page_size: u32) -> EcrClient {
    let options = RegistryClientOptions {
        list_page_size: page_size,
        ..RegistryClientOptions::default()
    };
    EcrClient::new(
        server.url(),
        "eu-west-1",
        Some(ACCOUNT_ID.to_owned()),
        credentials(),
        &options,
    )
    .expect("client should build")
}

#[tokio::test]
async fn cache_build_walks_every_listing_page() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&["hub/a", "hub/b", "hub/c", "hub/d", "hub/e"], 2);
    let server = MockEcrServer::start(ecr.clone()).await?;
    let client = Arc::new(client(&server, 2));

    let cache = DestinationCache::new(client, Arc::new(Telemetry::default()));
    cache.build_cache(None).await?;

    assert_eq!(
        cache.known_repositories(),
        vec!["hub/a", "hub/b", "hub/c", "hub/d", "hub/e"]
    );
    assert_eq!(
        ecr.operations(),
        vec!["DescribeRepositories"; 3],
        "five names at two per page need three listing calls"
    );
    assert_eq!(ecr.max_results(), vec![2, 2, 2]);
    assert!(ecr.registry_ids().iter().all(|id| id == ACCOUNT_ID));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn create_reports_existing_repositories_as_api_errors() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&["hub/nginx"], 10);
    let server = MockEcrServer::start(ecr.clone()).await?;
    let client = client(&server, 10);

    client.create_repository("hub/redis").await?;
    assert_eq!(ecr.repositories(), vec!["hub/nginx", "hub/redis"]);

    let err = client
        .create_repository("hub/nginx")
        .await
        .expect_err("duplicate create should fail");
    assert!(err.is_already_exists(), "unexpected error: {err}");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn cache_create_treats_existing_repository_as_success() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&[], 10);
    let server = MockEcrServer::start(ecr.clone()).await?;
    let client = Arc::new(client(&server, 10));
    let telemetry = Arc::new(Telemetry::default());

    // Created behind the cache's back, as a concurrent mirror would.
    client.create_repository("hub/busybox").await?;

    let cache = DestinationCache::new(client, telemetry.clone());
    cache.build_cache(None).await?;
    cache.create("hub/busybox").await?;
    cache.ensure("hub/alpine").await?;

    assert!(cache.exists("hub/busybox"));
    assert!(cache.exists("hub/alpine"));
    assert_eq!(ecr.repositories(), vec!["hub/busybox", "hub/alpine"]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn login_decodes_the_authorization_token() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&[], 10);
    let server = MockEcrServer::start(ecr.clone()).await?;
    let client = Arc::new(client(&server, 10));

    let cache = DestinationCache::new(client, Arc::new(Telemetry::default()));
    let login = cache.login().await?;
    assert_eq!(login.username, "AWS");
    assert_eq!(login.password, "ecr-secret");
    assert_eq!(ecr.operations(), vec!["GetAuthorizationToken"]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unsigned_requests_are_rejected() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&[], 10);
    let server = MockEcrServer::start(ecr.clone()).await?;

    let response = reqwest::Client::new()
        .post(server.url())
        .header("x-amz-target", "AmazonEC2ContainerRegistry_V20150921.DescribeRepositories")
        .body("{}")
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 403);
    assert!(ecr.operations().is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_surfaces_http_error() -> Result<()> {
    init_tracing();
    let ecr = MockEcr::new(&[], 10);
    let server = MockEcrServer::start(ecr).await?;
    let url = server.url().to_owned();
    server.shutdown().await;

    let client = EcrClient::new(
        &url,
        "eu-west-1",
        None,
        credentials(),
        &RegistryClientOptions::default(),
    )?;
    let err = client
        .list_repositories(None)
        .await
        .expect_err("closed endpoint should fail");
    assert!(matches!(err, RegistryError::Http(_)), "unexpected error: {err}");
    Ok(())
}
