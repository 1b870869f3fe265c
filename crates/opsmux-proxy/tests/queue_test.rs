//! Integration tests for request queuing while a provider is updating.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{registry_with, Credentials, FakeConnector, Recorder};
use opsmux_core::{Error, ProviderStatus};
use opsmux_proxy::ProviderRegistry;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

fn spawn_tool_call(registry: &ProviderRegistry, name: &str) -> JoinHandle<opsmux_core::Result<Value>> {
    let registry = registry.clone();
    let name = name.to_string();
    tokio::spawn(async move { registry.call_tool(&name, json!({ "n": 1 })).await })
}

/// Let spawned tasks run until `id` has `count` queued calls.
async fn wait_until_queued(registry: &ProviderRegistry, id: &str, count: usize) {
    for _ in 0..64 {
        if registry.get_provider(id).unwrap().queued == count {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("expected {} queued calls for {}", count, id);
}

/// A call queued during an update times out after 30000ms.
#[tokio::test(start_paused = true)]
async fn test_queued_call_times_out() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["github"], Credentials::Present, &recorder);
    registry.initialize_all().await;
    registry.set_provider_updating("github", true).await.unwrap();

    let call = spawn_tool_call(&registry, "github_list_issues");
    wait_until_queued(&registry, "github", 1).await;
    tokio::time::sleep(Duration::from_millis(30_001)).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_queue_timeout());
    let message = err.to_string();
    assert!(message.contains("30000ms"), "{}", message);
    assert!(message.contains("github"), "{}", message);
    assert_eq!(registry.get_provider("github").unwrap().queued, 0);
    assert!(connector.provider("github").calls().is_empty());
}

/// Queued calls drain in order once the update ends, with direct-call results.
#[tokio::test]
async fn test_queued_calls_drain_in_order() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["github"], Credentials::Present, &recorder);
    registry.initialize_all().await;
    registry.set_provider_updating("github", true).await.unwrap();

    let first = spawn_tool_call(&registry, "github_first");
    wait_until_queued(&registry, "github", 1).await;
    let second = spawn_tool_call(&registry, "github_explode");
    wait_until_queued(&registry, "github", 2).await;
    let third = spawn_tool_call(&registry, "github_third");
    wait_until_queued(&registry, "github", 3).await;

    registry.set_provider_updating("github", false).await.unwrap();

    let first = first.await.unwrap().unwrap();
    assert!(second.await.unwrap().is_err());
    let third = third.await.unwrap().unwrap();
    assert_eq!(
        connector.provider("github").calls(),
        vec!["tool:first", "tool:explode", "tool:third"]
    );
    assert_eq!(registry.get_provider("github").unwrap().queued, 0);

    let direct = registry
        .call_tool("github_first", json!({ "n": 1 }))
        .await
        .unwrap();
    assert_eq!(first, direct);
    assert_eq!(third["tool"], "third");
}

/// Calls made during a reload wait for it and run once the provider is back.
#[tokio::test(start_paused = true)]
async fn test_reload_queues_and_drains() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["gitlab"], Credentials::Present, &recorder);
    registry.initialize_all().await;

    let reload = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.reload_provider("gitlab").await })
    };
    while !registry.get_provider("gitlab").unwrap().updating {
        tokio::task::yield_now().await;
    }
    let call = spawn_tool_call(&registry, "gitlab_list_pipelines");
    wait_until_queued(&registry, "gitlab", 1).await;

    assert_eq!(reload.await.unwrap().unwrap(), ProviderStatus::Connected);
    let result = call.await.unwrap().unwrap();
    assert_eq!(result["tool"], "list_pipelines");
    assert_eq!(connector.provider("gitlab").connects(), 2);
}

/// A failed reload rejects everything it had queued.
#[tokio::test(start_paused = true)]
async fn test_reload_failure_rejects_queue() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["gitlab"], Credentials::Present, &recorder);
    registry.initialize_all().await;
    connector
        .provider("gitlab")
        .fail_next_connect(Error::transport("connect ECONNREFUSED 127.0.0.1:3002"));

    let reload = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.reload_provider("gitlab").await })
    };
    while !registry.get_provider("gitlab").unwrap().updating {
        tokio::task::yield_now().await;
    }
    let call = spawn_tool_call(&registry, "gitlab_list_pipelines");
    wait_until_queued(&registry, "gitlab", 1).await;

    assert_eq!(reload.await.unwrap().unwrap(), ProviderStatus::Error);
    let err = call.await.unwrap().unwrap_err();
    assert!(
        err.to_string()
            .starts_with("Provider reload failed: Network error: "),
        "{}",
        err
    );
    assert!(connector.provider("gitlab").calls().is_empty());

    registry.shutdown().await;
}

/// Shutdown rejects whatever is still queued.
#[tokio::test]
async fn test_shutdown_rejects_queue() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["github"], Credentials::Present, &recorder);
    registry.initialize_all().await;
    registry.set_provider_updating("github", true).await.unwrap();

    let call = spawn_tool_call(&registry, "github_list_issues");
    wait_until_queued(&registry, "github", 1).await;
    registry.shutdown().await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Provider github shut down");
}

/// Updating flag on an unknown provider is an error.
#[tokio::test]
async fn test_set_updating_unknown_provider() {
    let connector = FakeConnector::new();
    let recorder = Arc::new(Recorder::default());
    let registry = registry_with(&connector, &["github"], Credentials::Present, &recorder);

    let err = registry
        .set_provider_updating("jira", true)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Provider jira not found");
}
