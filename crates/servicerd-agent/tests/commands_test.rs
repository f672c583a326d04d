//! Agent commands against the in-process backend

use std::time::Duration;

use servicerd_agent::{AgentConfig, Backend, build_registry, commands};
use servicerd_common::{CancellationToken, Discovery, Registry, ServiceInstance, Watcher};

fn memory_config() -> AgentConfig {
    AgentConfig {
        backend: Backend::Memory,
        ..Default::default()
    }
}

fn orders(id: &str) -> ServiceInstance {
    ServiceInstance::new(id, "orders", vec!["http://10.0.0.1:8080".to_string()])
}

#[tokio::test(start_paused = true)]
async fn test_register_holds_until_shutdown() {
    let shutdown = CancellationToken::new();
    let handle = build_registry(&memory_config(), &shutdown).unwrap();
    let registry = handle.registry();

    let stop = CancellationToken::new();
    let task = {
        let registry = registry.clone();
        let stop = stop.clone();
        tokio::spawn(async move { commands::register(registry.as_ref(), &orders("a1"), &stop).await })
    };

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(registry.get_service("orders").await.unwrap(), vec![orders("a1")]);

    stop.cancel();
    task.await.unwrap().unwrap();
    assert!(registry.get_service("orders").await.unwrap().is_empty());
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_list_prints_json_line() {
    let shutdown = CancellationToken::new();
    let handle = build_registry(&memory_config(), &shutdown).unwrap();
    let registry = handle.registry();
    registry.register(&orders("a1")).await.unwrap();

    let mut out = Vec::new();
    commands::list(registry.as_ref(), "orders", &mut out).await.unwrap();

    let line: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(line["service"], "orders");
    assert_eq!(line["instances"][0]["id"], "a1");
    assert_eq!(line["instances"][0]["endpoints"][0], "http://10.0.0.1:8080");
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_watch_prints_each_change_until_cancelled() {
    let shutdown = CancellationToken::new();
    let handle = build_registry(&memory_config(), &shutdown).unwrap();
    let registry = handle.registry();

    let cancel = CancellationToken::new();
    let task = {
        let registry = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut out = Vec::new();
            commands::watch(registry.as_ref(), "orders", cancel, &mut out)
                .await
                .map(|_| out)
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.register(&orders("a1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.deregister(&orders("a1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();

    let out = task.await.unwrap().unwrap();
    let lines: Vec<serde_json::Value> = out
        .split(|b| *b == b'\n')
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_slice(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["instances"].as_array().unwrap().len(), 1);
    assert!(lines[1]["instances"].as_array().unwrap().is_empty());
    handle.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_token_closes_watchers() {
    let shutdown = CancellationToken::new();
    let handle = build_registry(&memory_config(), &shutdown).unwrap();
    let registry = handle.registry();

    let mut watcher = registry.watch("orders", CancellationToken::new()).await.unwrap();
    shutdown.cancel();
    assert!(matches!(
        watcher.next().await,
        Err(servicerd_common::RegistryError::Closed)
    ));
}
