//! Consul HTTP client against a mock agent

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use servicerd_common::{CancellationToken, Discovery, RegistryError, ServiceInstance};
use servicerd_consul::model::registration_for;
use servicerd_consul::{CatalogClient, ConsulClientConfig, ConsulHttpClient, ConsulOptions, ConsulRegistry};
use wiremock::matchers::{
    body_partial_json, header, method, path, query_param, query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> ConsulHttpClient {
    ConsulHttpClient::new(ConsulClientConfig::new(server.uri())).unwrap()
}

fn entry(id: &str, port: u16) -> serde_json::Value {
    json!({
        "Node": {"Node": "node-1"},
        "Service": {
            "ID": id,
            "Service": "orders",
            "Address": "10.0.0.1",
            "Port": port,
            "TaggedAddresses": {
                "http": {"Address": format!("http://10.0.0.1:{}", port), "Port": port}
            },
            "Meta": null
        },
        "Checks": [{"CheckID": format!("service:{}", id), "Status": "passing"}]
    })
}

fn entries_response(index: u64, entries: Vec<serde_json::Value>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("X-Consul-Index", index.to_string().as_str())
        .set_body_json(serde_json::Value::Array(entries))
}

#[tokio::test]
async fn test_blocking_query_sends_index_and_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("index", "7"))
        .and(query_param("wait", "30000ms"))
        .and(query_param("passing", "true"))
        .respond_with(entries_response(9, vec![entry("a1", 8080), entry("a2", 8081)]))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let entries = client
        .service("orders", 7, Duration::from_secs(30), true)
        .await
        .unwrap();
    assert_eq!(entries.index, 9);
    assert_eq!(
        entries.instances,
        vec![
            ServiceInstance::new("a1", "orders", vec!["http://10.0.0.1:8080".to_string()]),
            ServiceInstance::new("a2", "orders", vec!["http://10.0.0.1:8081".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_missing_index_header_is_treated_as_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param_is_missing("index"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let entries = client
        .service("orders", 0, Duration::ZERO, false)
        .await
        .unwrap();
    assert_eq!(entries.index, 1);
    assert!(entries.instances.is_empty());
}

#[tokio::test]
async fn test_register_sends_token_and_registration() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(header("X-Consul-Token", "secret"))
        .and(query_param("dc", "dc2"))
        .and(body_partial_json(json!({
            "ID": "a1",
            "Name": "orders",
            "TaggedAddresses": {"grpc": {"Address": "grpc://10.0.0.1:9000", "Port": 9000}},
            "Check": {"CheckID": "service:a1", "TTL": "15s", "Status": "passing"}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = ConsulHttpClient::new(
        ConsulClientConfig::new(server.uri())
            .with_token("secret")
            .with_datacenter("dc2"),
    )
    .unwrap();
    let instance = ServiceInstance::new("a1", "orders", vec!["grpc://10.0.0.1:9000".to_string()]);
    let registration =
        registration_for(&instance, Duration::from_secs(15), Duration::from_secs(60)).unwrap();
    client.register_service(&registration).await.unwrap();
}

#[tokio::test]
async fn test_deregister_unknown_service_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/ghost"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Unknown service ID"))
        .mount(&server)
        .await;

    client_for(&server).deregister_service("ghost").await.unwrap();
}

#[tokio::test]
async fn test_path_segments_are_percent_encoded() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/deregister/a%2F1%3Fx%23y"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/pass/service:a%2F1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/billing%2Fv2"))
        .respond_with(entries_response(3, vec![]))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.deregister_service("a/1?x#y").await.unwrap();
    client.pass_ttl("service:a/1").await.unwrap();
    let entries = client
        .service("billing/v2", 0, Duration::ZERO, true)
        .await
        .unwrap();
    assert!(entries.instances.is_empty());
}

#[test]
fn test_invalid_agent_address_is_rejected() {
    assert!(ConsulHttpClient::new(ConsulClientConfig::new("not a url")).is_err());
}

#[tokio::test]
async fn test_pass_ttl_failure_maps_to_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/check/pass/service:a1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Unknown check ID \"service:a1\""))
        .mount(&server)
        .await;

    let err = client_for(&server).pass_ttl("service:a1").await.unwrap_err();
    assert!(matches!(err, RegistryError::StoreUnavailable(ref message) if message.contains("Unknown check ID")));
}

#[tokio::test]
async fn test_unreachable_agent_is_unavailable() {
    let client = ConsulHttpClient::new(
        ConsulClientConfig::new("http://127.0.0.1:1")
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(500)),
    )
    .unwrap();
    let err = client
        .service("orders", 0, Duration::ZERO, true)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::StoreUnavailable(_)));
}

#[tokio::test]
async fn test_resolver_resets_index_when_it_goes_backwards() {
    let server = MockServer::start().await;
    // Initial and reset reads
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param_is_missing("index"))
        .respond_with(entries_response(10, vec![entry("a1", 8080)]))
        .mount(&server)
        .await;
    // One response from a server whose index went backwards
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("index", "10"))
        .respond_with(entries_response(5, vec![entry("a1", 8080), entry("a2", 8081)]))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health/service/orders"))
        .and(query_param("index", "10"))
        .respond_with(
            entries_response(10, vec![entry("a1", 8080)]).set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let registry = ConsulRegistry::new(
        Arc::new(client_for(&server)),
        ConsulOptions::default().with_blocking_wait(Duration::from_secs(1)),
    );
    let mut watcher = registry.watch("orders", CancellationToken::new()).await.unwrap();
    watcher.next().await.unwrap();
    assert_eq!(watcher.snapshot().len(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    registry.close().await;

    let requests = server.received_requests().await.unwrap();
    let indexes: Vec<Option<String>> = requests
        .iter()
        .map(|r| {
            r.url
                .query_pairs()
                .find(|(k, _)| k == "index")
                .map(|(_, v)| v.into_owned())
        })
        .collect();
    assert!(indexes.len() >= 4);
    assert_eq!(indexes[0], None);
    assert_eq!(indexes[1].as_deref(), Some("10"));
    // Went backwards to 5: the next read starts over without an index
    assert_eq!(indexes[2], None);
    assert_eq!(indexes[3].as_deref(), Some("10"));
}
