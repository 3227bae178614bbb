//! The outer tool surface over a real byte stream.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use testenv_orchestrator::{Config, Orchestrator, OrchestratorHandler, TestEnvArtifact};
use testenv_provider_mem::MemProvider;
use testenv_proto::channel::ToolClient;
use testenv_proto::provider::Provider;
use testenv_proto::ErrorCode;

type DuplexClient = ToolClient<
    tokio::io::ReadHalf<tokio::io::DuplexStream>,
    tokio::io::WriteHalf<tokio::io::DuplexStream>,
>;

fn serve_orchestrator(dir: &tempfile::TempDir) -> DuplexClient {
    let config = Config {
        state_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let orchestrator = Arc::new(
        Orchestrator::new(config)
            .with_local_provider("mem", Arc::new(MemProvider::new()) as Arc<dyn Provider>),
    );
    let handler = OrchestratorHandler::new(orchestrator);

    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let (server_read, server_write) = tokio::io::split(server_end);
    tokio::spawn(async move {
        let _ = testenv_proto::serve(
            server_read,
            server_write,
            &handler,
            CancellationToken::new(),
        )
        .await;
    });
    let (client_read, client_write) = tokio::io::split(client_end);
    ToolClient::new(client_read, client_write)
}

#[tokio::test]
async fn create_then_delete_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let client = serve_orchestrator(&dir);

    let result = client
        .call(
            "create",
            json!({
                "testId": "t-wire",
                "spec": {
                    "keys": [{"name": "k", "spec": {"type": "ed25519"}}],
                    "networks": [{"name": "n", "spec": {"kind": "nat", "cidr": "10.9.0.0/24"}}]
                }
            }),
        )
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let artifact: TestEnvArtifact = serde_json::from_value(result).unwrap();
    assert_eq!(artifact.test_id, "t-wire");
    assert_eq!(artifact.managed_resources.keys.len(), 1);
    assert_eq!(artifact.managed_resources.networks.len(), 1);

    let result = client
        .call("delete", json!({"testId": "t-wire"}))
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result, json!({"ok": true}));
}

#[tokio::test]
async fn missing_test_id_is_rejected_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let client = serve_orchestrator(&dir);

    let err = client
        .call("create", json!({"spec": {}}))
        .await
        .unwrap()
        .into_result()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidSpec);
    assert!(err.message.contains("testId"));
}

#[tokio::test]
async fn unknown_tool_is_not_implemented() {
    let dir = tempfile::tempdir().unwrap();
    let client = serve_orchestrator(&dir);

    let err = client
        .call("snapshot", json!({}))
        .await
        .unwrap()
        .into_result()
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotImplemented);
}
