//! The provider protocol against a real subprocess.

use std::process::Stdio;

use serde_json::json;
use tokio::process::Command;

use testenv_proto::capabilities::{Operation, ProviderCapabilities};
use testenv_proto::channel::{ToolClient, TOOL_SHUTDOWN};
use testenv_proto::provider::OperationResult;
use testenv_proto::spec::ResourceKind;
use testenv_proto::state::KeyState;

#[tokio::test]
async fn subprocess_speaks_the_full_protocol() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_testenv-provider-mem"))
        .arg("serve-tools")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .expect("provider binary launches");
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let client = ToolClient::new(stdout, stdin);

    // Capabilities handshake.
    let caps: ProviderCapabilities = serde_json::from_value(
        client
            .call("provider_capabilities", json!({}))
            .await
            .unwrap()
            .into_result()
            .unwrap(),
    )
    .unwrap();
    assert_eq!(caps.provider_name, "mem");
    assert!(caps.supports(ResourceKind::Key, Operation::Create));
    assert!(caps.supports(ResourceKind::Vm, Operation::Delete));

    // Key lifecycle over the wire.
    let result: OperationResult = serde_json::from_value(
        client
            .call(
                "key_create",
                json!({"name": "k1", "spec": {"type": "ed25519"}}),
            )
            .await
            .unwrap()
            .into_result()
            .unwrap(),
    )
    .unwrap();
    let key: KeyState = result.state().unwrap();
    assert!(key.public_key.starts_with("ssh-ed25519 "));

    let result: OperationResult = serde_json::from_value(
        client
            .call("key_get", json!({"name": "k1"}))
            .await
            .unwrap()
            .into_result()
            .unwrap(),
    )
    .unwrap();
    assert!(result.success);

    // Missing required field fails validation before dispatch.
    let result: Result<_, _> = client
        .call("key_get", json!({}))
        .await
        .unwrap()
        .into_result();
    assert!(result.is_err());

    // Graceful shutdown stops the process.
    client.call(TOOL_SHUTDOWN, json!({})).await.unwrap();
    let status = child.wait().await.unwrap();
    assert!(status.success());
}
