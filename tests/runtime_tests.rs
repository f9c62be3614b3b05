//! Runtime facade tests: configuration file to running servers and back

mod common;

use common::*;
use modhost::module::ipc::{MarshalMode, RemoteClient};
use modhost::{ModuleRuntime, ModuleState};
use std::io::Write;
use tempfile::NamedTempFile;

const DOCUMENT: &str = r#"
[global]
startup = ["panel"]
namespace_server_port = 0
force_remote_calls_by_value = true

[global.remote_modules_server]
address = "127.0.0.1"
port = 0

[hardware.laser]
module.Class = "test.Recording"
options = { wavelength_nm = 532 }

[logic.pulsed]
"module.Class" = "test.Recording"
connect = { laser = "laser" }

[gui.panel]
module.Class = "test.Recording"
connect = { logic = "pulsed" }
allow_remote = false
"#;

fn document_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_runtime_from_file_lifecycle() {
    let journal = Journal::new();
    let file = document_file(DOCUMENT);

    let runtime = ModuleRuntime::from_file(file.path(), catalog(&journal))
        .await
        .unwrap();

    assert_eq!(journal.names("activate"), vec!["laser", "pulsed", "panel"]);
    assert_eq!(runtime.status("panel").await.unwrap(), ModuleState::Active);

    let remote = runtime.remote_addr().unwrap();
    let client = RemoteClient::connect(remote, "test").await.unwrap();
    assert_eq!(client.mode(), MarshalMode::ByValue);
    assert_eq!(client.list_modules().await.unwrap(), vec!["laser", "pulsed"]);

    let local = RemoteClient::connect(runtime.namespace_addr(), "kernel").await.unwrap();
    assert_eq!(
        local.list_modules().await.unwrap(),
        vec!["laser", "panel", "pulsed"]
    );

    runtime.deactivate("pulsed").await.unwrap();
    assert_eq!(runtime.status("panel").await.unwrap(), ModuleState::Unloaded);
    runtime.activate("panel").await.unwrap();

    let mut changes = runtime.subscribe_state_changes();
    runtime.shutdown().await.unwrap();

    assert_eq!(
        journal.names("deactivate"),
        vec!["panel", "pulsed", "panel", "pulsed", "laser"]
    );
    let last = changes.drain().pop().unwrap();
    assert_eq!(last.module, "laser");
    assert_eq!(last.new, ModuleState::Unloaded);
}

#[tokio::test]
async fn test_runtime_reload_from_file() {
    let journal = Journal::new();
    let file = document_file(DOCUMENT);
    let runtime = ModuleRuntime::from_file(file.path(), catalog(&journal))
        .await
        .unwrap();
    journal.clear();

    let changed = DOCUMENT.replace("wavelength_nm = 532", "wavelength_nm = 1064");
    let updated = document_file(&changed);
    let report = runtime.reload_from_file(updated.path()).await.unwrap();

    assert_eq!(report.changed, vec!["laser"]);
    assert_eq!(journal.names("construct"), vec!["laser", "pulsed", "panel"]);
    assert_eq!(runtime.status("panel").await.unwrap(), ModuleState::Active);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_runtime_rejects_cyclic_document() {
    let journal = Journal::new();
    let file = document_file(
        r#"
        [logic.a]
        "module.Class" = "test.Recording"
        connect = { b = "b" }

        [logic.b]
        "module.Class" = "test.Recording"
        connect = { a = "a" }
        "#,
    );

    assert!(ModuleRuntime::from_file(file.path(), catalog(&journal))
        .await
        .is_err());
}
