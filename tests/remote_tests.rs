//! Remote access server tests
//!
//! Real TCP sessions on ephemeral loopback ports.

mod common;

use common::*;
use modhost::module::ipc::{
    Argument, MarshalMode, RemoteAccessServer, RemoteClient, RemoteError, SessionPolicy,
};
use modhost::{ModuleRegistry, ModuleState, Tier, Value};
use std::net::SocketAddr;
use std::time::Duration;

fn policy(mode: MarshalMode) -> SessionPolicy {
    SessionPolicy {
        mode,
        idle_timeout: Duration::from_secs(30),
        call_timeout: Duration::from_secs(5),
        honor_allow_remote: true,
    }
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn serve(registry: &ModuleRegistry, policy: SessionPolicy) -> RemoteAccessServer {
    RemoteAccessServer::bind(any_port(), registry.clone(), policy)
        .await
        .unwrap()
}

fn modules() -> Vec<modhost::ModuleSpec> {
    vec![
        spec("scope", Tier::Logic),
        spec("laser", Tier::Hardware),
        spec("private", Tier::Hardware).allow_remote(false),
    ]
}

#[tokio::test]
async fn test_lookup_of_unloaded_module_does_not_activate() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    let err = client.lookup("laser").await.unwrap_err();
    assert_eq!(err, RemoteError::ModuleUnavailable("laser".to_string()));
    assert_eq!(registry.status("laser").await.unwrap(), ModuleState::Unloaded);
    assert_eq!(journal.count("construct", "laser"), 0);

    let err = client.invoke("laser", "echo", vec![]).await.unwrap_err();
    assert_eq!(err, RemoteError::ModuleUnavailable("laser".to_string()));

    server.shutdown().await;
}

#[tokio::test]
async fn test_lookup_and_invoke_active_module() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    assert_eq!(client.mode(), MarshalMode::ByValue);
    assert_eq!(client.list_modules().await.unwrap(), vec!["scope"]);

    let scope = client.lookup("scope").await.unwrap();
    assert_eq!(scope.info().tier, Tier::Logic);
    assert_eq!(scope.info().class_id, RECORDING);
    assert!(scope.info().capabilities.contains(&"increment".to_string()));

    assert_eq!(scope.call("increment", &[]).await.unwrap(), Value::Int(1));
    assert_eq!(scope.call("increment", &[]).await.unwrap(), Value::Int(2));
    assert_eq!(
        scope.call("echo", &[Value::from("hi")]).await.unwrap(),
        Value::from("hi")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_by_value_arguments_do_not_alias() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();
    let scope = client.lookup("scope").await.unwrap();

    let local = Value::List(vec![Value::Int(1)]);
    let returned = scope
        .call("append", &[local.clone(), Value::Int(2)])
        .await
        .unwrap();

    // The remote side mutated its own copy
    assert_eq!(returned, Value::List(vec![Value::Int(1), Value::Int(2)]));
    assert_eq!(local, Value::List(vec![Value::Int(1)]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_by_value_session_rejects_references() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    assert!(matches!(
        client.put(Value::Int(1)).await,
        Err(RemoteError::Protocol(_))
    ));
    assert!(matches!(
        client
            .invoke("scope", "append", vec![Argument::Ref(1), Argument::Value(Value::Int(2))])
            .await,
        Err(RemoteError::Protocol(_))
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_by_reference_session_keeps_mutations() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByReference)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();
    assert_eq!(client.mode(), MarshalMode::ByReference);

    let handle = client.put(Value::List(vec![])).await.unwrap();
    for i in 0..3 {
        client
            .invoke(
                "scope",
                "append",
                vec![Argument::Ref(handle), Argument::Value(Value::Int(i))],
            )
            .await
            .unwrap();
    }

    assert_eq!(
        client.fetch(handle).await.unwrap(),
        Value::List(vec![Value::Int(0), Value::Int(1), Value::Int(2)])
    );
    client.release(handle).await.unwrap();
    assert!(matches!(client.fetch(handle).await, Err(RemoteError::Protocol(_))));

    server.shutdown().await;
}

#[tokio::test]
async fn test_module_with_remote_access_disabled_is_hidden() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("private").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    assert!(client.list_modules().await.unwrap().is_empty());
    assert_eq!(
        client.lookup("private").await.unwrap_err(),
        RemoteError::ModuleUnavailable("private".to_string())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_invocation_errors_are_reported() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    assert!(matches!(
        client.invoke("scope", "fail", vec![]).await,
        Err(RemoteError::InvocationFailed(_))
    ));
    assert!(matches!(
        client.invoke("scope", "no_such_method", vec![]).await,
        Err(RemoteError::InvocationFailed(_))
    ));
    // The module is unaffected
    assert_eq!(registry.status("scope").await.unwrap(), ModuleState::Active);
    client.ping().await.unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn test_slow_call_times_out() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let mut slow = policy(MarshalMode::ByValue);
    slow.call_timeout = Duration::from_millis(100);
    let server = serve(&registry, slow).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    let err = client
        .invoke("scope", "sleep", vec![Argument::Value(Value::Int(2_000))])
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Timeout);
    client.ping().await.unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn test_deactivated_module_becomes_unavailable() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();
    let scope = client.lookup("scope").await.unwrap();
    scope.call("increment", &[]).await.unwrap();

    registry.request_deactivate("scope").await.unwrap();

    assert_eq!(
        scope.call("increment", &[]).await.unwrap_err(),
        RemoteError::ModuleUnavailable("scope".to_string())
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_session_is_closed() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    let mut idle = policy(MarshalMode::ByValue);
    idle.idle_timeout = Duration::from_millis(150);
    let server = serve(&registry, idle).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(server.active_sessions(), 1);

    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(client.ping().await, Err(RemoteError::Disconnected));
    assert_eq!(server.active_sessions(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let addr = server.local_addr();
    let client = RemoteClient::connect(addr, "test").await.unwrap();

    server.shutdown().await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(client.ping().await, Err(RemoteError::Disconnected));
    assert!(RemoteClient::connect(addr, "late").await.is_err());
}

#[tokio::test]
async fn test_long_call_keeps_session_open() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let mut short_idle = policy(MarshalMode::ByValue);
    short_idle.idle_timeout = Duration::from_millis(100);
    let server = serve(&registry, short_idle).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    let result = client
        .invoke("scope", "sleep", vec![Argument::Value(Value::Int(500))])
        .await;

    assert_eq!(result, Ok(Value::Null));
    client.ping().await.unwrap();

    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_module_debug_names_module() {
    let journal = Journal::new();
    let registry = registry(&journal, modules());
    registry.request_activate("scope").await.unwrap();
    let server = serve(&registry, policy(MarshalMode::ByValue)).await;
    let client = RemoteClient::connect(server.local_addr(), "test").await.unwrap();

    let scope = client.lookup("scope").await.unwrap();
    let rendered = format!("{:?}", scope);
    assert!(rendered.contains("RemoteModule"));
    assert!(rendered.contains("scope"));
    assert!(format!("{:?}", client).contains(client.session_id()));

    server.shutdown().await;
}
