use futures_util::future::BoxFuture;
use karton::client::{SocketSink, SocketStream};
use karton::transport::memory::duplex;
use karton::{
    ErrorObject, KartonClient, KartonClientConfig, KartonError, KartonResult, KartonServer,
    ProcedureTree, StateManager, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

fn memory_connector(
    server: KartonServer,
) -> impl Fn() -> BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> + Send + Sync + 'static
{
    move || {
        let server = server.clone();
        let connecting: BoxFuture<'static, KartonResult<(SocketSink, SocketStream)>> =
            Box::pin(async move {
                let (server_side, client_side) = duplex();
                let (sink, stream) = server_side.split();
                server.accept(sink, stream)?;
                let (sink, stream) = client_side.split();
                Ok((sink, stream))
            });
        connecting
    }
}

fn fast_reconnect() -> KartonClientConfig {
    KartonClientConfig::default().with_reconnect_interval(Duration::from_millis(20))
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Condition should hold eventually");
}

async fn connected_client(server: &KartonServer) -> KartonClient {
    let client = KartonClient::builder(memory_connector(server.clone()))
        .config(fast_reconnect())
        .build();
    assert!(client.wait_connected().await);
    eventually(|| client.is_synced()).await;
    client
}

#[tokio::test]
async fn test_replicas_converge_over_many_mutations() {
    let server = KartonServer::new(
        Value::from(json!({"todos": [], "meta": {"count": 0}})),
        ProcedureTree::new(),
    );
    let first = connected_client(&server).await;
    let second = connected_client(&server).await;

    for n in 0..20 {
        server.mutate(|state| {
            if let Some(todos) = state.get_mut("todos").and_then(Value::as_array_mut) {
                if n % 3 == 2 {
                    todos.remove(0);
                } else {
                    todos.push(Value::from(json!({"title": format!("todo {}", n), "done": false})));
                }
            }
            if let Some(meta) = state.get_mut("meta") {
                meta.set("count", n);
            }
        });
    }
    server.mutate(|state| {
        state.set("finished", chrono::Utc::now());
    });

    let canonical = server.state();
    eventually(|| first.state() == canonical && second.state() == canonical).await;

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_counter_scenario_over_procedures() {
    // Procedures that mutate share the served state manager
    let state = Arc::new(StateManager::new(Value::from(json!({"counter": 0})), 64));
    let procedure_state = state.clone();
    let server = KartonServer::with_state(
        state,
        ProcedureTree::new().procedure("increment", move |_| {
            let state = procedure_state.clone();
            async move {
                let next = state.mutate(|draft| {
                    let counter = draft.get("counter").and_then(Value::as_i64).unwrap_or(0);
                    draft.set("counter", counter + 1);
                });
                Ok(next.get("counter").cloned().unwrap_or_default())
            }
        }),
        Default::default(),
    );

    let client = connected_client(&server).await;
    let result = client.server().at("increment").call(vec![]).await.unwrap();
    assert_eq!(result, Value::from(1));
    eventually(|| *client.state() == Value::from(json!({"counter": 1}))).await;

    // A late joiner gets the current state as one full sync
    let late = connected_client(&server).await;
    assert_eq!(*late.state(), Value::from(json!({"counter": 1})));

    client.close().await;
    late.close().await;
}

#[tokio::test]
async fn test_concurrent_calls_answered_out_of_order() {
    let gate = Arc::new(Notify::new());
    let slow_gate = gate.clone();
    let server = KartonServer::new(
        Value::Null,
        ProcedureTree::new()
            .procedure("a", move |_| {
                let gate = slow_gate.clone();
                async move {
                    gate.notified().await;
                    Ok(Value::from("a"))
                }
            })
            .procedure("b", |_| async { Ok(Value::from("b")) }),
    );
    let client = connected_client(&server).await;
    let remote = client.server();

    let slow = {
        let remote = remote.clone();
        tokio::spawn(async move { remote.at("a").call(vec![]).await })
    };
    let fast = remote.at("b").call(vec![]).await.unwrap();
    assert_eq!(fast, Value::from("b"));

    gate.notify_one();
    assert_eq!(slow.await.unwrap().unwrap(), Value::from("a"));
    client.close().await;
}

#[tokio::test]
async fn test_errors_cross_the_wire() {
    let server = KartonServer::new(
        Value::Null,
        ProcedureTree::new().procedure("fail", |_| async {
            Err(ErrorObject::new("QuotaExceeded", "too many todos").with_field("limit", 10))
        }),
    );
    let client = connected_client(&server).await;

    match client.server().at("fail").call(vec![]).await {
        Err(KartonError::Remote(error)) => {
            assert_eq!(error.name, "QuotaExceeded");
            assert_eq!(error.field("limit"), Some(&Value::from(10)));
        }
        other => panic!("Expected remote error, got: {:?}", other),
    }
    match client.server().resolve("no.such.procedure").call(vec![]).await {
        Err(KartonError::ProcedureNotFound { path }) => assert_eq!(path, "no.such.procedure"),
        other => panic!("Expected ProcedureNotFound, got: {:?}", other),
    }
    client.close().await;
}

#[tokio::test]
async fn test_server_calls_client_procedures() {
    let server = KartonServer::new(Value::Null, ProcedureTree::new());
    let received = Arc::new(Mutex::new(Vec::new()));
    let recorded = received.clone();

    let client = KartonClient::builder(memory_connector(server.clone()))
        .procedures(ProcedureTree::new().namespace(
            "ui",
            ProcedureTree::new().procedure("notify", move |parameters| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(parameters.clone());
                    Ok(Value::from("shown"))
                }
            }),
        ))
        .build();
    assert!(client.wait_connected().await);

    let session_id = server.session_ids().into_iter().next().unwrap();
    let result = server
        .client(&session_id)
        .unwrap()
        .resolve("ui.notify")
        .call(vec![Value::from("hello")])
        .await
        .unwrap();

    assert_eq!(result, Value::from("shown"));
    // No caller id is injected on the client side
    assert_eq!(*received.lock().unwrap(), vec![vec![Value::from("hello")]]);

    assert!(matches!(
        server.client("not-a-session"),
        Err(KartonError::ClientNotFound { .. })
    ));
    client.close().await;
}

#[tokio::test]
async fn test_reconnect_resyncs_from_scratch() {
    let server = KartonServer::new(Value::from(json!({"counter": 0})), ProcedureTree::new());
    let connections = Arc::new(AtomicUsize::new(0));
    let transitions = Arc::new(Mutex::new(Vec::new()));

    let counter = connections.clone();
    let recorded = transitions.clone();
    let client = KartonClient::builder(memory_connector(server.clone()))
        .config(fast_reconnect())
        .on_connection_change(move |connected| {
            if connected {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            recorded.lock().unwrap().push(connected);
        })
        .build();
    assert!(client.wait_connected().await);
    eventually(|| client.is_synced()).await;

    let first_session = server.session_ids().into_iter().next().unwrap();
    assert!(server.disconnect(&first_session));

    // Changes made while the client is away arrive through the next full sync
    server.mutate(|state| {
        state.set("counter", 41);
    });
    server.mutate(|state| {
        state.set("counter", 42);
    });

    eventually(|| connections.load(Ordering::SeqCst) == 2).await;
    eventually(|| *client.state() == Value::from(json!({"counter": 42}))).await;

    let sessions = server.session_ids();
    assert_eq!(sessions.len(), 1);
    assert_ne!(sessions[0], first_session);

    client.close().await;
    assert_eq!(*transitions.lock().unwrap(), vec![true, false, true, false]);
}
