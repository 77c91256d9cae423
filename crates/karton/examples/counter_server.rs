use axum::{extract::State, response::Json, routing::get, Router};
use karton::{ErrorObject, KartonServer, KartonServerConfig, ProcedureTree, StateManager, Value};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};

fn counter(state: &Value) -> i64 {
    state.get("counter").and_then(Value::as_i64).unwrap_or_default()
}

fn procedures(state: Arc<StateManager>) -> ProcedureTree {
    let increment_state = state.clone();
    let reset_state = state;

    ProcedureTree::new()
        .namespace(
            "counter",
            ProcedureTree::new()
                .typed("increment", move |(by, session_id): (i64, String)| {
                    let state = increment_state.clone();
                    async move {
                        if by <= 0 {
                            return Err(ErrorObject::new("ValidationError", "increment must be positive")
                                .with_field("by", by));
                        }
                        let next = state.mutate(|draft| {
                            let current = counter(draft);
                            draft.set("counter", current + by);
                            draft.set("lastChangedBy", session_id.clone());
                        });
                        Ok::<_, ErrorObject>(counter(&next))
                    }
                })
                .procedure("reset", move |_| {
                    let state = reset_state.clone();
                    async move {
                        state.mutate(|draft| {
                            draft.set("counter", 0);
                        });
                        Ok(Value::Null)
                    }
                }),
        )
        .procedure("whoami", |parameters| async move {
            Ok(parameters.last().cloned().unwrap_or_default())
        })
}

async fn get_counter(State(server): State<KartonServer>) -> Json<serde_json::Value> {
    let state = server.state();
    Json(json!({
        "counter": counter(&state),
        "sessions": server.session_ids(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting counter server with karton...");

    let config = KartonServerConfig::default();
    let state = Arc::new(StateManager::new(
        Value::from(json!({"counter": 0, "sessions": []})),
        config.patch_buffer,
    ));
    let server = KartonServer::with_state(state.clone(), procedures(state.clone()), config);

    let session_state = state.clone();
    server.on_session_change(move |ids| {
        let ids: Vec<Value> = ids.iter().map(|id| Value::from(id.as_str())).collect();
        session_state.mutate(|draft| {
            draft.set("sessions", Value::Array(ids));
        });
    });

    // Greet every connected client now and then
    let notifier = server.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            for session_id in notifier.session_ids() {
                let Ok(client) = notifier.client(&session_id) else {
                    continue;
                };
                let message = Value::from(format!("counter is {}", counter(&notifier.state())));
                match client.resolve("ui.notify").call(vec![message]).await {
                    Ok(_) => info!("Notified session {}", session_id),
                    Err(e) => warn!("Could not notify session {}: {}", session_id, e),
                }
            }
        }
    });

    let app = Router::new()
        .route("/counter", get(get_counter))
        .with_state(server.clone())
        .merge(karton::router(server.clone()));

    let listener = TcpListener::bind("127.0.0.1:3001").await?;
    info!("Server running on http://127.0.0.1:3001");
    info!(
        "WebSocket endpoint available at ws://127.0.0.1:3001{}",
        server.config().route
    );

    axum::serve(listener, app).await?;

    Ok(())
}
