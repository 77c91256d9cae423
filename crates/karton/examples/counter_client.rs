use karton::{KartonClient, KartonClientConfig, ProcedureTree, Value, WebSocketConnector};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3001/karton".to_string());
    info!("Connecting counter client to {}", url);

    let client = KartonClient::builder(WebSocketConnector::new(url))
        .config(KartonClientConfig::default().with_reconnect_interval(Duration::from_secs(1)))
        .fallback_state(json!({"counter": 0, "sessions": []}))
        .procedures(ProcedureTree::new().namespace(
            "ui",
            ProcedureTree::new().procedure("notify", |parameters| async move {
                let message = parameters.first().and_then(Value::as_str).unwrap_or_default();
                info!("Server says: {}", message);
                Ok(Value::Null)
            }),
        ))
        .on_state_change(|state| {
            let counter = state.get("counter").and_then(Value::as_i64).unwrap_or_default();
            info!("Counter is now {}", counter);
        })
        .on_connection_change(|connected| info!("Connected: {}", connected))
        .build();

    if !client.wait_connected().await {
        return Ok(());
    }

    let server = client.server();
    let me = server.at("whoami").call(vec![]).await?;
    info!("Connected as session {}", me.as_str().unwrap_or("?"));

    let increment = server.resolve("counter.increment");
    for _ in 0..5 {
        match increment.call(vec![Value::from(1)]).await {
            Ok(counter) => info!("Incremented to {}", counter.as_i64().unwrap_or_default()),
            Err(e) => warn!("Increment failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    if let Err(e) = increment.call(vec![Value::from(-1)]).await {
        info!("Negative increment rejected as expected: {}", e);
    }

    tokio::signal::ctrl_c().await?;
    client.close().await;
    Ok(())
}
