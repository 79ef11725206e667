//! Full connections driven through JSON, the way a socket would

use serde_json::{Value, json};
use tokio::sync::mpsc;
use webterm::{ClientEvent, ServerEvent, SessionId};

use super::Harness;

/// Client side of one connection
struct Client {
    to_server: mpsc::Sender<ClientEvent>,
    from_server: mpsc::Receiver<ServerEvent>,
    connection: tokio::task::JoinHandle<()>,
}

impl Client {
    fn connect(harness: &Harness, client_id: &str) -> Self {
        let (to_server, mut incoming) = mpsc::channel::<ClientEvent>(16);
        let (outgoing, from_server) = mpsc::channel(256);
        let dispatcher = harness.dispatcher.clone();
        let client_id = client_id.to_owned();

        let connection = tokio::spawn(async move {
            let incoming = futures_util::stream::poll_fn(move |cx| incoming.poll_recv(cx));
            dispatcher
                .serve_connection(
                    SessionId::generate(),
                    &client_id,
                    Some(3001),
                    incoming,
                    outgoing,
                )
                .await;
        });

        Self {
            to_server,
            from_server,
            connection,
        }
    }

    async fn send(&self, message: Value) {
        let event: ClientEvent = serde_json::from_value(message).unwrap();
        self.to_server.send(event).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let event = self.from_server.recv().await.expect("connection open");
        serde_json::to_value(event).unwrap()
    }

    /// Messages up to and including the next one of type `kind`
    async fn recv_until(&mut self, kind: &str) -> Vec<Value> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv().await;
            let done = message["type"] == kind;
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    async fn disconnect(self) {
        drop(self.to_server);
        self.connection.await.unwrap();
    }
}

fn output_text(messages: &[Value]) -> String {
    messages
        .iter()
        .filter(|m| m["type"] == "output")
        .filter_map(|m| m["payload"]["output"].as_str())
        .collect()
}

#[tokio::test]
async fn test_server_info_is_first() {
    let harness = Harness::new();
    let mut client = Client::connect(&harness, "first");

    let info = client.recv().await;
    assert_eq!(info["type"], "server-info");
    assert_eq!(info["payload"]["port"], 3001);
    let languages = info["payload"]["supportedLanguages"].as_array().unwrap();
    assert!(languages.contains(&json!("shell")));
    assert!(languages.contains(&json!("shellc")));

    client.disconnect().await;
}

#[tokio::test]
async fn test_execute_round_trip() {
    let harness = Harness::new();
    let mut client = Client::connect(&harness, "round-trip");
    client.recv().await;

    client
        .send(json!({
            "type": "execute",
            "payload": {"code": "echo over the wire; echo oops >&2", "language": "shell"}
        }))
        .await;
    let messages = client.recv_until("execution-complete").await;

    assert!(output_text(&messages).contains("over the wire"));
    let oops = messages
        .iter()
        .find(|m| m["payload"]["output"] == "oops\n")
        .unwrap();
    assert_eq!(oops["payload"]["error"], true);

    let done = &messages.last().unwrap()["payload"];
    assert_eq!(done["outcome"], "Success");
    assert_eq!(done["exitCode"], 0);
    assert_eq!(done["language"], "shell");

    client.disconnect().await;
}

#[tokio::test]
async fn test_busy_then_stop() {
    let harness = Harness::new();
    let mut client = Client::connect(&harness, "busy");
    client.recv().await;

    let execute = json!({
        "type": "execute",
        "payload": {"code": "echo started; sleep 30", "language": "shell"}
    });
    client.send(execute.clone()).await;

    // Wait until the program is actually running
    let messages = client.recv_until("output").await;
    let mut seen = output_text(&messages);
    while !seen.contains("started") {
        let message = client.recv().await;
        seen.push_str(message["payload"]["output"].as_str().unwrap_or_default());
    }

    client.send(execute).await;
    let rejected = client.recv_until("busy").await;
    assert_eq!(rejected.last().unwrap()["type"], "busy");

    client.send(json!({"type": "stop"})).await;
    let messages = client.recv_until("execution-complete").await;
    assert_eq!(messages.last().unwrap()["payload"]["outcome"], "Cancelled");
    assert!(output_text(&messages).contains("Execution cancelled"));

    client.disconnect().await;
}

#[tokio::test]
async fn test_template_lookup_by_extension() {
    let harness = Harness::new();
    let mut client = Client::connect(&harness, "templates");
    client.recv().await;

    client
        .send(json!({"type": "get-template", "payload": "sh"}))
        .await;
    assert_eq!(
        client.recv().await,
        json!({"type": "template", "payload": "echo \"Hello, World!\""})
    );

    client
        .send(json!({"type": "get-template", "payload": "bash"}))
        .await;
    assert_eq!(client.recv().await["payload"], "echo \"Hello, World!\"");

    client
        .send(json!({"type": "get-template", "payload": "unknown"}))
        .await;
    assert_eq!(
        client.recv().await,
        json!({"type": "template", "payload": null})
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_preferences_follow_client_id() {
    let harness = Harness::new();

    let mut client = Client::connect(&harness, "returning");
    client.recv().await;
    client
        .send(json!({
            "type": "execute",
            "payload": {
                "code": "echo first",
                "language": "shell",
                "preferences": {"showProgress": false}
            }
        }))
        .await;
    let messages = client.recv_until("execution-complete").await;
    assert_eq!(output_text(&messages), "first\n");
    client.disconnect().await;

    // Same client id on a new connection keeps the setting
    let mut client = Client::connect(&harness, "returning");
    client.recv().await;
    client
        .send(json!({
            "type": "execute",
            "payload": {"code": "echo second", "language": "shell"}
        }))
        .await;
    let messages = client.recv_until("execution-complete").await;
    assert_eq!(output_text(&messages), "second\n");
    client.disconnect().await;

    // Another client still gets progress notices
    let mut other = Client::connect(&harness, "someone-else");
    other.recv().await;
    other
        .send(json!({
            "type": "execute",
            "payload": {"code": "echo third", "language": "shell"}
        }))
        .await;
    let messages = other.recv_until("execution-complete").await;
    assert!(output_text(&messages).contains("Executing shell code"));
    other.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_mid_execution_cleans_up() {
    let harness = Harness::new();
    let mut client = Client::connect(&harness, "leaver");
    client.recv().await;

    client
        .send(json!({
            "type": "execute",
            "payload": {"code": "echo going; sleep 30", "language": "shell"}
        }))
        .await;
    client.recv_until("output").await;

    let started = std::time::Instant::now();
    client.disconnect().await;
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert_eq!(super::count_entries(harness.workspace_root()), 0);
}
