// Scripted in-process snapserver for integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};
use snapcast_control::{ServerSnapshot, StateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const STEP: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Accepts any number of control connections on an ephemeral port
pub struct MockServer {
    port: u16,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, accepted) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (read, write) = stream.into_split();
                let conn = ServerConn {
                    lines: BufReader::new(read).lines(),
                    write,
                };
                if tx.send(conn).is_err() {
                    break;
                }
            }
        });

        Self { port, accepted }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Next accepted connection
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(STEP, self.accepted.recv())
            .await
            .expect("no connection accepted")
            .expect("listener stopped")
    }

    /// Whether a connection arrives within `wait`
    pub async fn accepts_within(&mut self, wait: Duration) -> bool {
        matches!(tokio::time::timeout(wait, self.accepted.recv()).await, Ok(Some(_)))
    }
}

/// Server side of one control connection
pub struct ServerConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl ServerConn {
    /// Read the next request line
    pub async fn recv_request(&mut self) -> Value {
        let line = tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("no request received")
            .unwrap()
            .expect("client closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Read the next request and check its method
    pub async fn expect_request(&mut self, method: &str) -> (u64, Value) {
        let request = self.recv_request().await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], method, "unexpected request {}", request);
        (
            request["id"].as_u64().unwrap(),
            request.get("params").cloned().unwrap_or(Value::Null),
        )
    }

    /// Whether the client closed its end
    pub async fn is_closed_by_client(&mut self) -> bool {
        matches!(
            tokio::time::timeout(STEP, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }

    pub async fn send_raw(&mut self, data: &str) {
        self.write.write_all(data.as_bytes()).await.unwrap();
        self.write.flush().await.unwrap();
    }

    pub async fn send(&mut self, message: Value) {
        self.send_raw(&format!("{}\r\n", message)).await;
    }

    pub async fn respond(&mut self, id: u64, result: Value) {
        self.send(json!({ "id": id, "jsonrpc": "2.0", "result": result }))
            .await;
    }

    pub async fn respond_error(&mut self, id: u64, code: i64, message: &str) {
        self.send(json!({ "id": id, "jsonrpc": "2.0", "error": { "code": code, "message": message } }))
            .await;
    }

    pub async fn notify(&mut self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await;
    }

    /// Write a response and a notification in a single write
    pub async fn respond_then_notify(&mut self, id: u64, result: Value, method: &str, params: Value) {
        let response = json!({ "id": id, "jsonrpc": "2.0", "result": result });
        let notification = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.send_raw(&format!("{}\r\n{}\r\n", response, notification))
            .await;
    }

    /// Answer the initial `Server.GetStatus`
    pub async fn serve_status(&mut self, status: Value) {
        let (id, _) = self.expect_request("Server.GetStatus").await;
        self.respond(id, status).await;
    }
}

pub fn client_json(id: &str, name: &str, volume: i64, muted: bool) -> Value {
    json!({
        "id": id,
        "connected": true,
        "config": {
            "instance": 1,
            "latency": 0,
            "name": name,
            "volume": { "muted": muted, "percent": volume }
        },
        "host": { "arch": "x86_64", "ip": "10.0.0.2", "mac": "02:42:ac:11:00:02", "name": id, "os": "Linux" },
        "lastSeen": { "sec": 1_700_000_000, "usec": 0 },
        "snapclient": { "name": "Snapclient", "protocolVersion": 2, "version": "0.27.0" }
    })
}

fn group_json(id: &str, name: &str, stream_id: &str, clients: Vec<Value>) -> Value {
    json!({ "id": id, "name": name, "stream_id": stream_id, "muted": false, "clients": clients })
}

fn stream_json(id: &str, status: &str) -> Value {
    json!({
        "id": id,
        "status": status,
        "uri": { "raw": format!("pipe:///tmp/{}?name={}", id, id), "scheme": "pipe", "query": { "name": id } },
        "properties": {}
    })
}

fn status_with(groups: Vec<Value>) -> Value {
    json!({
        "server": {
            "groups": groups,
            "server": {
                "host": { "arch": "x86_64", "ip": "10.0.0.1", "mac": "00:11:22:33:44:55", "name": "snapserver", "os": "Linux" },
                "snapserver": { "controlProtocolVersion": 1, "name": "Snapserver", "protocolVersion": 1, "version": "0.28.0" }
            },
            "streams": [ stream_json("default", "playing"), stream_json("radio", "idle") ]
        }
    })
}

/// Group `living` holds clientA (30%) and clientB (75%); group `kitchen`
/// holds clientC (55%)
pub fn status_json() -> Value {
    status_with(vec![
        group_json(
            "living",
            "Living Room",
            "default",
            vec![
                client_json("clientA", "Sofa", 30, false),
                client_json("clientB", "Shelf", 75, false),
            ],
        ),
        group_json("kitchen", "Kitchen", "radio", vec![client_json("clientC", "Counter", 55, false)]),
    ])
}

/// Same as [`status_json`] after clientC joined `living`
pub fn status_json_after_move() -> Value {
    status_with(vec![
        group_json(
            "living",
            "Living Room",
            "default",
            vec![
                client_json("clientA", "Sofa", 30, false),
                client_json("clientB", "Shelf", 75, false),
                client_json("clientC", "Counter", 55, false),
            ],
        ),
        group_json("kitchen", "Kitchen", "radio", vec![]),
    ])
}

/// Same as [`status_json`] after clientD connected and joined `kitchen`
pub fn status_json_with_new_client() -> Value {
    status_with(vec![
        group_json(
            "living",
            "Living Room",
            "default",
            vec![
                client_json("clientA", "Sofa", 30, false),
                client_json("clientB", "Shelf", 75, false),
            ],
        ),
        group_json(
            "kitchen",
            "Kitchen",
            "radio",
            vec![
                client_json("clientC", "Counter", 55, false),
                client_json("clientD", "Porch", 20, false),
            ],
        ),
    ])
}

/// Wait until the store publishes a snapshot matching `predicate`
pub async fn wait_for_snapshot(
    store: &StateStore,
    predicate: impl FnMut(&Arc<ServerSnapshot>) -> bool,
) -> Arc<ServerSnapshot> {
    let mut rx = store.watch();
    let snapshot = tokio::time::timeout(STEP, rx.wait_for(predicate))
        .await
        .expect("snapshot never matched")
        .unwrap()
        .clone();
    snapshot
}
