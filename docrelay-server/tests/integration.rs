//! End-to-end tests: a real relay server on a loopback socket, real WebSocket
//! clients, and yrs documents on the client side.

use std::net::SocketAddr;
use std::sync::Arc;

use docrelay_server::{RelayConfig, RelayServer, SessionId};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Text, TextRef, Transact, Update};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUIET: Duration = Duration::from_millis(200);
const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    server: Arc<RelayServer>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(RelayConfig::default()).await
    }

    async fn start_with(config: RelayConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(RelayServer::new(config));
        let (stop, stopped) = oneshot::channel::<()>();

        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move {
            serving
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            server,
            stop: Some(stop),
            task,
        }
    }

    async fn connect(&self, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{path}", self.addr))
            .await
            .expect("client should connect");
        ws
    }

    /// Wait until `session` has exactly `count` subscribers.
    async fn wait_for_subscribers(&self, session: &str, count: usize) {
        let id = SessionId::from(session);
        timeout(WAIT, async {
            loop {
                if let Some(session) = self.server.registry().get(&id).await {
                    if session.subscriber_count().await == count {
                        return;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("session {session} never reached {count} subscribers"));
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server should stop")
            .unwrap();
    }
}

/// Next binary frame within `wait`, skipping control frames.
async fn recv_binary(ws: &mut Client, wait: Duration) -> Option<Vec<u8>> {
    timeout(wait, async {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Binary(data) = message {
                return Some(data.to_vec());
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn send_binary(ws: &mut Client, bytes: Vec<u8>) {
    ws.send(Message::Binary(bytes.into())).await.unwrap();
}

/// A client-side yrs document with one text field.
struct Replica {
    doc: Doc,
    text: TextRef,
}

impl Replica {
    fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text("body");
        Self { doc, text }
    }

    fn insert(&self, index: u32, content: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, content);
        txn.encode_update_v1()
    }

    fn apply(&self, update: &[u8]) {
        let mut txn = self.doc.transact_mut();
        txn.apply_update(Update::decode_v1(update).unwrap()).unwrap();
    }

    fn content(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }
}

#[tokio::test]
async fn test_scenario_initial_sync_then_broadcast() {
    let server = TestServer::start().await;

    let mut x = server.connect("/doc1").await;
    let x_doc = Replica::new();
    server.wait_for_subscribers("doc1", 1).await;

    // Fresh session: nothing to sync.
    assert!(recv_binary(&mut x, QUIET).await.is_none());

    send_binary(&mut x, x_doc.insert(0, "hello")).await;

    // Wait for the merge to land before Y joins.
    let registry = server.server.registry();
    let session = registry.get(&SessionId::from("doc1")).await.unwrap();
    timeout(WAIT, async {
        while session.current_state_as_delta().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut y = server.connect("/doc1").await;
    let y_doc = Replica::new();
    let initial = recv_binary(&mut y, WAIT).await.expect("initial sync");
    y_doc.apply(&initial);
    assert_eq!(y_doc.content(), "hello");

    send_binary(&mut x, x_doc.insert(5, " world")).await;

    let relayed = recv_binary(&mut y, WAIT).await.expect("Y receives D2");
    y_doc.apply(&relayed);
    assert_eq!(y_doc.content(), "hello world");

    assert!(recv_binary(&mut x, QUIET).await.is_none(), "X must not get its own delta back");

    server.shutdown().await;
}

#[tokio::test]
async fn test_no_echo_with_three_clients() {
    let server = TestServer::start().await;
    let mut a = server.connect("/shared").await;
    let mut b = server.connect("/shared").await;
    let mut c = server.connect("/shared").await;
    server.wait_for_subscribers("shared", 3).await;

    let a_doc = Replica::new();
    send_binary(&mut a, a_doc.insert(0, "from a")).await;

    for peer in [&mut b, &mut c] {
        let delta = recv_binary(peer, WAIT).await.expect("peer receives delta");
        let replica = Replica::new();
        replica.apply(&delta);
        assert_eq!(replica.content(), "from a");
    }
    assert!(recv_binary(&mut a, QUIET).await.is_none());

    server.shutdown().await;
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let server = TestServer::start().await;
    let mut a1 = server.connect("/A").await;
    let mut a2 = server.connect("/A").await;
    let mut b = server.connect("/B").await;
    server.wait_for_subscribers("A", 2).await;
    server.wait_for_subscribers("B", 1).await;

    send_binary(&mut a1, Replica::new().insert(0, "a only")).await;

    assert!(recv_binary(&mut a2, WAIT).await.is_some());
    assert!(recv_binary(&mut b, QUIET).await.is_none());

    let b_session = server
        .server
        .registry()
        .get(&SessionId::from("B"))
        .await
        .unwrap();
    assert!(b_session.current_state_as_delta().await.is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_all_subscribers_leaving() {
    let server = TestServer::start().await;

    let mut writer = server.connect("/notes").await;
    let doc = Replica::new();
    send_binary(&mut writer, doc.insert(0, "first ")).await;
    send_binary(&mut writer, doc.insert(6, "second")).await;
    server.wait_for_subscribers("notes", 1).await;
    let _ = writer.close(None).await;
    drop(writer);
    server.wait_for_subscribers("notes", 0).await;

    let mut reader = server.connect("/notes").await;
    let initial = recv_binary(&mut reader, WAIT).await.expect("state retained");
    let replica = Replica::new();
    replica.apply(&initial);
    assert_eq!(replica.content(), "first second");
    assert_eq!(server.server.registry().session_count().await, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_root_path_uses_default_session() {
    let server = TestServer::start().await;
    let _ws = server.connect("/").await;

    server.wait_for_subscribers("default", 1).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_text_frame_discarded_connection_stays_open() {
    let server = TestServer::start().await;
    let mut sender = server.connect("/doc").await;
    let mut peer = server.connect("/doc").await;
    server.wait_for_subscribers("doc", 2).await;

    sender
        .send(Message::Text("not a delta".to_string().into()))
        .await
        .unwrap();
    assert!(recv_binary(&mut peer, QUIET).await.is_none());

    send_binary(&mut sender, Replica::new().insert(0, "still open")).await;
    assert!(recv_binary(&mut peer, WAIT).await.is_some());
    assert_eq!(server.server.stats().rejected_frames, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_delta_does_not_close_connection() {
    let server = TestServer::start().await;
    let mut sender = server.connect("/doc").await;
    let mut peer = server.connect("/doc").await;
    server.wait_for_subscribers("doc", 2).await;

    send_binary(&mut sender, vec![1, 2, 3]).await;
    assert!(recv_binary(&mut peer, QUIET).await.is_none());

    send_binary(&mut sender, Replica::new().insert(0, "recovered")).await;
    let delta = recv_binary(&mut peer, WAIT).await.expect("connection still relays");
    let replica = Replica::new();
    replica.apply(&delta);
    assert_eq!(replica.content(), "recovered");
    assert_eq!(server.server.stats().merge_failures, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_invalid_utf8_delta_rejected_and_relay_continues() {
    let server = TestServer::start().await;
    let mut sender = server.connect("/doc").await;
    let mut peer = server.connect("/doc").await;
    server.wait_for_subscribers("doc", 2).await;

    let mut corrupted = Replica::new().insert(0, "hello world");
    let at = corrupted
        .windows(11)
        .position(|window| window == b"hello world")
        .unwrap();
    corrupted[at] = 0xFF;
    corrupted[at + 1] = 0xFF;

    send_binary(&mut sender, corrupted).await;
    assert!(recv_binary(&mut peer, QUIET).await.is_none());

    let session = server
        .server
        .registry()
        .get(&SessionId::from("doc"))
        .await
        .unwrap();
    assert!(session.current_state_as_delta().await.is_empty());

    send_binary(&mut sender, Replica::new().insert(0, "valid")).await;
    let delta = recv_binary(&mut peer, WAIT).await.expect("relay still running");
    let replica = Replica::new();
    replica.apply(&delta);
    assert_eq!(replica.content(), "valid");
    assert_eq!(server.server.stats().merge_failures, 1);
    assert_eq!(session.subscriber_count().await, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = RelayConfig {
        heartbeat_interval: Duration::from_millis(100),
        idle_timeout: Duration::from_millis(300),
        ..RelayConfig::default()
    };
    let server = TestServer::start_with(config).await;
    let mut idle = server.connect("/idle").await;
    server.wait_for_subscribers("idle", 1).await;

    // Not reading means pings go unanswered.
    sleep(Duration::from_millis(800)).await;
    server.wait_for_subscribers("idle", 0).await;

    let closed = timeout(WAIT, async {
        loop {
            match idle.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server should close the idle connection");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = TestServer::start().await;
    let mut ws = server.connect("/doc").await;
    server.wait_for_subscribers("doc", 1).await;
    assert_eq!(server.server.stats().active_connections, 1);

    server.shutdown().await;

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "shutdown should close open connections");
}
