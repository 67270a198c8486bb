//! Integration tests: the JSON command channel over a real TCP connection
//! on localhost, with a scripted pipeline and peers behind it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::assert_ok;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use projector_core::{
    CommandHandler, KeyframeRequest, MediaPipeline, MediaTrack, OpenedPeer, PeerConnector,
    PeerEvent, PeerEvents, PeerLink, PeerState, PipelineError, PipelineFactory, Pump,
    SessionConfig, SessionDescription, SetupError, SignalingError, StreamController,
    TransportSink,
};
use projector_streamer::service::CommandService;

// ── Doubles ──────────────────────────────────────────────────────

struct TickingFactory {
    teardowns: Arc<AtomicUsize>,
}

impl PipelineFactory for TickingFactory {
    fn open(
        &self,
        sink: TransportSink,
        _keyframes: KeyframeRequest,
    ) -> Result<Box<dyn MediaPipeline>, SetupError> {
        Ok(Box::new(TickingPipeline {
            sink,
            teardowns: Arc::clone(&self.teardowns),
        }))
    }
}

struct TickingPipeline {
    sink: TransportSink,
    teardowns: Arc<AtomicUsize>,
}

impl MediaPipeline for TickingPipeline {
    fn pump(&mut self) -> Result<Pump, PipelineError> {
        let mut packet = vec![0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(b"tick");
        self.sink.handle_write(&packet);
        std::thread::sleep(Duration::from_millis(2));
        Ok(Pump::Delivered)
    }
}

impl Drop for TickingPipeline {
    fn drop(&mut self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct NullTrack;

#[async_trait]
impl MediaTrack for NullTrack {
    async fn write_packet(&self, _packet: &[u8]) -> Result<(), SignalingError> {
        Ok(())
    }
}

struct InstantLink {
    events: PeerEvents,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl PeerLink for InstantLink {
    async fn start_negotiation(&self) -> Result<(), SignalingError> {
        let offer = SessionDescription::new("offer", "v=0\r\ns=projector\r\n");
        self.events.emit(PeerEvent::GatheringComplete(offer));
        Ok(())
    }

    async fn apply_answer(&self, _answer: &SessionDescription) -> Result<(), SignalingError> {
        self.events.emit(PeerEvent::StateChanged(PeerState::Connected));
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct InstantConnector {
    closes: Arc<AtomicUsize>,
    opened: Mutex<usize>,
}

#[async_trait]
impl PeerConnector for InstantConnector {
    async fn open(&self, events: PeerEvents) -> Result<OpenedPeer, SignalingError> {
        *self.opened.lock().unwrap() += 1;
        Ok(OpenedPeer {
            link: Arc::new(InstantLink {
                events,
                closes: Arc::clone(&self.closes),
            }),
            track: Arc::new(NullTrack),
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────

struct Harness {
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    controller: Arc<StreamController>,
    connector: Arc<InstantConnector>,
    teardowns: Arc<AtomicUsize>,
    server: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn harness() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let teardowns = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(InstantConnector::default());

    let controller = Arc::new(StreamController::with_shutdown(
        Arc::new(TickingFactory {
            teardowns: Arc::clone(&teardowns),
        }),
        connector.clone(),
        SessionConfig {
            idle_backoff: Duration::from_millis(5),
            ..SessionConfig::default()
        },
        shutdown.clone(),
    ));
    let service = CommandService::new(CommandHandler::new(Arc::clone(&controller)), shutdown.clone());
    let server = tokio::spawn(async move { service.serve(listener).await });

    Harness {
        addr,
        shutdown,
        controller,
        connector,
        teardowns,
        server,
    }
}

async fn connect(addr: std::net::SocketAddr) -> Framed<TcpStream, LinesCodec> {
    Framed::new(TcpStream::connect(addr).await.unwrap(), LinesCodec::new())
}

async fn request(conn: &mut Framed<TcpStream, LinesCodec>, line: &str) -> Value {
    conn.send(line.to_string()).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), conn.next())
        .await
        .expect("timeout")
        .expect("connection closed")
        .unwrap();
    serde_json::from_str(&reply).unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn test_ping_over_tcp() {
    let h = harness().await;
    let mut conn = connect(h.addr).await;
    assert_eq!(request(&mut conn, r#"{"get":"ping"}"#).await, json!({ "pong": true }));
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_full_session_over_tcp() {
    let h = harness().await;
    let mut conn = connect(h.addr).await;

    assert_eq!(
        request(&mut conn, r#"{"get":"stream"}"#).await,
        json!({ "isStreaming": false })
    );
    assert_eq!(
        request(&mut conn, r#"{"stream":true}"#).await,
        json!({ "success": true })
    );

    let status = request(&mut conn, r#"{"get":"stream"}"#).await;
    assert_eq!(status["isStreaming"], json!(true));
    assert_eq!(status["offer"]["type"], json!("offer"));
    assert_eq!(status["offer"]["sdp"], json!("v=0\r\ns=projector\r\n"));

    let answer = json!({ "set": "answer", "answer": { "type": "answer", "sdp": "v=0" } });
    assert_eq!(
        request(&mut conn, &answer.to_string()).await,
        json!({ "success": true })
    );

    assert_eq!(
        request(&mut conn, r#"{"stream":false}"#).await,
        json!({ "success": true })
    );
    assert_eq!(h.teardowns.load(Ordering::SeqCst), 1);

    let again = request(&mut conn, r#"{"stream":false}"#).await;
    assert_eq!(again["error"], json!(true));

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_bad_lines_keep_connection_open() {
    let h = harness().await;
    let mut conn = connect(h.addr).await;

    let reply = request(&mut conn, "this is not json").await;
    assert_eq!(reply["error"], json!(true));
    let reply = request(&mut conn, r#"{"get":"weather"}"#).await;
    assert_eq!(reply["error"], json!(true));

    // Blank lines produce no reply.
    conn.send(String::new()).await.unwrap();
    assert_eq!(request(&mut conn, r#"{"get":"ping"}"#).await, json!({ "pong": true }));

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_disconnect_removes_viewer() {
    let h = harness().await;
    let mut control = connect(h.addr).await;
    request(&mut control, r#"{"stream":true}"#).await;

    let mut viewer = connect(h.addr).await;
    request(&mut viewer, r#"{"get":"stream"}"#).await;
    let session = h.controller.running_session().await.unwrap();
    assert_eq!(session.registry().len(), 1);

    drop(viewer);
    for _ in 0..200 {
        if session.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(session.registry().is_empty());
    assert_eq!(*h.connector.opened.lock().unwrap(), 1);

    request(&mut control, r#"{"stream":false}"#).await;
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_stops_accepting_and_tears_down() {
    let h = harness().await;
    let mut conn = connect(h.addr).await;
    request(&mut conn, r#"{"stream":true}"#).await;

    h.shutdown.cancel();
    let served = tokio::time::timeout(Duration::from_secs(5), h.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert_ok!(served);

    h.controller.shutdown().await;
    assert_eq!(h.teardowns.load(Ordering::SeqCst), 1);
    assert!(!h.controller.is_streaming().await);
    assert_eq!(h.connector.closes.load(Ordering::SeqCst), 0);
}
