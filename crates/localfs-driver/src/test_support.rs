use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::Notify, task::JoinHandle};

#[derive(Default)]
struct Recorded {
    commands: Vec<Value>,
    uploads: Vec<String>,
    agent_commands: Vec<String>,
}

struct FakeState {
    id: Mutex<String>,
    recorded: Mutex<Recorded>,
    info_hits: AtomicUsize,
    stream_sent: AtomicUsize,
    stream_close_after: Mutex<Option<usize>>,
    stream_closed: AtomicBool,
    stream_closed_notify: Notify,
}

/// In-process stand-in for a launcher control endpoint (and an agent's).
pub struct FakeEndpoint {
    addr: SocketAddr,
    state: Arc<FakeState>,
    task: JoinHandle<()>,
}

impl Drop for FakeEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeEndpoint {
    pub async fn start(id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener, id)
    }

    fn serve(listener: TcpListener, id: &str) -> Self {
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(FakeState {
            id: Mutex::new(id.to_string()),
            recorded: Mutex::new(Recorded::default()),
            info_hits: AtomicUsize::new(0),
            stream_sent: AtomicUsize::new(0),
            stream_close_after: Mutex::new(None),
            stream_closed: AtomicBool::new(false),
            stream_closed_notify: Notify::new(),
        });

        let app = Router::new()
            .route("/flowforge/info", get(info))
            .route("/flowforge/command", post(command))
            .route("/flowforge/logs", get(logs))
            .route("/flowforge/resources", get(resources))
            .route("/flowforge/files/_/", post(create_root))
            .route(
                "/flowforge/files/_/*path",
                get(list_file)
                    .put(update_file)
                    .post(create_file)
                    .delete(delete_file),
            )
            .route("/healthz", get(healthz))
            .route("/api/v1/status", get(agent_status))
            .route("/api/v1/commands/:cmd", post(agent_command))
            .with_state(state.clone());

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state, task }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn set_id(&self, id: &str) {
        *self.state.id.lock().unwrap() = id.to_string();
    }

    pub fn close_stream_after(&self, n: usize) {
        *self.state.stream_close_after.lock().unwrap() = Some(n);
    }

    pub fn commands(&self) -> Vec<Value> {
        self.state.recorded.lock().unwrap().commands.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().uploads.clone()
    }

    pub fn agent_commands(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().agent_commands.clone()
    }

    pub fn info_hits(&self) -> usize {
        self.state.info_hits.load(Ordering::SeqCst)
    }

    pub fn stream_sent(&self) -> usize {
        self.state.stream_sent.load(Ordering::SeqCst)
    }

    /// Resolves once the server side of the resource stream has ended.
    pub async fn wait_stream_closed(&self, timeout: Duration) -> bool {
        let notified = self.state.stream_closed_notify.notified();
        if self.state.stream_closed.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
            || self.state.stream_closed.load(Ordering::SeqCst)
    }

    /// A port nothing is listening on (best effort).
    pub fn unused_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    /// A port below which `port + 1000` is free, for use as an instance port.
    pub fn unused_instance_port() -> u16 {
        loop {
            let control = Self::unused_port();
            if control > 2000 {
                return control - 1000;
            }
        }
    }
}

/// Accepts connections and never answers, to exercise probe timeouts.
pub struct SilentEndpoint {
    task: JoinHandle<()>,
}

impl Drop for SilentEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl SilentEndpoint {
    pub async fn start_on(port: u16) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        Self { task }
    }
}

async fn info(State(s): State<Arc<FakeState>>) -> Json<Value> {
    s.info_hits.fetch_add(1, Ordering::SeqCst);
    let id = s.id.lock().unwrap().clone();
    Json(json!({ "id": id, "state": "running" }))
}

async fn command(State(s): State<Arc<FakeState>>, Json(body): Json<Value>) -> StatusCode {
    s.recorded.lock().unwrap().commands.push(body);
    StatusCode::OK
}

async fn logs() -> Json<Value> {
    Json(json!([{ "ts": 1, "level": "info", "msg": "hello" }]))
}

async fn resources(State(s): State<Arc<FakeState>>, ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| stream_resources(socket, s)),
        None => Json(json!([{ "ts": 1, "cpu": 2.5, "ps": 1024 }])).into_response(),
    }
}

async fn stream_resources(mut socket: WebSocket, s: Arc<FakeState>) {
    let mut tick = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
            _ = tick.tick() => {
                let limit = *s.stream_close_after.lock().unwrap();
                let n = s.stream_sent.load(Ordering::SeqCst);
                if limit.is_some_and(|l| n >= l) {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                let msg = json!({ "ts": n, "cpu": 1.0 }).to_string();
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
                s.stream_sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    s.stream_closed.store(true, Ordering::SeqCst);
    s.stream_closed_notify.notify_waiters();
}

async fn list_file(Path(path): Path<String>) -> Json<Value> {
    Json(json!({ "path": path, "type": "file" }))
}

async fn update_file(Path(_path): Path<String>, Json(_update): Json<Value>) -> Json<Value> {
    Json(json!({}))
}

async fn create_root(Json(_body): Json<Value>) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, Json(json!({})))
}

async fn create_file(
    State(s): State<Arc<FakeState>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    _body: Bytes,
) -> (StatusCode, Json<Value>) {
    let octet = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/octet-stream"));
    if octet {
        s.recorded.lock().unwrap().uploads.push(path);
    }
    (StatusCode::CREATED, Json(json!({})))
}

async fn delete_file(Path(path): Path<String>) -> StatusCode {
    if path.starts_with("missing") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn healthz(State(s): State<Arc<FakeState>>) -> Json<Value> {
    s.info_hits.fetch_add(1, Ordering::SeqCst);
    let id = s.id.lock().unwrap().clone();
    Json(json!({ "status": "ok", "id": id }))
}

async fn agent_status(State(s): State<Arc<FakeState>>) -> Json<Value> {
    let id = s.id.lock().unwrap().clone();
    Json(json!({ "id": id, "state": "running" }))
}

async fn agent_command(State(s): State<Arc<FakeState>>, Path(cmd): Path<String>) -> StatusCode {
    s.recorded.lock().unwrap().agent_commands.push(cmd);
    StatusCode::OK
}

/// Writes a launcher script under `<dir>/node_modules/<rel>` that sleeps, so
/// `/bin/sh` can stand in for `node`.
#[cfg(unix)]
pub fn install_fake_launcher(dir: &std::path::Path, rel: &str) -> std::path::PathBuf {
    let modules = dir.join("node_modules");
    let script = modules.join(rel);
    std::fs::create_dir_all(script.parent().unwrap()).unwrap();
    std::fs::write(&script, "echo launcher \"$@\"\nexec sleep 30\n").unwrap();
    modules
}
