#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Cursor, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use tweet_stream_ingest::core::config::Config;
use tweet_stream_ingest::core::errors::Result;
use tweet_stream_ingest::stream::connection::{RawResponse, StreamRequest, Transport};

/// One newline-terminated status object.
pub fn tweet_line(text: &str, screen_name: &str) -> String {
    serde_json::json!({
        "text": text,
        "user": {
            "screen_name": screen_name,
            "name": screen_name.to_uppercase(),
            "profile_image_url": format!("https://img.example/{screen_name}.png"),
        }
    })
    .to_string()
        + "\r\n"
}

pub fn tweet_lines(texts: &[&str]) -> String {
    texts.iter().map(|t| tweet_line(t, "tester")).collect()
}

/// Config pointing every path into `dir` and both endpoints at `base`.
pub fn test_config(dir: &Path, base: &str) -> Config {
    let mut config = Config::default();
    config.stream.sample_url = format!("{base}/1.1/statuses/sample.json?filter_level=low");
    config.stream.filter_url = format!("{base}/1.1/statuses/filter.json?filter_level=low&track=");
    config.stream.allow_insecure_http = true;
    config.stream.connect_timeout_ms = 2_000;
    config.stream.connection_max_age_ms = 0;
    config.ingest.read_timeout_ms = 500;
    config.ingest.max_run_ms = 5_000;
    config.persistence.workers = 2;
    config.paths.database = dir.join("tweets.sqlite3");
    config.paths.activity_log = dir.join("activity.jsonl");
    config
}

pub fn with_credentials(mut config: Config) -> Config {
    config.credentials.consumer_key = "ck".to_string();
    config.credentials.consumer_secret = "cs".to_string();
    config.credentials.access_token = "at".to_string();
    config.credentials.access_token_secret = "ats".to_string();
    config
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

// ──────────────────── in-memory transport ────────────────────

/// Body that yields nothing until dropped.
pub struct IdleBody;

impl Read for IdleBody {
    fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_millis(10));
        Err(io::ErrorKind::WouldBlock.into())
    }
}

/// Serves a canned body for any URL containing a fragment; anything else
/// gets a 200 that never produces data.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, u16, String)>>,
    pub opened: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn route(&self, fragment: &str, status: u16, body: impl Into<String>) {
        self.routes
            .lock()
            .push((fragment.to_string(), status, body.into()));
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: &StreamRequest) -> Result<RawResponse> {
        self.opened.lock().push(request.url.clone());
        let routes = self.routes.lock();
        let matched = routes
            .iter()
            .find(|(fragment, _, _)| request.url.contains(fragment.as_str()));
        Ok(match matched {
            Some((_, status, body)) => {
                RawResponse::new(*status, Box::new(Cursor::new(body.clone().into_bytes())))
            }
            None => RawResponse::new(200, Box::new(IdleBody)),
        })
    }
}

// ──────────────────── local HTTP server ────────────────────

/// What the server does with one accepted connection.
#[derive(Clone)]
pub enum Reply {
    /// Status line, body, then close.
    Close { status: u16, body: String },
    /// 200 with `body`, then hold the socket open until the client hangs up
    /// or the server stops.
    Hold { body: String },
}

/// A request as seen by the server.
#[derive(Debug, Clone)]
pub struct Seen {
    pub request_line: String,
    pub authorization: Option<String>,
}

/// Minimal HTTP/1.1 server answering each connection with the next scripted reply.
pub struct StreamServer {
    addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<Seen>>>,
    hung_up: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamServer {
    pub fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind local server");
        listener
            .set_nonblocking(true)
            .expect("nonblocking listener");
        let addr = listener.local_addr().expect("local addr");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hung_up = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let join = {
            let seen = Arc::clone(&seen);
            let hung_up = Arc::clone(&hung_up);
            let stop = Arc::clone(&stop);
            thread::spawn(move || serve(&listener, replies, &seen, &hung_up, &stop))
        };

        Self {
            addr,
            seen,
            hung_up,
            stop,
            join: Some(join),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    /// Held streams whose client closed the socket.
    pub fn hung_up(&self) -> usize {
        self.hung_up.load(Ordering::SeqCst)
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn serve(
    listener: &TcpListener,
    replies: Vec<Reply>,
    seen: &Mutex<Vec<Seen>>,
    hung_up: &Arc<AtomicUsize>,
    stop: &Arc<AtomicBool>,
) {
    let mut replies = replies.into_iter();
    let mut held = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                // Reachability probes connect and hang up without a request.
                let Some((stream, request)) = read_request(stream) else {
                    continue;
                };
                seen.lock().push(request);
                let Some(reply) = replies.next() else {
                    continue;
                };
                if let Some(stream) = respond(stream, reply) {
                    let hung_up = Arc::clone(hung_up);
                    let stop = Arc::clone(stop);
                    held.push(thread::spawn(move || watch_hangup(stream, &hung_up, &stop)));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(_) => break,
        }
    }
    for watcher in held {
        let _ = watcher.join();
    }
}

/// Hold `stream` open, counting it once the peer closes its end.
fn watch_hangup(mut stream: TcpStream, hung_up: &AtomicUsize, stop: &AtomicBool) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(50)));
    let mut buf = [0u8; 256];
    while !stop.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => {
                hung_up.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(_) => {
                hung_up.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    }
}

fn read_request(stream: TcpStream) -> Option<(TcpStream, Seen)> {
    stream.set_nonblocking(false).ok()?;
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .ok()?;
    let mut reader = BufReader::new(stream.try_clone().ok()?);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).ok()? == 0 {
        return None;
    }
    let mut authorization = None;
    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).ok()? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            let value = value.trim().to_string();
            if name.eq_ignore_ascii_case("authorization") {
                authorization = Some(value);
            } else if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;

    Some((
        stream,
        Seen {
            request_line: request_line.trim_end().to_string(),
            authorization,
        },
    ))
}

fn respond(mut stream: TcpStream, reply: Reply) -> Option<TcpStream> {
    let (status, body, hold) = match reply {
        Reply::Close { status, body } => (status, body, false),
        Reply::Hold { body } => (200, body, true),
    };
    let head = format!(
        "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n"
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body.as_bytes());
    let _ = stream.flush();
    hold.then_some(stream)
}
