//! Scripted HTTP server shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One scripted reply. The last reply repeats once the script runs out.
#[derive(Clone)]
pub enum Reply {
    /// Write the bytes and close the connection.
    Full(String),
    /// Write the bytes, then hang without closing.
    Stall(String),
}

pub struct MockServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (task_hits, task_requests) = (hits.clone(), requests.clone());
        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (head, body) = read_request(&mut socket).await;
                let n = task_hits.fetch_add(1, Ordering::SeqCst);
                let request_line = head.lines().next().unwrap_or_default().to_string();
                task_requests.lock().unwrap().push((request_line, body));

                let Some(reply) = replies.get(n).or(replies.last()).cloned() else {
                    return;
                };
                match reply {
                    Reply::Full(bytes) => {
                        let _ = socket.write_all(bytes.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    }
                    Reply::Stall(bytes) => {
                        let _ = socket.write_all(bytes.as_bytes()).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                }
            }
        });

        Self {
            url: format!("http://127.0.0.1:{port}"),
            hits,
            requests,
            task,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Request lines (`POST /path HTTP/1.1`) in arrival order.
    pub fn request_lines(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|(_, b)| b.clone()).collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(socket: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let len = head
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while buf.len() < pos + 4 + len {
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let body = String::from_utf8_lossy(&buf[pos + 4..]).to_string();
            return (head, body);
        }
        match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => return (String::from_utf8_lossy(&buf).to_string(), String::new()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

pub fn json_reply(status: u16, body: &str) -> Reply {
    Reply::Full(format!(
        "HTTP/1.1 {status} Mock\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    ))
}

pub const SSE_HEADERS: &str = "HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

pub fn sse_reply(events: &[String]) -> Reply {
    Reply::Full(format!("{SSE_HEADERS}{}", events.concat()))
}

pub fn sse_event(data: &serde_json::Value) -> String {
    format!("data: {data}\n\n")
}

/// Event stream whose declared length is never reached: the connection
/// closes mid-body after `events`.
pub fn cut_sse_reply(events: &[String]) -> Reply {
    let body = events.concat();
    Reply::Full(format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/event-stream\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len() + 64
    ))
}

/// Non-streaming Gemini body carrying `text` as the answer.
pub fn gemini_body(text: &str) -> String {
    serde_json::json!({"candidates": [{"content": {"parts": [{"text": text}], "role": "model"}}]})
        .to_string()
}

pub fn gemini_chunk(text: &str, thought: bool) -> String {
    sse_event(&serde_json::json!({
        "candidates": [{"content": {"parts": [{"text": text, "thought": thought}], "role": "model"}}]
    }))
}

/// Error object sent inside a Gemini event stream.
pub fn gemini_error_chunk(code: u16, message: &str) -> String {
    sse_event(&serde_json::json!({
        "error": {"code": code, "message": message, "status": "UNAVAILABLE"}
    }))
}

/// Non-streaming chat completion body carrying `text` as the answer.
pub fn openai_body(text: &str) -> String {
    serde_json::json!({"choices": [{"message": {"role": "assistant", "content": text}}]})
        .to_string()
}

pub fn openai_chunk(text: &str) -> String {
    sse_event(&serde_json::json!({"choices": [{"delta": {"content": text}}]}))
}

pub fn openai_reasoning_chunk(text: &str) -> String {
    sse_event(&serde_json::json!({"choices": [{"delta": {"reasoning_content": text}}]}))
}

pub fn openai_error_chunk(message: &str) -> String {
    sse_event(&serde_json::json!({"error": {"message": message}}))
}

pub const OPENAI_DONE: &str = "data: [DONE]\n\n";

/// URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}
