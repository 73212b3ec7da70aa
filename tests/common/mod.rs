#![allow(dead_code)]
use async_trait::async_trait;
use chunk_relay::chunker::TokenEncoding;
use chunk_relay::llm::{ApiError, CompletionBackend, CompletionRequest};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// One token per whitespace-separated word; decoding joins words with spaces.
pub struct WordEncoding {
    vocab: Mutex<Vec<String>>,
}

impl WordEncoding {
    pub fn new() -> Self {
        Self { vocab: Mutex::new(Vec::new()) }
    }
}

impl TokenEncoding for WordEncoding {
    fn encode(&self, text: &str) -> Vec<u32> {
        let mut vocab = self.vocab.lock().unwrap();
        text.split_whitespace()
            .map(|w| match vocab.iter().position(|v| v == w) {
                Some(i) => i as u32,
                None => {
                    vocab.push(w.to_string());
                    (vocab.len() - 1) as u32
                }
            })
            .collect()
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, String> {
        let vocab = self.vocab.lock().unwrap();
        tokens
            .iter()
            .map(|t| vocab.get(*t as usize).cloned().ok_or_else(|| format!("unknown token {t}")))
            .collect::<Result<Vec<_>, _>>()
            .map(|words| words.join(" "))
    }

    fn decode_lossy(&self, tokens: &[u32]) -> String {
        let vocab = self.vocab.lock().unwrap();
        tokens
            .iter()
            .map(|t| vocab.get(*t as usize).map_or("\u{FFFD}", String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a scripted backend does on a given call for a given chunk.
pub type Script = dyn Fn(&str, usize) -> Result<String, ApiError> + Send + Sync;

/// In-memory backend that records every call and answers from a script.
pub struct ScriptedBackend {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(script: impl Fn(&str, usize) -> Result<String, ApiError> + Send + Sync + 'static) -> Self {
        Self { script: Box::new(script), calls: Mutex::new(Vec::new()) }
    }

    /// Answers `"done: <chunk>"` for every chunk.
    pub fn echo() -> Self {
        Self::new(|chunk, _| Ok(format!("done: {chunk}")))
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, chunk: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.as_str() == chunk).count()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, req: &CompletionRequest) -> Result<String, ApiError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let attempt = calls.iter().filter(|c| **c == req.chunk).count();
            calls.push(req.chunk.clone());
            attempt
        };
        tokio::task::yield_now().await;
        (self.script)(&req.chunk, attempt)
    }
}

/// Minimal HTTP/1.1 server standing in for the chat-completions endpoint.
///
/// The handler sees the request body and the 0-based request number and
/// returns a status code and a body. Every response closes the connection.
pub struct StubServer {
    pub base: String,
    hits: Arc<AtomicUsize>,
}

impl StubServer {
    pub fn start(handler: impl Fn(&str, usize) -> (u16, String) + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(handler);
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let handler = Arc::clone(&handler);
                let counter = Arc::clone(&counter);
                thread::spawn(move || serve_one(stream, handler.as_ref(), &counter));
            }
        });
        Self { base: format!("http://{addr}/v1"), hits }
    }

    /// Replies with a chat completion whose content echoes the user message.
    pub fn echo() -> Self {
        Self::start(|body, _| (200, completion_json(&format!("done: {}", user_content(body)))))
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn serve_one(stream: TcpStream, handler: &(dyn Fn(&str, usize) -> (u16, String) + Send + Sync), hits: &AtomicUsize) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut content_length = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }
    let mut body = vec![0u8; content_length];
    if reader.read_exact(&mut body).is_err() {
        return;
    }
    let n = hits.fetch_add(1, Ordering::SeqCst);
    let (status, payload) = handler(&String::from_utf8_lossy(&body), n);
    let reason = match status {
        200 => "OK",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let mut stream = stream;
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.flush();
}

pub fn completion_json(content: &str) -> String {
    serde_json::json!({
        "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

/// Content of the user message in a chat-completions request body.
pub fn user_content(body: &str) -> String {
    let v: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    v["messages"][1]["content"].as_str().unwrap_or_default().to_string()
}
