//! HTTP server for ledger-lens
//! Plain tokio TCP with minimal HTTP/1.1 handling

use ledger_lens::llm::{ChatMessage, ConversationHistory};
use ledger_lens::{AppConfig, AskRequest, BusinessId, Pipeline, GENERIC_FAILURE_MESSAGE};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_REQUEST_BYTES: usize = 1024 * 1024;
/// Longest wait for the next chunk of a request before the connection is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct AskBody {
    business_id: String,
    question: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    let pipeline = Arc::new(Pipeline::from_config(&config, true).await?);
    let history_messages = config.history_messages;

    let listener = TcpListener::bind(&config.server_addr).await?;
    info!("Server listening on {}", config.server_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from {}", addr);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &pipeline, history_messages).await {
                warn!("Connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    pipeline: &Pipeline,
    history_messages: usize,
) -> std::io::Result<()> {
    let response = match read_request(&mut stream, READ_TIMEOUT).await {
        Ok(Some((head, body))) => handle_request(&head, &body, pipeline, history_messages).await,
        Ok(None) => create_response(400, "Bad Request", r#"{"error":"malformed request"}"#),
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
            create_response(408, "Request Timeout", r#"{"error":"request timed out"}"#)
        }
        Err(e) => return Err(e),
    };
    stream.write_all(response.as_bytes()).await
}

/// Read the header block and a `Content-Length` body. Each read waits at most
/// `read_timeout`, so a stalled client cannot hold the connection task open.
async fn read_request<S>(stream: &mut S, read_timeout: Duration) -> std::io::Result<Option<(String, String)>>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
        let n = read_chunk(stream, &mut chunk, read_timeout).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let content_length = parse_headers(&head)
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if content_length > MAX_REQUEST_BYTES {
        return Ok(None);
    }

    let body_start = header_end + 4;
    while buffer.len() < body_start + content_length {
        let n = read_chunk(stream, &mut chunk, read_timeout).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buffer[body_start..body_start + content_length]).to_string();
    Ok(Some((head, body)))
}

async fn read_chunk<S>(stream: &mut S, chunk: &mut [u8], read_timeout: Duration) -> std::io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    tokio::time::timeout(read_timeout, stream.read(chunk))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out reading request"))?
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_headers(head: &str) -> HashMap<String, String> {
    head.lines()
        .skip(1)
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
        .collect()
}

async fn handle_request(head: &str, body: &str, pipeline: &Pipeline, history_messages: usize) -> String {
    let Some((method, path)) = parse_request_line(head) else {
        return create_response(400, "Bad Request", r#"{"error":"malformed request line"}"#);
    };

    match (method.as_str(), path.as_str()) {
        ("GET", "/api/health") => create_response(200, "OK", r#"{"status":"ok"}"#),
        ("OPTIONS", _) => create_response(204, "No Content", ""),
        ("POST", "/api/ask") => {
            let request = match parse_ask_body(body, history_messages) {
                Ok(request) => request,
                Err(message) => {
                    let body = serde_json::json!({ "error": message }).to_string();
                    return create_response(400, "Bad Request", &body);
                }
            };
            match pipeline.ask(&request).await {
                Ok(answer) => create_response(200, "OK", &serde_json::json!({ "answer": answer }).to_string()),
                Err(failure) => {
                    error!("{}", failure);
                    let body = serde_json::json!({ "answer": GENERIC_FAILURE_MESSAGE }).to_string();
                    create_response(500, "Internal Server Error", &body)
                }
            }
        }
        _ => create_response(404, "Not Found", r#"{"error":"not found"}"#),
    }
}

/// Method and normalized path (query string and trailing slash removed).
fn parse_request_line(head: &str) -> Option<(String, String)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let raw_path = parts.next()?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).trim_end_matches('/');
    let path = if path.is_empty() { "/" } else { path };
    Some((method, path.to_string()))
}

fn parse_ask_body(body: &str, history_messages: usize) -> Result<AskRequest, String> {
    let parsed: AskBody = serde_json::from_str(body).map_err(|e| format!("invalid JSON body: {}", e))?;
    let business_id = BusinessId::parse(&parsed.business_id).map_err(|e| e.to_string())?;
    if parsed.question.trim().is_empty() {
        return Err("question is required".to_string());
    }
    let history = ConversationHistory::from_messages(parsed.history, history_messages);
    Ok(AskRequest::new(business_id, parsed.question).with_history(history))
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
