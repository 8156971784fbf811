//! Minimal HTTP/1.1 message handler.
//!
//! A request ends at the first blank line (`\r\n\r\n`); bodies are not
//! supported. Hello mode answers every request with a fixed body. File
//! mode serves `GET` paths from a directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sockpool_core::handler::{BoxError, CustomState, MessageHandler, MessageResponse};

const HEADER_END: &[u8] = b"\r\n\r\n";
const HELLO_BODY: &[u8] = b"Hello from sockpool!\n";

pub struct HttpHandler {
    serve_dir: Option<PathBuf>,
    hello: Vec<u8>,
    not_found: Vec<u8>,
}

impl HttpHandler {
    pub fn hello() -> Self {
        Self {
            serve_dir: None,
            hello: make_response("200 OK", "text/plain", HELLO_BODY),
            not_found: make_response("404 Not Found", "text/plain", b"404 Not Found\n"),
        }
    }

    pub fn files(dir: PathBuf) -> Self {
        Self {
            serve_dir: Some(dir),
            ..Self::hello()
        }
    }

    fn serve_file(&self, base: &Path, request: &[u8]) -> Vec<u8> {
        let path = parse_path(request).unwrap_or("/");
        let path = if path == "/" { "/index.html" } else { path };
        if path.contains("..") {
            return self.not_found.clone();
        }

        let full = base.join(path.trim_start_matches('/'));
        match std::fs::read(&full) {
            Ok(body) => make_response("200 OK", guess_content_type(path), &body),
            Err(_) => self.not_found.clone(),
        }
    }
}

impl MessageHandler for HttpHandler {
    type State = ();

    fn is_message_complete(&self, message: &[u8], new_len: usize, _state: &mut ()) -> bool {
        // Only the tail can hold a new terminator: the fresh bytes plus
        // three bytes of overlap with what came before.
        let from = message.len().saturating_sub(new_len + HEADER_END.len() - 1);
        message[from..].windows(HEADER_END.len()).any(|w| w == HEADER_END)
    }

    fn handle_message(
        &self,
        _remote: SocketAddr,
        message: &[u8],
        _custom: Option<&CustomState>,
        _state: &mut (),
    ) -> Result<MessageResponse, BoxError> {
        let response = match &self.serve_dir {
            None => self.hello.clone(),
            Some(base) => self.serve_file(base, message),
        };
        if wants_close(message) {
            Ok(MessageResponse::reply_and_close(response))
        } else {
            Ok(MessageResponse::reply(response))
        }
    }
}

fn make_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: keep-alive\r\n\
         Server: sockpool-httpd\r\n\
         \r\n",
        status,
        content_type,
        body.len()
    );
    let mut resp = header.into_bytes();
    resp.extend_from_slice(body);
    resp
}

fn guess_content_type(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Extract the path from "GET /path HTTP/1.1\r\n..."
fn parse_path(request: &[u8]) -> Option<&str> {
    let rest = request.strip_prefix(b"GET ")?;
    let end = rest.iter().position(|&b| b == b' ')?;
    std::str::from_utf8(&rest[..end]).ok()
}

fn wants_close(request: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(request) else {
        return false;
    };
    text.lines().any(|line| {
        line.split_once(':').is_some_and(|(name, value)| {
            name.eq_ignore_ascii_case("connection") && value.trim().eq_ignore_ascii_case("close")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn test_message_complete_on_blank_line() {
        let h = HttpHandler::hello();
        let msg = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(h.is_message_complete(msg, msg.len(), &mut ()));
        assert!(!h.is_message_complete(&msg[..msg.len() - 1], msg.len() - 1, &mut ()));
        // Terminator split across two receives.
        assert!(h.is_message_complete(msg, 1, &mut ()));
    }

    #[test]
    fn test_hello_keeps_alive() {
        let h = HttpHandler::hello();
        let r = h
            .handle_message(remote(), b"GET / HTTP/1.1\r\n\r\n", None, &mut ())
            .unwrap();
        assert!(!r.disconnect_once_done);
        let body = r.to_send.unwrap();
        assert!(body.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(body.ends_with(HELLO_BODY));
    }

    #[test]
    fn test_connection_close_header() {
        let h = HttpHandler::hello();
        let r = h
            .handle_message(
                remote(),
                b"GET / HTTP/1.1\r\nConnection: Close\r\n\r\n",
                None,
                &mut (),
            )
            .unwrap();
        assert!(r.disconnect_once_done);
    }

    #[test]
    fn test_file_mode_rejects_traversal() {
        let h = HttpHandler::files(std::env::temp_dir());
        let r = h
            .handle_message(remote(), b"GET /../etc/passwd HTTP/1.1\r\n\r\n", None, &mut ())
            .unwrap();
        assert!(r.to_send.unwrap().starts_with(b"HTTP/1.1 404"));
    }

    #[test]
    fn test_parse_path_and_type() {
        assert_eq!(parse_path(b"GET /a/b.css HTTP/1.1\r\n"), Some("/a/b.css"));
        assert_eq!(parse_path(b"POST / HTTP/1.1\r\n"), None);
        assert_eq!(guess_content_type("/a/b.css"), "text/css");
        assert_eq!(guess_content_type("/noext"), "application/octet-stream");
    }
}
