//! Minimal HTTP/1.1 server with HEAD and Range GET support for integration
//! tests.
//!
//! Serves a single static body and can be configured to block HEAD, ignore
//! ranges, answer the first N GETs with 503, delay each GET, and serve an
//! ETag. Every GET's Range header is logged so tests can assert which bytes
//! were actually requested.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct RangeServerOptions {
    /// If true, HEAD returns 405 (simulates servers that block HEAD).
    pub block_head: bool,
    /// If true, GET ignores Range and always returns 200 with the full body.
    pub ignore_ranges: bool,
    /// ETag value served on HEAD and GET (without quotes).
    pub etag: Option<String>,
    /// Answer the first N GETs with 503 Service Unavailable.
    pub fail_first_gets: usize,
    /// Sleep this long before answering each GET.
    pub get_delay: Option<Duration>,
}

/// Handle to a running test server.
pub struct TestServer {
    pub url: String,
    gets: Arc<AtomicUsize>,
    range_log: Arc<Mutex<Vec<Option<(u64, u64)>>>>,
}

impl TestServer {
    /// Number of GET requests served so far (including injected failures).
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Range headers of all GETs, in order; `None` for unranged requests.
    pub fn ranges_requested(&self) -> Vec<Option<(u64, u64)>> {
        self.range_log.lock().unwrap().clone()
    }
}

pub fn start(body: Vec<u8>) -> TestServer {
    start_with_options(body, RangeServerOptions::default())
}

/// Starts a server in a background thread serving `body`. The server runs
/// until the process exits.
pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let gets = Arc::new(AtomicUsize::new(0));
    let range_log: Arc<Mutex<Vec<Option<(u64, u64)>>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_left = Arc::new(AtomicUsize::new(opts.fail_first_gets));

    let server = TestServer {
        url: format!("http://127.0.0.1:{}/file.bin", port),
        gets: Arc::clone(&gets),
        range_log: Arc::clone(&range_log),
    };

    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let gets = Arc::clone(&gets);
            let range_log = Arc::clone(&range_log);
            let failures_left = Arc::clone(&failures_left);
            thread::spawn(move || handle(stream, &body, &opts, &gets, &range_log, &failures_left));
        }
    });

    server
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    gets: &AtomicUsize,
    range_log: &Mutex<Vec<Option<(u64, u64)>>>,
    failures_left: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    let total = body.len() as u64;

    let etag_header = opts
        .etag
        .as_ref()
        .map(|e| format!("ETag: \"{}\"\r\n", e))
        .unwrap_or_default();
    let accept_ranges = if opts.ignore_ranges {
        ""
    } else {
        "Accept-Ranges: bytes\r\n"
    };

    if method.eq_ignore_ascii_case("HEAD") {
        if opts.block_head {
            let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
            return;
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{}{}\r\n",
            total, accept_ranges, etag_header
        );
        let _ = stream.write_all(response.as_bytes());
        return;
    }

    if method.eq_ignore_ascii_case("GET") {
        gets.fetch_add(1, Ordering::SeqCst);
        range_log.lock().unwrap().push(range);

        if let Some(delay) = opts.get_delay {
            thread::sleep(delay);
        }

        if failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            let _ = stream
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n");
            return;
        }

        let (status, content_range, slice) = match range.filter(|_| !opts.ignore_ranges) {
            Some((start, end_incl)) => {
                let end_incl = end_incl.min(total.saturating_sub(1));
                if start > end_incl || start >= total {
                    let _ = stream.write_all(
                        format!(
                            "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                            total
                        )
                        .as_bytes(),
                    );
                    return;
                }
                let slice = &body[start as usize..=end_incl as usize];
                (
                    "206 Partial Content",
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, end_incl, total),
                    slice,
                )
            }
            None => ("200 OK", String::new(), body),
        };
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}{}\r\n",
            status,
            slice.len(),
            content_range,
            accept_ranges,
            etag_header
        );
        let _ = stream.write_all(response.as_bytes());
        let _ = stream.write_all(slice);
        return;
    }

    let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\n\r\n");
}

/// Returns (method, optional (start, end_inclusive) from `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(spec) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = spec.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end_incl = b.trim().parse::<u64>().unwrap_or(u64::MAX);
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}
