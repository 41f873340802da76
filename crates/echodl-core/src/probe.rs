//! HTTP capability probe.
//!
//! Fetches response headers to learn the total size, whether the server
//! honors byte ranges, and the ETag/Last-Modified validators used for resume
//! safety. Tries HEAD first; servers that block HEAD (403/405) are re-probed
//! with `GET Range: bytes=0-0`, where a 206 answer proves range support and
//! the total size comes from `Content-Range`.

use anyhow::{Context, Result};
use std::str;
use std::time::Duration;

/// Key metadata needed to plan a download.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Total size in bytes, if the server reported one.
    pub total_size: Option<u64>,
    /// True if the server supports byte ranges (advertised or proven via 206).
    pub accept_ranges: bool,
    /// `ETag` value if present (resume validation).
    pub etag: Option<String>,
    /// `Last-Modified` value if present (resume validation).
    pub last_modified: Option<String>,
    /// `Content-Disposition` value if present (filename hint).
    pub content_disposition: Option<String>,
}

/// Probes `url` for size and range support.
///
/// Follows redirects. Runs on the current thread; call from `spawn_blocking`
/// in async code.
pub fn probe(url: &str, connect_timeout: Duration, timeout: Duration) -> Result<ProbeResult> {
    match head_probe(url, connect_timeout, timeout) {
        Ok(result) => Ok(result),
        Err(ProbeError::HeadBlocked(code)) => {
            tracing::debug!(code, url, "HEAD blocked, probing with ranged GET");
            ranged_get_probe(url, connect_timeout, timeout)
        }
        Err(ProbeError::Other(e)) => Err(e),
    }
}

enum ProbeError {
    /// HEAD answered 403/405; a ranged GET may still work.
    HeadBlocked(u32),
    Other(anyhow::Error),
}

fn head_probe(
    url: &str,
    connect_timeout: Duration,
    timeout: Duration,
) -> std::result::Result<ProbeResult, ProbeError> {
    let (code, headers) =
        head_request(url, connect_timeout, timeout).map_err(ProbeError::Other)?;
    if code == 403 || code == 405 {
        return Err(ProbeError::HeadBlocked(code));
    }
    if !(200..300).contains(&code) {
        return Err(ProbeError::Other(anyhow::anyhow!(
            "HEAD {} returned HTTP {}",
            url,
            code
        )));
    }
    Ok(parse_headers(&headers))
}

fn head_request(
    url: &str,
    connect_timeout: Duration,
    timeout: Duration,
) -> Result<(u32, Vec<String>)> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.nobody(true)?;
    easy.follow_location(true)?;
    easy.connect_timeout(connect_timeout)?;
    easy.timeout(timeout)?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        transfer.perform().context("HEAD request failed")?;
    }

    let code = easy.response_code().context("no response code")? as u32;
    Ok((code, headers))
}

/// Probe with `GET Range: bytes=0-0`. A 206 proves range support; total size
/// is taken from `Content-Range: bytes 0-0/total`. A 200 means the server
/// ignored the range (no range support); the body is not read past the first
/// write so we don't pull the whole file.
fn ranged_get_probe(url: &str, connect_timeout: Duration, timeout: Duration) -> Result<ProbeResult> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).context("invalid URL")?;
    easy.follow_location(true)?;
    easy.connect_timeout(connect_timeout)?;
    easy.timeout(timeout)?;
    easy.range("0-0")?;

    {
        let mut transfer = easy.transfer();
        transfer.header_function(|data| {
            if let Ok(s) = str::from_utf8(data) {
                headers.push(s.trim_end().to_string());
            }
            true
        })?;
        // Abort the body after the first chunk; we only need headers.
        transfer.write_function(|data| Ok(data.len().min(1)))?;
        match transfer.perform() {
            Ok(()) => {}
            // A write "error" here is just our early abort of a 200 body.
            Err(e) if e.is_write_error() => {}
            Err(e) => return Err(anyhow::Error::from(e).context("ranged GET probe failed")),
        }
    }

    let code = easy.response_code().context("no response code")? as u32;
    if !(200..300).contains(&code) {
        anyhow::bail!("ranged GET probe of {} returned HTTP {}", url, code);
    }

    let mut result = parse_headers(&headers);
    if code == 206 {
        result.accept_ranges = true;
        // Content-Length of a 0-0 response is the probe byte, not the file;
        // the real size lives in Content-Range.
        result.total_size = content_range_total(&headers);
    } else {
        result.accept_ranges = false;
    }
    Ok(result)
}

/// Parses collected header lines into a `ProbeResult`.
fn parse_headers(lines: &[String]) -> ProbeResult {
    let mut result = ProbeResult::default();
    for line in lines {
        let line = line.trim();
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            if let Ok(n) = value.parse::<u64>() {
                result.total_size = Some(n);
            }
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            result.accept_ranges = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("etag") {
            result.etag = Some(value.trim_matches('"').to_string());
        } else if name.eq_ignore_ascii_case("last-modified") {
            result.last_modified = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-disposition") {
            result.content_disposition = Some(value.to_string());
        }
    }
    result
}

/// Extracts the total from `Content-Range: bytes X-Y/total` (None for `*`).
fn content_range_total(lines: &[String]) -> Option<u64> {
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("content-range") {
            continue;
        }
        let value = value.trim();
        if let Some(total) = value.rsplit('/').next() {
            if total != "*" {
                if let Ok(n) = total.trim().parse::<u64>() {
                    return Some(n);
                }
            }
        }
    }
    None
}
