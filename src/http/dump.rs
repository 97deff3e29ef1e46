//! Canonical wire serialization of generated requests
//!
//! The dump feeds the `request` DSL variable and keys the project-file
//! cache, so it must be deterministic for a given request.

use url::Url;

/// Dumps a structured request in wire form. `Content-Length` is recomputed
/// from the body unless the transfer encoding is chunked, in which case the
/// body is preserved as-is.
pub fn dump_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    body: Option<&str>,
) -> String {
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut out = format!("{method} {path} HTTP/1.1\r\n");
    let host = url.host_str().unwrap_or_default();
    let host_value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    out.push_str(&format!("Host: {host_value}\r\n"));

    let chunked = headers
        .iter()
        .any(|(k, v)| k.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.push_str(&format!("{name}: {value}\r\n"));
    }

    if let Some(body) = body {
        if !chunked && !is_bodyless(method) {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        out.push_str("\r\n");
        out.push_str(body);
    } else {
        out.push_str("\r\n");
    }
    out
}

/// Reconstructs an equivalent curl invocation for a structured request.
pub fn curl_command(
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: Option<&str>,
) -> String {
    let mut cmd = format!("curl -X '{method}'");
    for (name, value) in headers {
        cmd.push_str(&format!(" -H '{name}: {value}'"));
    }
    if let Some(body) = body {
        cmd.push_str(&format!(" -d '{}'", body.replace('\'', "'\\''")));
    }
    cmd.push_str(&format!(" '{url}'"));
    cmd
}

fn is_bodyless(method: &str) -> bool {
    method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD")
}
