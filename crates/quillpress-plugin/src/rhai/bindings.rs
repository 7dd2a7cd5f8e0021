//! Rust-to-Rhai bindings: the host API and general-purpose helpers.

use std::fmt::Write as _;
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, Map};

use crate::config::ResolvedConfig;
use crate::runtime::HostBindings;

/// Register `registerRoute`, `log` and `getConfig`, and route `print`/`debug`
/// to the plugin's logger.
pub fn register_host_api(engine: &mut Engine, host: &HostBindings) {
    let bindings = host.clone();
    engine.register_fn("registerRoute", move |method: &str, path: &str, handler: &str| {
        bindings.register_route(method, path, handler);
    });

    let bindings = host.clone();
    engine.register_fn("log", move |message: &str| bindings.log(message));

    let bindings = host.clone();
    engine.on_print(move |text| bindings.log(text));

    let bindings = host.clone();
    engine.on_debug(move |text, _source, pos| {
        tracing::debug!(target: "plugin", plugin = %bindings.plugin(), %pos, "{text}");
    });

    let config = config_map(host.config());
    engine.register_fn("getConfig", move || config.clone());
}

fn config_map(config: &ResolvedConfig) -> Map {
    config
        .iter()
        .map(|(k, v)| (k.into(), Dynamic::from(v.to_string())))
        .collect()
}

/// Register string, JSON, time, environment and filesystem helpers on top of
/// Rhai's standard packages.
pub fn register_std_helpers(engine: &mut Engine) {
    // json_encode(value) - Serialize any value to JSON text
    engine.register_fn("json_encode", |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
        let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        serde_json::to_string(&json).map_err(|e| e.to_string().into())
    });

    // json_decode(text) - Parse JSON text into maps/arrays/scalars
    engine.register_fn("json_decode", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        let json: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        rhai::serde::to_dynamic(json)
    });

    engine.register_fn("now_unix", || chrono::Utc::now().timestamp());

    engine.register_fn("now_rfc3339", || chrono::Utc::now().to_rfc3339());

    // format_time(unix, fmt) - strftime-style formatting; () on bad input
    engine.register_fn("format_time", |unix: i64, fmt: &str| -> Dynamic {
        let Some(time) = chrono::DateTime::from_timestamp(unix, 0) else {
            return Dynamic::UNIT;
        };
        let mut out = String::new();
        match write!(out, "{}", time.format(fmt)) {
            Ok(()) => Dynamic::from(out),
            Err(_) => Dynamic::UNIT,
        }
    });

    engine.register_fn("html_escape", |text: &str| -> String { html_escape(text) });

    engine.register_fn("slugify", |text: &str| -> String { slugify(text) });

    engine.register_fn("env_var", |name: &str| -> Dynamic {
        match std::env::var(name) {
            Ok(value) => Dynamic::from(value),
            Err(_) => Dynamic::UNIT,
        }
    });

    engine.register_fn("fs_exists", |path: &str| -> bool { std::path::Path::new(path).exists() });

    engine.register_fn("fs_read", |path: &str| -> Dynamic {
        match std::fs::read_to_string(path) {
            Ok(content) => Dynamic::from(content),
            Err(_) => Dynamic::UNIT,
        }
    });
}

/// Largest response body handed back to a script (1MB).
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Register `http_get(url)` and `http_post(url, body)`. Both return the
/// response body as a string, or `()` when the URL is not http(s), the
/// request fails or answers with an error status, or `timeout` elapses.
pub fn register_net_helpers(engine: &mut Engine, timeout: Duration) {
    engine.register_fn("http_get", move |url: &str| -> Dynamic {
        fetch(url, None, timeout).map_or(Dynamic::UNIT, Dynamic::from)
    });

    engine.register_fn("http_post", move |url: &str, body: &str| -> Dynamic {
        fetch(url, Some(body.to_string()), timeout).map_or(Dynamic::UNIT, Dynamic::from)
    });
}

fn fetch(url: &str, body: Option<String>, timeout: Duration) -> Option<String> {
    let url = match reqwest::Url::parse(url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        Ok(url) => {
            tracing::debug!(scheme = url.scheme(), "Refusing non-HTTP request");
            return None;
        }
        Err(e) => {
            tracing::debug!(%url, error = %e, "Invalid request URL");
            return None;
        }
    };

    // The blocking client must not run on an async worker thread.
    std::thread::spawn(move || send(url, body, timeout))
        .join()
        .ok()
        .flatten()
}

fn send(url: reqwest::Url, body: Option<String>, timeout: Duration) -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .inspect_err(|e| tracing::debug!(error = %e, "Cannot build HTTP client"))
        .ok()?;

    let request = match body {
        Some(body) => client.post(url.clone()).body(body),
        None => client.get(url.clone()),
    };
    let response = request
        .send()
        .and_then(|response| response.error_for_status())
        .inspect_err(|e| tracing::debug!(%url, error = %e, "HTTP request failed"))
        .ok()?;

    let mut text = response.text().ok()?;
    if text.len() > MAX_RESPONSE_SIZE {
        let mut end = MAX_RESPONSE_SIZE;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    Some(text)
}

fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Instant;

    fn engine() -> Engine {
        let mut engine = Engine::new();
        register_std_helpers(&mut engine);
        register_net_helpers(&mut engine, Duration::from_millis(300));
        engine
    }

    /// Answer a single request with its own body, or `hello` when it has none.
    /// The handle yields the request line.
    fn serve_once() -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut request_line = String::new();
            reader.read_line(&mut request_line).unwrap();
            let mut length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0; length];
            reader.read_exact(&mut body).unwrap();

            let reply = if body.is_empty() { b"hello".to_vec() } else { body };
            write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.len()
            )
            .unwrap();
            stream.write_all(&reply).unwrap();
            request_line
        });
        (format!("http://{addr}"), handle)
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(html_escape("<a href=\"x\">&'</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello, World!"), "hello-world");
        assert_eq!(slugify("  --Rust  2024-- "), "rust-2024");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_json_helpers() {
        let engine = engine();
        let text: String = engine
            .eval(r#"let m = json_decode("{\"a\": [1, 2]}"); m.a.push(3); json_encode(m)"#)
            .unwrap();
        assert_eq!(text, r#"{"a":[1,2,3]}"#);

        assert!(engine.eval::<Dynamic>(r#"json_decode("{oops")"#).is_err());
    }

    #[test]
    fn test_time_helpers() {
        let engine = engine();
        assert!(engine.eval::<i64>("now_unix()").unwrap() > 0);
        assert_eq!(
            engine.eval::<String>(r#"format_time(0, "%Y-%m-%d")"#).unwrap(),
            "1970-01-01"
        );
    }

    #[test]
    fn test_http_helpers() {
        let engine = engine();

        let (base, server) = serve_once();
        let body: String = engine.eval(&format!(r#"http_get("{base}/feed.xml")"#)).unwrap();
        assert_eq!(body, "hello");
        assert!(server.join().unwrap().starts_with("GET /feed.xml "));

        let (base, server) = serve_once();
        let body: String = engine
            .eval(&format!(r#"http_post("{base}/ping", json_encode(#{{ page: "/about" }}))"#))
            .unwrap();
        assert_eq!(body, r#"{"page":"/about"}"#);
        assert!(server.join().unwrap().starts_with("POST /ping "));
    }

    #[test]
    fn test_http_failures_return_unit() {
        let engine = engine();
        for script in [
            r#"http_get("ftp://127.0.0.1/file")"#,
            r#"http_get("not a url")"#,
            r#"http_post("file:///etc/passwd", "")"#,
        ] {
            assert!(engine.eval::<Dynamic>(script).unwrap().is_unit(), "{script}");
        }

        // Accepts the connection but never answers.
        let silent = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = silent.local_addr().unwrap();
        let started = Instant::now();
        let result: Dynamic = engine.eval(&format!(r#"http_get("http://{addr}/")"#)).unwrap();
        assert!(result.is_unit());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
