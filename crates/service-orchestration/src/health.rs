//! Health probes for services.
//!
//! Two probes are available: a TCP connect, which answers "is something
//! listening", and an HTTP `GET` over `http` or `https`, which looks only at
//! the status code. Both are bounded by the probe timeout and never return
//! an error; a failed probe is a result like any other.
//!
//! The HTTP client runs on a tokio reactor, so requests are wrapped with
//! `async-compat` to be awaited from smol.

use crate::result::HealthCheckEntry;
use async_compat::CompatExt;
use async_net::TcpStream;
use futures_lite::FutureExt;
use reqwest::redirect::Policy;
use smol::Timer;
use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of an HTTP probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProbe {
    /// Status code, when a response arrived
    pub status_code: Option<u16>,
    /// Time to the response headers or failure
    pub latency: Duration,
    /// Why no status code is available
    pub error: Option<String>,
}

impl HttpProbe {
    /// Map the probe to a check entry
    ///
    /// 2xx and 3xx pass, 4xx warns, 5xx and connection failures fail.
    pub fn to_check(&self, name: &str) -> HealthCheckEntry {
        let latency = self.latency.as_millis();
        match self.status_code {
            Some(code @ 200..=399) => {
                HealthCheckEntry::pass(name, format!("HTTP {} in {}ms", code, latency))
            }
            Some(code @ 400..=499) => HealthCheckEntry::warn(name, format!("HTTP {}", code)),
            Some(code) => HealthCheckEntry::fail(name, format!("HTTP {}", code)),
            None => HealthCheckEntry::fail(
                name,
                self.error.clone().unwrap_or_else(|| "no response".to_string()),
            ),
        }
    }
}

/// A parsed service endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// URL scheme, `tcp` when none was given
    pub scheme: String,
    /// Host name or address, without IPv6 brackets
    pub host: String,
    /// Port, defaulted from the scheme
    pub port: u16,
    /// Request path, `/` when none was given
    pub path: String,
}

impl Endpoint {
    /// Plain HTTP endpoint on `host:port`
    pub fn http(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            scheme: "http".to_string(),
            host: host.into(),
            port,
            path: path.into(),
        }
    }

    /// Whether an HTTP probe can talk to this endpoint
    pub fn speaks_http(&self) -> bool {
        matches!(self.scheme.as_str(), "http" | "https")
    }

    /// `host:port`, bracketing IPv6 addresses
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// URL of `path` on this endpoint
    pub fn url_for(&self, path: &str) -> String {
        let slash = if path.starts_with('/') { "" } else { "/" };
        format!("{}://{}{}{}", self.scheme, self.authority(), slash, path)
    }

    /// URL of the endpoint's own path
    pub fn url(&self) -> String {
        self.url_for(&self.path)
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" => Some(80),
        "https" => Some(443),
        "postgres" | "postgresql" => Some(5432),
        _ => None,
    }
}

/// Split `scheme://host:port/path` into its parts
///
/// Without a scheme the endpoint is taken as `host:port`. IPv6 hosts are
/// written in brackets, `[::1]:8080` or `[::1]`. Returns `None` when no port
/// can be determined.
pub fn parse_endpoint(endpoint: &str) -> Option<Endpoint> {
    let (scheme, rest) = match endpoint.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("tcp".to_string(), endpoint),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = match authority.strip_prefix('[') {
        Some(bracketed) => {
            let (host, after) = bracketed.split_once(']')?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port.parse().ok()?),
                None if after.is_empty() => None,
                None => return None,
            };
            (host, port)
        }
        None => match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse().ok()?)),
            None => (authority, None),
        },
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(port) => port,
        None => default_port(&scheme)?,
    };

    Some(Endpoint {
        scheme,
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

async fn bounded<T>(limit: Duration, fut: impl Future<Output = io::Result<T>>) -> io::Result<T> {
    fut.or(async {
        Timer::after(limit).await;
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("timed out after {}ms", limit.as_millis()),
        ))
    })
    .await
}

/// Error with its sources, `outer: inner: root`
fn error_chain(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

/// Runs TCP and HTTP probes with a fixed time bound
#[derive(Debug, Clone)]
pub struct HealthChecker {
    timeout: Duration,
    client: reqwest::Client,
}

impl HealthChecker {
    /// Checker whose probes give up after `timeout`
    ///
    /// Redirects are reported, not followed, and probes go straight to the
    /// service without any configured proxy.
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("fleetctl")
            .redirect(Policy::none())
            .no_proxy()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to a default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { timeout, client }
    }

    /// Probe time bound
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether something accepts TCP connections on `host:port`
    pub async fn tcp_probe(&self, host: &str, port: u16) -> bool {
        let reachable = bounded(self.timeout, async {
            TcpStream::connect((host, port)).await.map(|_| ())
        })
        .await;
        debug!("TCP probe {}:{} -> {:?}", host, port, reachable);
        reachable.is_ok()
    }

    /// Send `GET path` to `http://host:port`
    pub async fn http_probe(&self, host: &str, port: u16, path: &str) -> HttpProbe {
        self.get(&Endpoint::http(host, port, path).url()).await
    }

    /// Send `GET url` and report the status code
    pub async fn get(&self, url: &str) -> HttpProbe {
        let started = Instant::now();
        let status = async {
            self.client
                .get(url)
                .send()
                .await
                .map(|response| response.status().as_u16())
        }
        .compat()
        .await;

        let latency = started.elapsed();
        let probe = match status {
            Ok(code) => HttpProbe {
                status_code: Some(code),
                latency,
                error: None,
            },
            Err(e) if e.is_timeout() => HttpProbe {
                status_code: None,
                latency,
                error: Some(format!(
                    "{}: timed out after {}ms",
                    url,
                    self.timeout.as_millis()
                )),
            },
            Err(e) => HttpProbe {
                status_code: None,
                latency,
                error: Some(error_chain(&e)),
            },
        };
        debug!("HTTP probe {} -> {:?}", url, probe.status_code);
        probe
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::CheckStatus;
    use async_net::TcpListener;
    use smol::io::{AsyncReadExt, AsyncWriteExt};

    /// Serve `response` to `count` connections, then stop
    fn serve(listener: TcpListener, response: &'static [u8], count: usize) -> smol::Task<()> {
        smol::spawn(async move {
            for _ in 0..count {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(response).await;
            }
        })
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_parse_endpoint() {
        let ep = parse_endpoint("http://api.acme.test:8080/healthz").unwrap();
        assert_eq!(ep.scheme, "http");
        assert_eq!(ep.host, "api.acme.test");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/healthz");
        assert!(ep.speaks_http());

        let ep = parse_endpoint("https://auth.example.com").unwrap();
        assert_eq!(ep.port, 443);
        assert_eq!(ep.path, "/");
        assert!(ep.speaks_http());
        assert_eq!(ep.url(), "https://auth.example.com:443/");

        let ep = parse_endpoint("postgres://user:pw@db.internal/app").unwrap();
        assert_eq!(ep.host, "db.internal");
        assert_eq!(ep.port, 5432);
        assert!(!ep.speaks_http());

        let ep = parse_endpoint("10.0.0.5:6379").unwrap();
        assert_eq!(ep.scheme, "tcp");
        assert_eq!(ep.port, 6379);

        assert!(parse_endpoint("just-a-host").is_none());
        assert!(parse_endpoint("http://:80").is_none());
    }

    #[test]
    fn test_parse_ipv6_endpoints() {
        let ep = parse_endpoint("http://[::1]:8080/health").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/health");
        assert_eq!(ep.url(), "http://[::1]:8080/health");

        let ep = parse_endpoint("https://[2001:db8::7]/status").unwrap();
        assert_eq!(ep.host, "2001:db8::7");
        assert_eq!(ep.port, 443);

        let ep = parse_endpoint("[fe80::1]:5432").unwrap();
        assert_eq!(ep.scheme, "tcp");
        assert_eq!(ep.host, "fe80::1");
        assert_eq!(ep.authority(), "[fe80::1]:5432");

        assert!(parse_endpoint("http://[::1").is_none());
        assert!(parse_endpoint("http://[::1]x/").is_none());
        assert!(parse_endpoint("tcp://[::1]").is_none());
        assert!(parse_endpoint("http://[]:80").is_none());
    }

    #[test]
    fn test_url_for_adds_missing_slash() {
        let ep = Endpoint::http("127.0.0.1", 3000, "/");
        assert_eq!(ep.url_for("healthz"), "http://127.0.0.1:3000/healthz");
        assert_eq!(ep.url_for("/ready"), "http://127.0.0.1:3000/ready");
    }

    #[test]
    fn test_probe_to_check_mapping() {
        let probe = |code| HttpProbe {
            status_code: code,
            latency: Duration::from_millis(3),
            error: None,
        };
        assert_eq!(probe(Some(200)).to_check("http").status, CheckStatus::Pass);
        assert_eq!(probe(Some(302)).to_check("http").status, CheckStatus::Pass);
        assert_eq!(probe(Some(404)).to_check("http").status, CheckStatus::Warn);
        assert_eq!(probe(Some(500)).to_check("http").status, CheckStatus::Fail);
        assert_eq!(probe(None).to_check("http").status, CheckStatus::Fail);
    }

    #[test]
    fn test_probes_against_local_listener() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = serve(
                listener,
                b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                2,
            );

            let checker = HealthChecker::new(Duration::from_secs(2));
            assert!(checker.tcp_probe("127.0.0.1", port).await);

            let probe = checker.http_probe("127.0.0.1", port, "/health").await;
            assert_eq!(probe.status_code, Some(503), "{:?}", probe.error);
            server.await;
        });
    }

    #[test]
    fn test_redirects_are_reported_not_followed() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = serve(
                listener,
                b"HTTP/1.1 302 Found\r\nLocation: http://127.0.0.1:1/login\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                1,
            );

            let checker = HealthChecker::new(Duration::from_secs(2));
            let probe = checker.get(&format!("http://127.0.0.1:{}/", port)).await;
            assert_eq!(probe.status_code, Some(302), "{:?}", probe.error);
            assert_eq!(probe.to_check("http").status, CheckStatus::Pass);
            server.await;
        });
    }

    #[test]
    fn test_ipv6_listener_is_probed() {
        smol::block_on(async {
            // Hosts without IPv6 loopback have nothing to probe
            let Ok(listener) = TcpListener::bind("[::1]:0").await else {
                return;
            };
            let port = listener.local_addr().unwrap().port();
            let server = serve(
                listener,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                2,
            );

            let ep = parse_endpoint(&format!("http://[::1]:{}/health", port)).unwrap();
            let checker = HealthChecker::new(Duration::from_secs(2));
            assert!(checker.tcp_probe(&ep.host, ep.port).await);
            let probe = checker.get(&ep.url()).await;
            assert_eq!(probe.status_code, Some(200), "{:?}", probe.error);
            server.await;
        });
    }

    #[test]
    fn test_closed_port_fails_fast() {
        smol::block_on(async {
            let port = closed_port().await;
            let checker = HealthChecker::new(Duration::from_secs(2));
            assert!(!checker.tcp_probe("127.0.0.1", port).await);
            let probe = checker.http_probe("127.0.0.1", port, "/").await;
            assert!(probe.status_code.is_none());
            assert!(probe.error.is_some());
        });
    }

    #[test]
    fn test_https_endpoints_are_requested() {
        smol::block_on(async {
            let port = closed_port().await;
            let checker = HealthChecker::new(Duration::from_secs(2));
            let probe = checker.get(&format!("https://127.0.0.1:{}/health", port)).await;
            assert!(probe.status_code.is_none());
            assert!(probe.error.is_some());
            assert_eq!(probe.to_check("http").status, CheckStatus::Fail);
        });
    }

    #[test]
    fn test_https_against_plain_listener_fails_the_handshake() {
        smol::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = serve(
                listener,
                b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                1,
            );

            let checker = HealthChecker::new(Duration::from_secs(2));
            let probe = checker.get(&format!("https://127.0.0.1:{}/", port)).await;
            assert_eq!(probe.status_code, None);
            assert_eq!(probe.to_check("http").status, CheckStatus::Fail);
            server.await;
        });
    }
}
