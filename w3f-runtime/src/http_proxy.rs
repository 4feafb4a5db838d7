//! Metered forward proxy for a script's outbound HTTP(S) traffic.
//!
//! Plain requests arrive in absolute form and are re-issued upstream; HTTPS
//! arrives as `CONNECT` and is tunnelled byte for byte. Every byte in either
//! direction is counted against the invocation's upload/download ceilings;
//! on a breach the offending chunk is dropped and both connections are torn
//! down.

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Result, RuntimeError};
use crate::http::upstream_client;

type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

const COPY_BUFFER: usize = 16 * 1024;

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Ceilings for one invocation. Byte limits are in bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpProxyLimits {
    pub request_limit: u64,
    pub download_limit: u64,
    pub upload_limit: u64,
    pub blacklisted_hosts: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HttpProxyStats {
    pub nb_requests: u64,
    pub nb_throttled: u64,
    pub download_kb: f64,
    pub upload_kb: f64,
    pub request_throttled: bool,
    pub download_throttled: bool,
    pub upload_throttled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Upload,
    Download,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    admitted: AtomicU64,
    throttled: AtomicU64,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    request_throttled: AtomicBool,
    upload_throttled: AtomicBool,
    download_throttled: AtomicBool,
}

struct ProxyState {
    limits: HttpProxyLimits,
    counters: Counters,
    shutdown: watch::Receiver<bool>,
}

impl ProxyState {
    fn is_blacklisted(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.limits.blacklisted_hosts.iter().any(|blocked| {
            let blocked = blocked.trim_end_matches('.').to_ascii_lowercase();
            host == blocked || host.ends_with(&format!(".{blocked}"))
        })
    }

    /// Count the request and decide whether it fits under the ceiling.
    fn admit_request(&self) -> bool {
        self.counters.requests.fetch_add(1, Ordering::SeqCst);
        let limit = self.limits.request_limit;
        let admitted = self
            .counters
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.counters.throttled.fetch_add(1, Ordering::SeqCst);
            self.counters.request_throttled.store(true, Ordering::SeqCst);
        }
        admitted
    }

    /// Account `len` bytes. Returns `false` (and counts nothing) when the
    /// chunk would cross the ceiling.
    fn meter(&self, direction: Direction, len: u64) -> bool {
        let (counter, limit, flag) = match direction {
            Direction::Upload => (
                &self.counters.uploaded,
                self.limits.upload_limit,
                &self.counters.upload_throttled,
            ),
            Direction::Download => (
                &self.counters.downloaded,
                self.limits.download_limit,
                &self.counters.download_throttled,
            ),
        };
        let within = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                let next = n.saturating_add(len);
                (next <= limit).then_some(next)
            })
            .is_ok();
        if !within {
            flag.store(true, Ordering::SeqCst);
        }
        within
    }
}

/// Marks a single request throttled at most once, however many chunks breach.
#[derive(Clone)]
struct RequestThrottle {
    state: Arc<ProxyState>,
    counted: Arc<AtomicBool>,
}

impl RequestThrottle {
    fn new(state: Arc<ProxyState>) -> Self {
        Self {
            state,
            counted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn meter(&self, direction: Direction, len: usize) -> bool {
        let within = self.state.meter(direction, len as u64);
        if !within && !self.counted.swap(true, Ordering::SeqCst) {
            self.state.counters.throttled.fetch_add(1, Ordering::SeqCst);
        }
        within
    }

    fn breached(&self) -> bool {
        self.counted.load(Ordering::SeqCst)
    }
}

pub struct HttpProxy {
    state: Arc<ProxyState>,
    bind_ip: IpAddr,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpProxy {
    pub fn new(limits: HttpProxyLimits, bind_ip: IpAddr) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        Self {
            state: Arc::new(ProxyState {
                limits,
                counters: Counters::default(),
                shutdown: shutdown_rx,
            }),
            bind_ip,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Bind and start accepting connections. Returns the bound address.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.bind_ip, port)).await.map_err(|err| {
            RuntimeError::Startup(format!("http proxy failed to bind port {port}: {err}"))
        })?;
        let addr = listener.local_addr()?;
        let state = self.state.clone();
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        tokio::spawn(serve_connection(stream, state.clone()));
                    }
                }
            }
        });
        *self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        tracing::debug!(%addr, "HTTP proxy listening");
        Ok(addr)
    }

    /// Close the listener and every open connection and tunnel. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub fn stats(&self) -> HttpProxyStats {
        let c = &self.state.counters;
        HttpProxyStats {
            nb_requests: c.requests.load(Ordering::SeqCst),
            nb_throttled: c.throttled.load(Ordering::SeqCst),
            download_kb: c.downloaded.load(Ordering::SeqCst) as f64 / 1024.0,
            upload_kb: c.uploaded.load(Ordering::SeqCst) as f64 / 1024.0,
            request_throttled: c.request_throttled.load(Ordering::SeqCst),
            download_throttled: c.download_throttled.load(Ordering::SeqCst),
            upload_throttled: c.upload_throttled.load(Ordering::SeqCst),
        }
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ProxyState>) {
    let mut shutdown = state.shutdown.clone();
    let service_state = state.clone();
    let service = service_fn(move |req| handle(service_state.clone(), req));
    let conn = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();

    tokio::select! {
        result = conn => {
            if let Err(err) = result {
                tracing::trace!("proxy connection closed: {err}");
            }
        }
        _ = shutdown.wait_for(|stop| *stop) => {}
    }
}

async fn handle(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, io::Error> {
    let Some(host) = target_host(&req) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
    };
    if state.is_blacklisted(&host) {
        tracing::debug!(%host, "Blocked blacklisted host");
        return Ok(text_response(
            StatusCode::FORBIDDEN,
            "Forbidden: host is blacklisted",
        ));
    }
    if !state.admit_request() {
        return Ok(text_response(
            StatusCode::TOO_MANY_REQUESTS,
            "Request limit exceeded",
        ));
    }

    if req.method() == Method::CONNECT {
        connect(state, req).await
    } else {
        forward(state, req).await
    }
}

fn target_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(':').next())
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// CONNECT tunnels
// ---------------------------------------------------------------------------

async fn connect(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, io::Error> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return Ok(text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port"));
    };
    let upstream = match TcpStream::connect(&authority).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::debug!(%authority, "CONNECT upstream failed: {err}");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    tokio::spawn(async move {
        let mut shutdown = state.shutdown.clone();
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(%authority, "CONNECT upgrade failed: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tunnel(upgraded, upstream, state) => {}
            _ = shutdown.wait_for(|stop| *stop) => {}
        }
    });

    Ok(Response::new(empty_body()))
}

enum CopyError {
    Limit,
    Io,
}

async fn tunnel(upgraded: Upgraded, upstream: TcpStream, state: Arc<ProxyState>) {
    let throttle = RequestThrottle::new(state);
    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let upload = copy_metered(
        &mut client_read,
        &mut upstream_write,
        &throttle,
        Direction::Upload,
    );
    let download = copy_metered(
        &mut upstream_read,
        &mut client_write,
        &throttle,
        Direction::Download,
    );

    // First failure drops both halves of both connections.
    if let Err(CopyError::Limit) = tokio::try_join!(upload, download) {
        tracing::debug!("Tunnel closed after exceeding byte limit");
    }
}

async fn copy_metered<R, W>(
    reader: &mut R,
    writer: &mut W,
    throttle: &RequestThrottle,
    direction: Direction,
) -> std::result::Result<(), CopyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await.map_err(|_| CopyError::Io)?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        if !throttle.meter(direction, n) {
            return Err(CopyError::Limit);
        }
        writer.write_all(&buf[..n]).await.map_err(|_| CopyError::Io)?;
    }
}

// ---------------------------------------------------------------------------
// Plain HTTP forwarding
// ---------------------------------------------------------------------------

async fn forward(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, io::Error> {
    if req.uri().scheme().is_none() {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "Proxy requests must use an absolute URI",
        ));
    }
    let client = match upstream_client() {
        Ok(client) => client,
        Err(err) => {
            tracing::error!("{err}");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    let throttle = RequestThrottle::new(state);
    let url = req.uri().to_string();
    let method = req.method().clone();
    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(HOST);

    let upload_throttle = throttle.clone();
    let upload = req.into_body().into_data_stream().map(move |chunk| match chunk {
        Ok(bytes) if upload_throttle.meter(Direction::Upload, bytes.len()) => Ok(bytes),
        Ok(_) => Err(io::Error::other("upload limit exceeded")),
        Err(err) => Err(io::Error::other(err)),
    });

    let response = match client
        .request(method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(upload))
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) if throttle.breached() => {
            // Dropping the connection is the only way to cut off the client.
            return Err(io::Error::other(format!("upload limit exceeded: {err}")));
        }
        Err(err) => {
            tracing::debug!(%url, "Upstream request failed: {err}");
            return Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
        }
    };

    let status = response.status();
    let mut response_headers = response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let download_throttle = throttle.clone();
    let download = response.bytes_stream().map(move |chunk| match chunk {
        Ok(bytes) if download_throttle.meter(Direction::Download, bytes.len()) => {
            Ok(Frame::data(bytes))
        }
        Ok(_) => Err(io::Error::other("download limit exceeded")),
        Err(err) => Err(io::Error::other(err)),
    });

    let mut builder = Response::builder().status(status);
    if let Some(target) = builder.headers_mut() {
        *target = response_headers;
    }
    builder
        .body(StreamBody::new(download).boxed_unsync())
        .map_err(io::Error::other)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn text_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(message.as_bytes()))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn limits(request_limit: u64) -> HttpProxyLimits {
        HttpProxyLimits {
            request_limit,
            download_limit: 1024 * 1024,
            upload_limit: 1024 * 1024,
            blacklisted_hosts: vec!["blocked.test".into()],
        }
    }

    async fn start_proxy(limits: HttpProxyLimits) -> (HttpProxy, reqwest::Client) {
        let proxy = HttpProxy::new(limits, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let addr = proxy.start(0).await.unwrap();
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{addr}")).unwrap())
            .build()
            .unwrap();
        (proxy, client)
    }

    #[tokio::test]
    async fn request_limit_boundary() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&upstream)
            .await;
        let (proxy, client) = start_proxy(limits(3)).await;

        for _ in 0..3 {
            let res = client.get(upstream.uri()).send().await.unwrap();
            assert_eq!(res.status(), 200);
            assert_eq!(res.text().await.unwrap(), "ok");
        }
        let res = client.get(upstream.uri()).send().await.unwrap();
        assert_eq!(res.status(), 429);

        let stats = proxy.stats();
        assert_eq!(stats.nb_requests, 4);
        assert_eq!(stats.nb_throttled, 1);
        assert!(stats.request_throttled);
        assert!(stats.download_kb > 0.0);
        proxy.stop();
        proxy.stop();
    }

    #[tokio::test]
    async fn blacklisted_hosts_are_forbidden_and_not_counted() {
        let (proxy, client) = start_proxy(limits(0)).await;
        for url in ["http://blocked.test/", "http://api.blocked.test/x"] {
            let res = client.get(url).send().await.unwrap();
            assert_eq!(res.status(), 403);
        }
        assert_eq!(proxy.stats().nb_requests, 0);
    }

    #[tokio::test]
    async fn download_limit_cuts_the_response() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'x'; 64 * 1024]))
            .mount(&upstream)
            .await;
        let (proxy, client) = start_proxy(HttpProxyLimits {
            download_limit: 1024,
            ..limits(10)
        })
        .await;

        let outcome = match client.get(upstream.uri()).send().await {
            Ok(res) => res.bytes().await.map(|b| b.len()),
            Err(err) => Err(err),
        };
        assert!(outcome.is_err(), "body should be cut off, got {outcome:?}");

        let stats = proxy.stats();
        assert!(stats.download_throttled);
        assert_eq!(stats.nb_throttled, 1);
        assert!(stats.download_kb <= 1.0);
    }

    #[tokio::test]
    async fn connect_tunnel_is_metered() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = socket.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });

        let proxy = HttpProxy::new(
            HttpProxyLimits {
                upload_limit: 8,
                ..limits(10)
            },
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        let proxy_addr = proxy.start(0).await.unwrap();

        let mut conn = TcpStream::connect(proxy_addr).await.unwrap();
        conn.write_all(
            format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();
        let mut head = vec![0u8; 1024];
        let n = conn.read(&mut head).await.unwrap();
        assert!(String::from_utf8_lossy(&head[..n]).starts_with("HTTP/1.1 200"));

        conn.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        conn.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        // 4 + 16 bytes crosses the 8 byte upload ceiling.
        conn.write_all(&[b'y'; 16]).await.unwrap();
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            conn.read_to_end(&mut rest),
        )
        .await
        .unwrap();
        assert!(rest.is_empty());

        let stats = proxy.stats();
        assert!(stats.upload_throttled);
        assert_eq!(stats.nb_throttled, 1);
        assert_eq!(stats.nb_requests, 1);
    }
}
