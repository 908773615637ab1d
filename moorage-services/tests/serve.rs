use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use http::StatusCode;
use monoio::{
    blocking::DefaultThreadPool,
    io::{AsyncReadRent, AsyncWriteRentExt},
    net::{TcpListener, TcpStream},
};
use moorage_core::{
    agent::Trouble,
    config::{AgentConfig, RuntimeConfig, RuntimeType},
    error::{ProtocolError, ShipError},
    post::Post,
    rudder::{Listener, ListenerBuilder},
    runtime::RuntimeWrapper,
    ship::{InboundCx, NextSocketAction, ProtocolHandler, TourHandler},
    tour::{Tour, TourKey},
    transporter::{Timeouts, Wire},
    GrandAgent,
};
use moorage_services::{
    docker::{CgiDocker, CgiSlots, FileDocker, Reaper, WarpDocker},
    HttpPort,
};

fn site(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("moorage-{name}-{}", std::process::id()));
    std::fs::create_dir_all(root.join("docs")).unwrap();
    std::fs::write(root.join("hello.txt"), "hello, moorage\n").unwrap();
    std::fs::write(root.join("docs/index.html"), "<p>docs</p>").unwrap();
    root
}

/// Runs one agent serving `port` on a loopback listener and drives `client`
/// against it.
fn with_agent<F, Fut>(agent_id: usize, port: HttpPort, client: F)
where
    F: FnOnce(SocketAddr) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    let runtime_config = RuntimeConfig {
        runtime_type: RuntimeType::Legacy,
        ..Default::default()
    };
    let pool = Box::new(DefaultThreadPool::new(2));
    let mut runtime = RuntimeWrapper::new(&runtime_config, Some(pool)).unwrap();
    runtime.block_on(async move {
        let mut agent = GrandAgent::new(agent_id, &AgentConfig::default());
        let listener = ListenerBuilder::bind_tcp("127.0.0.1:0".parse().unwrap(), Default::default())
            .unwrap()
            .build()
            .unwrap();
        let addr = match &listener {
            Listener::Tcp(l) => l.local_addr().unwrap(),
            #[cfg(unix)]
            Listener::Unix(_) => unreachable!(),
        };
        agent.anchor(listener, Rc::new(port));
        let handle = agent.handle();
        let running = monoio::spawn(agent.run());
        client(addr).await;
        handle.shutdown();
        running.await.unwrap();
    });
}

async fn read_to_end(stream: &mut TcpStream) -> String {
    let mut out = Vec::new();
    loop {
        let (res, buf) = stream.read(Vec::with_capacity(4096)).await;
        if res.unwrap() == 0 {
            break;
        }
        out.extend_from_slice(&buf);
    }
    String::from_utf8(out).unwrap()
}

async fn exchange(addr: SocketAddr, request: &'static [u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let (res, _) = stream.write_all(request).await;
    res.unwrap();
    read_to_end(&mut stream).await
}

/// Like [`exchange`], failing when the server keeps the connection open.
async fn exchange_until_closed(addr: SocketAddr, request: &'static [u8]) -> String {
    monoio::time::timeout(Duration::from_secs(5), exchange(addr, request))
        .await
        .expect("server kept the connection open")
}

/// Accepts one upstream connection, reads its request head, writes `reply` and
/// closes.
async fn upstream_once(upstream: TcpListener, reply: &'static [u8]) {
    let (mut conn, _) = upstream.accept().await.unwrap();
    let mut head = Vec::new();
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let (res, buf) = conn.read(Vec::with_capacity(1024)).await;
        if res.unwrap() == 0 {
            break;
        }
        head.extend_from_slice(&buf);
    }
    if !reply.is_empty() {
        let (res, _) = conn.write_all(reply).await;
        res.unwrap();
    }
}

fn warp_port(upstream: SocketAddr) -> HttpPort {
    let mut port = HttpPort::new("proxy", Timeouts::new(30, 5));
    port.route("/{*path}", Rc::new(WarpDocker::new(upstream, 10)))
        .unwrap();
    port
}

fn std_upstream() -> (std::net::TcpListener, SocketAddr) {
    let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = upstream.local_addr().unwrap();
    upstream.set_nonblocking(true).unwrap();
    (upstream, addr)
}

fn file_port(root: PathBuf) -> HttpPort {
    let timeouts = Timeouts::new(30, 5);
    let mut port = HttpPort::new("files", timeouts);
    port.route("/{*path}", Rc::new(FileDocker::new(root, timeouts)))
        .unwrap();
    port
}

#[test]
fn serves_a_file() {
    let port = file_port(site("file"));
    with_agent(91_001, port, |addr| async move {
        let res = exchange(addr, b"GET /hello.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
        assert!(res.contains("content-length: 15\r\n"), "{res}");
        assert!(res.contains("connection: close\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\nhello, moorage\n"), "{res}");
    });
}

#[test]
fn missing_file_is_a_text_404() {
    let port = file_port(site("missing"));
    with_agent(91_002, port, |addr| async move {
        let res = exchange(addr, b"GET /nope.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
        assert!(res.contains("content-type: text/plain; charset=utf-8\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\n404 Not Found: /nope.txt not found\n"), "{res}");
    });
}

#[test]
fn pipelined_requests_share_a_connection() {
    let port = file_port(site("pipelined"));
    with_agent(91_003, port, |addr| async move {
        let res = exchange(
            addr,
            b"GET /docs/ HTTP/1.1\r\nHost: t\r\n\r\nHEAD /hello.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .await;
        let first = res.find("HTTP/1.1 200 OK").unwrap();
        let second = res.rfind("HTTP/1.1 200 OK").unwrap();
        assert!(first < second, "{res}");
        assert!(res[..second].ends_with("<p>docs</p>"), "{res}");
        assert!(res[second..].ends_with("\r\n\r\n"), "{res}");
    });
}

#[test]
fn malformed_request_gets_400() {
    let port = file_port(site("malformed"));
    with_agent(91_004, port, |addr| async move {
        let res = exchange(addr, b"GET /hello.txt HTTP/1.1\r\nBad Header\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{res}");
    });
}

#[test]
fn warps_to_upstream() {
    let (upstream, upstream_addr) = std_upstream();
    with_agent(91_005, warp_port(upstream_addr), move |addr| async move {
        let upstream = TcpListener::from_std(upstream).unwrap();
        monoio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let (res, buf) = conn.read(Vec::with_capacity(1024)).await;
                if res.unwrap() == 0 {
                    break;
                }
                head.extend_from_slice(&buf);
            }
            let head = String::from_utf8(head).unwrap();
            assert!(head.starts_with("GET /api?x=1 HTTP/1.0\r\n"), "{head}");
            assert!(!head.to_ascii_lowercase().contains("connection:"), "{head}");
            let (res, _) = conn
                .write_all(&b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\nX-Up: 1\r\n\r\nupstr"[..])
                .await;
            res.unwrap();
        });
        let res = exchange(addr, b"GET /api?x=1 HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
        assert!(res.contains("x-up: 1\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\nupstr"), "{res}");
    });
}

#[test]
fn connections_are_served_independently() {
    let port = file_port(site("concurrent"));
    with_agent(91_006, port, |addr| async move {
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        let (res, _) = second
            .write_all(&b"GET /hello.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"[..])
            .await;
        res.unwrap();
        let (res, _) = first
            .write_all(&b"GET /docs/index.html HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"[..])
            .await;
        res.unwrap();
        for (stream, body) in [(&mut second, "hello, moorage\n"), (&mut first, "<p>docs</p>")] {
            let out = read_to_end(stream).await;
            assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
            assert!(out.ends_with(body), "{out}");
        }
    });
}

#[test]
fn cut_upstream_response_closes_the_client() {
    let (upstream, upstream_addr) = std_upstream();
    with_agent(91_007, warp_port(upstream_addr), move |addr| async move {
        let upstream = TcpListener::from_std(upstream).unwrap();
        monoio::spawn(upstream_once(
            upstream,
            b"HTTP/1.0 200 OK\r\nContent-Length: 100\r\n\r\nshort",
        ));
        // keep-alive request: only the close tells the client the body is short
        let res = exchange_until_closed(addr, b"GET /x HTTP/1.1\r\nHost: t\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
        assert!(res.contains("content-length: 100\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\nshort"), "{res}");
    });
}

#[test]
fn upstream_closing_before_its_head_is_a_503() {
    let (upstream, upstream_addr) = std_upstream();
    with_agent(91_008, warp_port(upstream_addr), move |addr| async move {
        let upstream = TcpListener::from_std(upstream).unwrap();
        monoio::spawn(upstream_once(upstream, b""));
        let res = exchange_until_closed(addr, b"GET /x HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{res}");
    });
}

#[test]
fn unreachable_upstream_is_a_503() {
    let (upstream, upstream_addr) = std_upstream();
    drop(upstream);
    with_agent(91_009, warp_port(upstream_addr), |addr| async move {
        let res = exchange_until_closed(addr, b"GET /x HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{res}");
    });
}

#[test]
fn unsized_upstream_body_is_relayed_chunked() {
    let (upstream, upstream_addr) = std_upstream();
    with_agent(91_010, warp_port(upstream_addr), move |addr| async move {
        let upstream = TcpListener::from_std(upstream).unwrap();
        monoio::spawn(upstream_once(upstream, b"HTTP/1.0 200 OK\r\nX-Up: 1\r\n\r\nstreamed"));
        let res = exchange_until_closed(addr, b"GET /x HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
        assert!(res.contains("transfer-encoding: chunked\r\n"), "{res}");
        assert!(res.contains("\r\nstreamed\r\n"), "{res}");
        assert!(res.ends_with("\r\n0\r\n\r\n"), "{res}");
    });
}

#[test]
fn large_file_is_streamed_whole() {
    let root = site("large");
    std::fs::write(root.join("big.bin"), vec![b'm'; 1 << 20]).unwrap();
    with_agent(91_011, file_port(root), |addr| async move {
        let res = exchange_until_closed(addr, b"GET /big.bin HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        let (head, body) = res.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("content-length: 1048576"), "{head}");
        assert_eq!(body.len(), 1 << 20);
        assert!(body.bytes().all(|b| b == b'm'));
    });
}

#[test]
fn trouble_text_replaces_error_body() {
    let mut port = file_port(site("trouble-text"));
    port.add_trouble(StatusCode::NOT_FOUND, Trouble::Text("gone fishing\n".to_owned()));
    with_agent(91_012, port, |addr| async move {
        let res = exchange(addr, b"GET /nope.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
        assert!(res.contains("content-length: 13\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\ngone fishing\n"), "{res}");
    });
}

#[test]
fn trouble_reroute_redirects() {
    let mut port = file_port(site("trouble-reroute"));
    port.add_trouble(StatusCode::NOT_FOUND, Trouble::Reroute("/hello.txt".to_owned()));
    with_agent(91_013, port, |addr| async move {
        let res = exchange(addr, b"GET /nope.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 302 Found\r\n"), "{res}");
        assert!(res.contains("location: /hello.txt\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\n"), "{res}");
    });
}

#[test]
fn trouble_guide_serves_a_page() {
    let root = site("trouble-guide");
    let mut port = file_port(root.clone());
    port.add_trouble(StatusCode::NOT_FOUND, Trouble::Guide(root.join("docs/index.html")));
    with_agent(91_014, port, |addr| async move {
        let res = exchange(addr, b"GET /nope.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
        assert!(res.starts_with("HTTP/1.1 404 Not Found\r\n"), "{res}");
        assert!(res.contains("content-type: text/html; charset=utf-8\r\n"), "{res}");
        assert!(res.ends_with("\r\n\r\n<p>docs</p>"), "{res}");
    });
}

#[cfg(unix)]
#[test]
fn cgi_requests_wait_for_a_free_slot() {
    use std::os::unix::fs::PermissionsExt;

    let root = site("cgi");
    let script = root.join("hi.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nsleep 0.2\nprintf 'Content-Type: text/plain\\r\\n\\r\\n'\necho \"hi $QUERY_STRING\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let slots = CgiSlots::new(1);
    let mut port = HttpPort::new("cgi", Timeouts::new(30, 5));
    port.route("/{*path}", Rc::new(CgiDocker::new(root, slots.clone(), 10, Reaper::new())))
        .unwrap();
    with_agent(91_015, port, move |addr| async move {
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        for (stream, req) in [
            (&mut first, &b"GET /hi.sh?a HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"[..]),
            (&mut second, &b"GET /hi.sh?b HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"[..]),
        ] {
            let (res, _) = stream.write_all(req).await;
            res.unwrap();
        }
        for (stream, body) in [(&mut first, "hi a\n"), (&mut second, "hi b\n")] {
            let res = monoio::time::timeout(Duration::from_secs(10), read_to_end(stream))
                .await
                .expect("cgi response never finished");
            assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
            assert!(res.contains("content-type: text/plain\r\n"), "{res}");
            assert!(res.contains(body), "{res}");
        }
        assert_eq!(slots.running(), 0);
    });
}

/// Echoes raw bytes once the connection switched away from HTTP.
struct Echo;

impl TourHandler for Echo {
    fn send_headers(&mut self, _: &Tour, _: &mut Wire<'_>) -> io::Result<()> {
        Ok(())
    }

    fn send_content(&mut self, _: &Tour, _: Bytes, _: Option<Post>, _: &mut Wire<'_>) -> io::Result<()> {
        Ok(())
    }

    fn send_end(&mut self, _: &Tour, _: bool, _: Option<Post>, _: &mut Wire<'_>) -> io::Result<()> {
        Ok(())
    }

    fn on_protocol_error(&mut self, _: &ProtocolError, _: &mut Wire<'_>) -> io::Result<bool> {
        Ok(true)
    }
}

impl ProtocolHandler for Echo {
    fn protocol(&self) -> &'static str {
        "echo"
    }

    fn on_read(&mut self, buf: &[u8], cx: &mut InboundCx<'_>) -> Result<NextSocketAction, ShipError> {
        cx.wire()
            .req_write(Bytes::copy_from_slice(buf), "echo", None)?;
        Ok(NextSocketAction::Continue)
    }

    fn on_tour_ended(&mut self, _: TourKey, _: &mut InboundCx<'_>) -> NextSocketAction {
        NextSocketAction::Continue
    }

    fn reset(&mut self) {}
}

async fn read_until(stream: &mut TcpStream, out: &mut String, end: &str) {
    while !out.ends_with(end) {
        let (res, buf) = stream.read(Vec::with_capacity(1024)).await;
        assert!(res.unwrap() > 0, "closed before {end:?}: {out}");
        out.push_str(std::str::from_utf8(&buf).unwrap());
    }
}

#[test]
fn upgrade_hands_the_connection_over() {
    let mut port = file_port(site("upgrade"));
    port.add_upgrade("echo", || Box::new(Echo));
    with_agent(91_016, port, |addr| async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (res, _) = stream
            .write_all(&b"GET /chat HTTP/1.1\r\nHost: t\r\nConnection: Upgrade\r\nUpgrade: Echo\r\n\r\nping"[..])
            .await;
        res.unwrap();
        let mut out = String::new();
        monoio::time::timeout(Duration::from_secs(5), read_until(&mut stream, &mut out, "ping"))
            .await
            .expect("no echo after the switch");
        assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{out}");
        assert!(out.contains("upgrade: Echo\r\n"), "{out}");
        assert!(out.ends_with("\r\n\r\nping"), "{out}");

        let (res, _) = stream.write_all(&b"pong"[..]).await;
        res.unwrap();
        let mut out = String::new();
        monoio::time::timeout(Duration::from_secs(5), read_until(&mut stream, &mut out, "pong"))
            .await
            .expect("no echo for later bytes");
        assert_eq!(out, "pong");
    });
}

#[test]
fn unknown_upgrade_is_served_as_http() {
    let mut port = file_port(site("no-upgrade"));
    port.add_upgrade("echo", || Box::new(Echo));
    with_agent(91_017, port, |addr| async move {
        let res = exchange(
            addr,
            b"GET /hello.txt HTTP/1.1\r\nHost: t\r\nConnection: close, upgrade\r\nUpgrade: h2c\r\n\r\n",
        )
        .await;
        assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
        assert!(res.ends_with("hello, moorage\n"), "{res}");
    });
}
