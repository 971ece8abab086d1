//! HTTP control server: serves the embedded control page, the Wi-Fi
//! provisioning JSON API, and the `/cmd` passthrough into the command
//! dispatcher. One listener per network interface; one connection serviced
//! at a time per listener.
//!
//! Request framing lives in `modgate-httpwire`; this module owns the socket
//! loop, the wall-clock phase bounds, the route handlers and the
//! hand-written JSON rendering (a JSON library would be the heaviest crate
//! in the image for three flat objects).

use alloc::string::String;
use core::fmt::Write as _;

use defmt::*;
use embassy_net::tcp::{Error as TcpError, TcpSocket};
use embassy_net::Stack;
use embassy_time::{with_timeout, Duration, Timer};
use modgate_httpwire::{self as httpwire, FrameError, Progress, RequestBuf, Route};

use crate::{net, services, AP_SSID};

pub const HTTP_PORT: u16 = 80;

/// Wall-clock bound for collecting the request head.
const HEADER_TIMEOUT: Duration = Duration::from_secs(5);
/// Separate bound for collecting a declared POST body.
const BODY_TIMEOUT: Duration = Duration::from_secs(5);

const JSON: &str = "application/json; charset=UTF-8";
const PLAIN: &str = "text/plain; charset=UTF-8";
const HTML: &str = "text/html; charset=UTF-8";

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[embassy_executor::task(pool_size = 2)]
pub async fn http_server_task(stack: Stack<'static>, label: &'static str) {
    let mut rx_buf = [0u8; 2048];
    let mut tx_buf = [0u8; 2048];

    info!("http: {} listener starting (port={})", label, HTTP_PORT);

    loop {
        stack.wait_config_up().await;

        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        socket.set_timeout(Some(Duration::from_secs(20)));

        match socket.accept(HTTP_PORT).await {
            Ok(()) => {
                if let Err(err) = handle_connection(&mut socket).await {
                    warn!("http: {} connection error: {:?}", label, err);
                }
            }
            Err(err) => {
                warn!("http: {} accept error: {:?}", label, err);
                Timer::after(Duration::from_millis(200)).await;
            }
        }

        socket.abort();
    }
}

enum Phase {
    Done,
    PeerClosed,
    TooLarge,
}

/// Feed socket chunks into the assembler. With `until_body_complete` unset
/// the loop returns as soon as the header terminator is in; otherwise it
/// keeps reading until the declared body has arrived.
async fn read_phase(
    socket: &mut TcpSocket<'_>,
    request: &mut RequestBuf,
    until_body_complete: bool,
) -> Result<Phase, TcpError> {
    let mut chunk = [0u8; 512];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Ok(Phase::PeerClosed);
        }
        match request.push(&chunk[..n]) {
            Ok(Progress::Complete) => return Ok(Phase::Done),
            Ok(Progress::NeedMore) => {
                if !until_body_complete && request.header_complete() {
                    return Ok(Phase::Done);
                }
            }
            Err(FrameError::TooLarge) => return Ok(Phase::TooLarge),
        }
    }
}

async fn handle_connection(socket: &mut TcpSocket<'_>) -> Result<(), TcpError> {
    let mut request = RequestBuf::new();

    // Header phase.
    match with_timeout(HEADER_TIMEOUT, read_phase(socket, &mut request, false)).await {
        Ok(Ok(Phase::Done)) => {}
        Ok(Ok(Phase::PeerClosed)) => {
            if request.is_empty() {
                return Ok(());
            }
        }
        Ok(Ok(Phase::TooLarge)) => {
            return respond(socket, "400 Bad Request", PLAIN, b"Request Too Large").await;
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            if request.is_empty() {
                return Ok(());
            }
        }
    }
    if !request.header_complete() {
        return respond(socket, "400 Bad Request", PLAIN, b"Bad Request").await;
    }

    // Body phase, POST only: route handlers only ever see a complete body.
    let is_post = matches!(request.request(), Ok(req) if req.method == "POST");
    if is_post && !request.complete() {
        match with_timeout(BODY_TIMEOUT, read_phase(socket, &mut request, true)).await {
            Ok(Ok(Phase::Done)) => {}
            Ok(Ok(Phase::TooLarge)) => {
                return respond(socket, "400 Bad Request", PLAIN, b"Request Too Large").await;
            }
            Ok(Err(err)) => return Err(err),
            Ok(Ok(Phase::PeerClosed)) | Err(_) => {
                return respond(socket, "400 Bad Request", PLAIN, b"Truncated Request Body").await;
            }
        }
    }

    let req = match request.request() {
        Ok(req) => req,
        Err(_) => return respond(socket, "400 Bad Request", PLAIN, b"Bad Request").await,
    };

    info!("http: {} {}", req.method, req.path);

    match httpwire::resolve(req.method, req.path) {
        // Unknown paths fall back to the page so captive-portal probes and
        // bookmarked URLs all land on the controls.
        Route::IndexPage | Route::Fallback => {
            respond(socket, "200 OK", HTML, INDEX_HTML.as_bytes()).await
        }
        Route::WifiScan => {
            let (status, body) = scan_json().await;
            respond(socket, status, JSON, body.as_bytes()).await
        }
        Route::WifiStatus => {
            let body = status_json();
            respond(socket, "200 OK", JSON, body.as_bytes()).await
        }
        Route::WifiConnect => handle_connect(socket, req.body).await,
        Route::Command => {
            let cmd = String::from_utf8_lossy(req.body);
            let reply = services::dispatch(cmd.trim());
            let mut body = String::new();
            body.push_str(reply.as_str());
            body.push('\n');
            respond(socket, "200 OK", PLAIN, body.as_bytes()).await
        }
        Route::Icon => respond_no_content(socket).await,
    }
}

/// `GET /wifi/scan` -> `{"aps":[{"ssid","rssi","auth"},...]}`.
async fn scan_json() -> (&'static str, String) {
    match net::scan().await {
        Ok(list) => {
            let mut body = String::new();
            body.push_str("{\"aps\":[");
            for (idx, entry) in list.iter().enumerate() {
                if idx > 0 {
                    body.push(',');
                }
                body.push_str("{\"ssid\":\"");
                write_json_string_escaped(&mut body, entry.ssid.as_str());
                let _ = write!(body, "\",\"rssi\":{},\"auth\":\"", entry.rssi);
                write_json_string_escaped(&mut body, entry.auth);
                body.push_str("\"}");
            }
            body.push_str("]}");
            ("200 OK", body)
        }
        Err(err) => {
            let mut body = String::new();
            body.push_str("{\"aps\":[],\"error\":\"");
            write_json_string_escaped(&mut body, err.as_str());
            body.push_str("\"}");
            ("500 Internal Server Error", body)
        }
    }
}

/// `GET /wifi/status`.
fn status_json() -> String {
    let state = net::wifi_snapshot();
    let mut body = String::new();

    body.push_str("{\"connected\":");
    body.push_str(if state.sta_connected { "true" } else { "false" });

    body.push_str(",\"ip\":\"");
    if let Some(ip) = state.sta_ip {
        let _ = write!(body, "{}", ip);
    }
    body.push_str("\",\"rssi\":");
    match state.rssi {
        Some(rssi) => {
            let _ = write!(body, "{}", rssi);
        }
        None => body.push_str("null"),
    }

    body.push_str(",\"ap_active\":");
    body.push_str(if state.ap_active { "true" } else { "false" });

    body.push_str(",\"ap_essid\":\"");
    write_json_string_escaped(&mut body, AP_SSID);
    body.push_str("\"}");

    body
}

/// `POST /wifi/connect` with a JSON or form body carrying `ssid` and `psk`.
/// Joining a network is a rare administrative action, so blocking this
/// connection for the connect collaborator's own timeout is accepted.
async fn handle_connect(socket: &mut TcpSocket<'_>, body: &[u8]) -> Result<(), TcpError> {
    let text = core::str::from_utf8(body).unwrap_or("");

    let ssid = httpwire::json_str_field(text, "ssid").or_else(|| httpwire::form_field(text, "ssid"));
    let psk = httpwire::json_str_field(text, "psk")
        .or_else(|| httpwire::json_str_field(text, "password"))
        .or_else(|| httpwire::form_field(text, "psk"))
        .or_else(|| httpwire::form_field(text, "password"))
        .unwrap_or("");

    let Some(ssid) = ssid.filter(|s| !s.is_empty()) else {
        return respond(
            socket,
            "400 Bad Request",
            JSON,
            b"{\"ok\":false,\"error\":\"missing ssid\"}",
        )
        .await;
    };

    info!("http: wifi connect request (ssid=\"{}\")", ssid);
    let ok = net::connect(ssid, psk).await;

    let mut out = String::new();
    if ok {
        out.push_str("{\"ok\":true,\"ip\":\"");
        if let Some(ip) = net::wifi_snapshot().sta_ip {
            let _ = write!(out, "{}", ip);
        }
        out.push_str("\"}");
    } else {
        out.push_str("{\"ok\":false,\"error\":\"connect failed\"}");
    }
    respond(socket, "200 OK", JSON, out.as_bytes()).await
}

fn write_json_string_escaped(buf: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            '"' => buf.push_str("\\\""),
            '\\' => buf.push_str("\\\\"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            c if c < ' ' => buf.push('?'),
            c => buf.push(c),
        }
    }
}

/// Write the whole response and flush; a short write mid-response abandons
/// the connection with an error rather than leaving it half-written open.
async fn respond(
    socket: &mut TcpSocket<'_>,
    status: &str,
    content_type: &str,
    body: &[u8],
) -> Result<(), TcpError> {
    let mut head = String::new();
    let _ = write!(
        head,
        "HTTP/1.1 {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        content_type,
        body.len()
    );
    write_all(socket, head.as_bytes()).await?;
    write_all(socket, body).await?;
    socket.flush().await
}

async fn respond_no_content(socket: &mut TcpSocket<'_>) -> Result<(), TcpError> {
    write_all(
        socket,
        b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await?;
    socket.flush().await
}

/// Send loop that retries on partial writes until every byte is out or the
/// transport fails.
pub(crate) async fn write_all(socket: &mut TcpSocket<'_>, mut data: &[u8]) -> Result<(), TcpError> {
    while !data.is_empty() {
        let n = socket.write(data).await?;
        if n == 0 {
            return Err(TcpError::ConnectionReset);
        }
        data = &data[n..];
    }
    Ok(())
}
