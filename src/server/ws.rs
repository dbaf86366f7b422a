use super::api::BoxBody;
use super::ManagerState;
use crate::events::topic;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

pub fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Browsers cannot set headers on WS connects, so the shared secret rides in
/// a `token` query parameter instead.
fn ws_authorized(req: &Request<Incoming>, state: &ManagerState) -> bool {
    let settings = state.control.settings_snapshot();
    if settings.clash_api_secret.is_empty() {
        return true;
    }
    req.uri()
        .query()
        .and_then(|q| {
            q.split('&').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                (k == "token").then(|| v.to_string())
            })
        })
        .map(|token| token == settings.clash_api_secret)
        .unwrap_or(false)
}

/// Complete the handshake and hand the upgraded stream to the endpoint task.
pub fn handle_upgrade(mut req: Request<Incoming>, state: ManagerState) -> Response<BoxBody> {
    let path = req.uri().path().to_string();

    if !ws_authorized(&req, &state) {
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(empty_body())
            .expect("static response parts");
    }

    let Some(key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(empty_body())
            .expect("static response parts");
    };
    let accept = derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!("ws: upgrade failed, path={}, error={}", path, e);
                return;
            }
        };
        let stream =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

        metrics::gauge!("manager_ws_clients").increment(1.0);
        match path.as_str() {
            "/api/verify/ws" => verify_stream(stream, state).await,
            "/api/monitoring/ws/connections" => connections_relay(stream, state).await,
            other => debug!("ws: no endpoint for path={}", other),
        }
        metrics::gauge!("manager_ws_clients").decrement(1.0);
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header("sec-websocket-accept", accept)
        .body(empty_body())
        .expect("static response parts")
}

/// Streams verification pipeline events as JSON frames until the client
/// leaves.
async fn verify_stream<S>(ws: WebSocketStream<S>, state: ManagerState)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut events = state.events.subscribe(&[
        topic::VERIFY_START,
        topic::VERIFY_PROGRESS,
        topic::VERIFY_NODE_PROMOTED,
        topic::VERIFY_NODE_DEMOTED,
        topic::VERIFY_NODE_ARCHIVED,
        topic::VERIFY_COMPLETE,
        topic::PROBE_START,
        topic::PROBE_STOP,
    ]);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Pings are answered by the protocol layer; data frames
                    // from the client are ignored.
                    _ => {}
                }
            }
        }
    }
    debug!("ws: verify stream closed");
}

/// Relays the kernel control plane's live connections feed to the client.
async fn connections_relay<S>(ws: WebSocketStream<S>, state: ManagerState)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let settings = state.control.settings_snapshot();
    let mut upstream_url = format!(
        "ws://127.0.0.1:{}/connections",
        settings.clash_api_port
    );
    if !settings.clash_api_secret.is_empty() {
        upstream_url.push_str(&format!("?token={}", settings.clash_api_secret));
    }

    let (mut sink, mut source) = ws.split();

    let upstream = match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            warn!("ws: kernel connections feed unavailable: {}", e);
            let frame = serde_json::json!({"error": "kernel control plane unavailable"});
            let _ = sink.send(Message::Text(frame.to_string())).await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    let (mut up_sink, mut up_source) = upstream.split();

    loop {
        tokio::select! {
            frame = up_source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            msg = source.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = up_sink.send(Message::Close(None)).await;
    debug!("ws: connections relay closed");
}
