/// Messenger REST API + SSE: HTTP surface over the chat service
///
/// Identity comes from the auth layer in front of this server as
/// `X-User-Id` / `X-Branch-Id` headers. Roster writes instead carry the
/// roster service's shared secret in `X-Roster-Token`.
///
/// Endpoints:
///   GET  /api/conversations
///   GET  /api/conversations/:cid/messages
///   POST /api/conversations/:cid/messages    body: {"text":"..."}
///   POST /api/conversations/:cid/clear
///   POST /api/conversations/:cid/delete      body: {"message_ids":["..."]}
///   POST /api/conversations/:cid/typing      body: {"typing":true,"ttl_ms":2000}
///   POST /api/messages/:id/delivered
///   POST /api/messages/:id/read
///   POST /api/presence                       body: {"online":true,"scope":"..."|null}
///   POST /api/presence/heartbeat             body: {"scope":"..."|null}
///   PUT  /api/roster/:branch                 body: [RosterEntry, ...]
///   GET  /events                             SSE stream of the caller's ChatEvent JSON
use crate::chat_types::{ConversationId, Identity, MessageId, RosterEntry, ScopeId};
use crate::error::{ChatError, Result};
use crate::service::ChatService;
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: http::response::Builder) -> http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, PUT, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type, X-User-Id, X-Branch-Id, X-Roster-Token")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, serde_json::to_vec(&value).unwrap_or_default())
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

pub fn status_for(e: &ChatError) -> StatusCode {
    match e {
        ChatError::Validation(_) | ChatError::Serialization(_) => StatusCode::BAD_REQUEST,
        ChatError::Unauthorized(_) => StatusCode::FORBIDDEN,
        ChatError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_resp(e: &ChatError) -> Resp {
    let status = status_for(e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Messenger API internal error: {}", e);
    }
    json_err(status, &e.to_string())
}

fn sse_resp(rx: broadcast::Receiver<crate::chat_types::ChatEvent>) -> Resp {
    // Keepalive comment sent immediately so the client knows the connection is live
    let initial = bytes::Bytes::from(": connected\n\n");
    let first = futures_util::stream::once(async move {
        Ok::<Frame<bytes::Bytes>, Infallible>(Frame::data(initial))
    });

    let events = unfold(rx, |mut rx| async move {
        let data = match rx.recv().await {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                format!("data: {}\n\n", json)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Client refetches its state when it sees this event
                warn!("SSE client lagged {} events", n);
                "event: lagged\ndata: {}\n\n".to_string()
            }
            Err(_) => return None, // channel closed
        };
        let frame = Frame::data(bytes::Bytes::from(data));
        Some((Ok::<_, Infallible>(frame), rx))
    });

    let stream = first.chain(events);
    cors_headers(Response::builder())
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream; charset=utf-8")
        .header("Cache-Control", "no-cache")
        .header("X-Accel-Buffering", "no") // disable nginx buffering
        .body(StreamBody::new(stream).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_messenger_api(service: ChatService, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await.map_err(ChatError::Io)?;
    info!("Messenger API started on http://{}", addr);
    serve(listener, service).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, service: ChatService) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let service = service.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let service = service.clone();
                        async move { Ok::<_, Infallible>(handle(req, service).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Ignore client-disconnect errors (normal for SSE)
                        if !e.is_incomplete_message() {
                            error!("Messenger API connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Messenger API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle(req: Request<hyper::body::Incoming>, service: ChatService) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    // Roster input comes from the roster service, not a signed-in user
    if method == Method::PUT {
        if let Some(branch) = path.strip_prefix("/api/roster/") {
            if let Err(e) = check_roster_token(req.headers(), service.config().roster_token.as_deref()) {
                warn!("Rejected roster write for {}: {}", branch, e);
                return error_resp(&e);
            }
            return match decode_segment(branch) {
                Ok(branch) => put_roster(req, &branch, &service).await,
                Err(e) => error_resp(&e),
            };
        }
    }

    let caller = match identity_from_headers(req.headers()) {
        Ok(identity) => identity,
        Err(e) => return error_resp(&e),
    };

    let result = match (method.clone(), path.as_str()) {
        (Method::GET, "/api/conversations") => get_conversations(&caller, &service).await,
        (Method::POST, "/api/presence") => post_presence(req, &caller, &service).await,
        (Method::POST, "/api/presence/heartbeat") => post_heartbeat(req, &caller, &service).await,
        (Method::GET, "/events") => {
            return match service.subscribe_inbox(&caller).await {
                Ok(rx) => sse_resp(rx),
                Err(e) => error_resp(&e),
            };
        }
        _ => route_dynamic(method, &path, req, &caller, &service).await,
    };

    match result {
        Ok(resp) => resp,
        Err(e) => error_resp(&e),
    }
}

async fn route_dynamic(
    method: Method,
    path: &str,
    req: Request<hyper::body::Incoming>,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    if let Some(rest) = path.strip_prefix("/api/conversations/") {
        if let Some((cid, action)) = rest.rsplit_once('/') {
            let conversation = ConversationId::parse(&decode_segment(cid)?)?;
            return match (method, action) {
                (Method::GET, "messages") => get_messages(&conversation, caller, service).await,
                (Method::POST, "messages") => post_send(req, &conversation, caller, service).await,
                (Method::POST, "clear") => {
                    let horizon = service.clear_chat(caller, &conversation).await?;
                    Ok(json_ok(serde_json::json!({ "horizon": horizon })))
                }
                (Method::POST, "delete") => post_delete(req, &conversation, caller, service).await,
                (Method::POST, "typing") => post_typing(req, &conversation, caller, service).await,
                _ => Ok(json_err(StatusCode::NOT_FOUND, "not found")),
            };
        }
    }

    if let Some(rest) = path.strip_prefix("/api/messages/") {
        if let Some((id, action)) = rest.rsplit_once('/') {
            let id = MessageId(decode_segment(id)?);
            let transition = match (method, action) {
                (Method::POST, "delivered") => service.mark_delivered(caller, &id).await?,
                (Method::POST, "read") => service.mark_read(caller, &id).await?,
                _ => return Ok(json_err(StatusCode::NOT_FOUND, "not found")),
            };
            return Ok(json_ok(serde_json::json!({ "transition": transition })));
        }
    }

    Ok(json_err(StatusCode::NOT_FOUND, "not found"))
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_conversations(caller: &Identity, service: &ChatService) -> Result<Resp> {
    let conversations = service.list_conversations(caller).await?;
    Ok(json_ok(serde_json::json!({ "conversations": conversations })))
}

async fn get_messages(
    conversation: &ConversationId,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let messages = service.visible_messages(caller, conversation).await?;
    let unread = crate::unread::unread_count(&messages, &caller.user_id);
    Ok(json_ok(serde_json::json!({
        "conversation_id": conversation,
        "messages": messages,
        "unread_count": unread,
    })))
}

#[derive(Deserialize)]
struct SendRequest {
    text: String,
}

async fn post_send(
    req: Request<hyper::body::Incoming>,
    conversation: &ConversationId,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let r: SendRequest = read_json(req).await?;
    let message = service.send(caller, conversation, &r.text).await?;
    Ok(json_ok(serde_json::json!({ "message": message })))
}

#[derive(Deserialize)]
struct DeleteRequest {
    message_ids: Vec<MessageId>,
}

async fn post_delete(
    req: Request<hyper::body::Incoming>,
    conversation: &ConversationId,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let r: DeleteRequest = read_json(req).await?;
    let hidden = service.delete_selected(caller, conversation, &r.message_ids).await?;
    Ok(json_ok(serde_json::json!({ "hidden": hidden })))
}

#[derive(Deserialize)]
struct TypingRequest {
    typing: bool,
    ttl_ms: Option<u64>,
}

async fn post_typing(
    req: Request<hyper::body::Incoming>,
    conversation: &ConversationId,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let r: TypingRequest = read_json(req).await?;
    let signal = if r.typing {
        let ttl = r.ttl_ms.map(Duration::from_millis);
        service.start_typing(caller, conversation, ttl).await?
    } else {
        service.stop_typing(caller, conversation).await?
    };
    Ok(json_ok(serde_json::json!({ "signal": signal })))
}

#[derive(Deserialize)]
struct PresenceRequest {
    online: bool,
    scope: Option<ScopeId>,
}

async fn post_presence(
    req: Request<hyper::body::Incoming>,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let r: PresenceRequest = read_json(req).await?;
    let scope = r.scope.unwrap_or_else(|| ScopeId::branch(&caller.branch_id));
    let record = if r.online {
        service.set_online(caller, &scope).await?
    } else {
        service.set_offline(caller, &scope).await?
    };
    Ok(json_ok(serde_json::json!({ "presence": record })))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    scope: Option<ScopeId>,
}

async fn post_heartbeat(
    req: Request<hyper::body::Incoming>,
    caller: &Identity,
    service: &ChatService,
) -> Result<Resp> {
    let r: HeartbeatRequest = read_json(req).await?;
    let scope = r.scope.unwrap_or_else(|| ScopeId::branch(&caller.branch_id));
    let alive = service.heartbeat(caller, &scope).await?;
    Ok(json_ok(serde_json::json!({ "alive": alive })))
}

async fn put_roster(req: Request<hyper::body::Incoming>, branch: &str, service: &ChatService) -> Resp {
    let entries: Vec<RosterEntry> = match read_json(req).await {
        Ok(e) => e,
        Err(e) => return error_resp(&e),
    };
    let count = entries.len();
    match service.roster().replace_branch(&branch.into(), entries).await {
        Ok(()) => json_ok(serde_json::json!({ "members": count })),
        Err(e) => error_resp(&e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

fn identity_from_headers(headers: &HeaderMap) -> Result<Identity> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| ChatError::Unauthorized(format!("missing {} header", name)))
    };
    let identity = Identity::new(header("X-User-Id")?, header("X-Branch-Id")?);
    identity.validate()?;
    Ok(identity)
}

fn check_roster_token(headers: &HeaderMap, expected: Option<&str>) -> Result<()> {
    let expected = expected
        .ok_or_else(|| ChatError::Unauthorized("roster writes are disabled".to_string()))?;
    let presented = headers
        .get("X-Roster-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    match presented {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ChatError::Unauthorized("invalid roster token".to_string())),
        None => Err(ChatError::Unauthorized("missing X-Roster-Token header".to_string())),
    }
}

fn decode_segment(segment: &str) -> Result<String> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|e| ChatError::Validation(format!("bad path segment: {}", e)))
}

async fn read_json<T: DeserializeOwned>(req: Request<hyper::body::Incoming>) -> Result<T> {
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| ChatError::Validation(format!("body read error: {}", e)))?;
    serde_json::from_slice(&body).map_err(ChatError::Serialization)
}
