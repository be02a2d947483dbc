//! Per-connection handler.
//!
//! One cooperative task per accepted socket: a writer task drains the
//! bounded outbound queue, the reader loop feeds bytes into the frame
//! decoder and dispatches each message by type. Errors become typed
//! `error` frames; frames are never silently dropped. Socket EOF or a
//! poisoned framing state moves the session to `Closing`, cancels any
//! in-flight transfer, and unregisters from the registry.

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::router::{RouteKind, RouteRequest, PRIORITY_LOW, PRIORITY_NORMAL};
use crate::session::{ConnState, SessionHandle};
use crate::Result;
use parley_proto::{
    frame::write_frame, ErrorCode, FrameDecoder, HistoryEntry, WireMessage,
};
use parley_store::{MessageKind, SYSTEM_SENDER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Outbound queue depth per connection; overflow during fan-out falls
/// back to offline storage.
pub const OUTBOUND_QUEUE: usize = 256;

/// Most offline messages replayed at login.
const OFFLINE_DRAIN_LIMIT: u32 = 500;

/// History page size when the client does not ask for one.
const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Largest history page a client may request.
const MAX_HISTORY_LIMIT: u32 = 200;

/// Drive one client connection to completion.
pub async fn run_connection(ctx: Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%addr, error = %e, "set_nodelay failed");
    }
    let (mut read_half, mut write_half) = stream.into_split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(OUTBOUND_QUEUE);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = ctx.sessions.register(addr, outbound_tx.clone(), shutdown_tx);
    let conn_id = handle.conn_id;

    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &msg).await {
                tracing::debug!(error = %e, "outbound write failed");
                break;
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
    });

    handle.set_state(ConnState::Authenticating);
    let _ = outbound_tx
        .send(WireMessage::NicknameRequest {
            message: "Welcome to Parley. Register or log in to start chatting.".to_string(),
        })
        .await;

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];

    'conn: loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::debug!(conn_id, "session closed by server");
                break 'conn;
            }
            read = tokio::time::timeout(ctx.config.session_timeout(), read_half.read(&mut buf)) => {
                let n = match read {
                    Err(_) => {
                        // Peer sent nothing for the whole session window;
                        // fail fast with a typed timeout instead of holding
                        // the task open until the liveness sweep.
                        tracing::info!(conn_id, "read deadline expired, closing");
                        send_error(
                            &outbound_tx,
                            &ServerError::timeout("no data received within the session timeout"),
                        )
                        .await;
                        break 'conn;
                    }
                    Ok(Ok(0)) => break 'conn,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        tracing::debug!(conn_id, error = %e, "socket read failed");
                        break 'conn;
                    }
                };
                decoder.extend(&buf[..n]);

                loop {
                    match decoder.next_frame() {
                        Ok(Some(msg)) => dispatch(&ctx, &handle, &outbound_tx, msg).await,
                        Ok(None) => break,
                        Err(e) if e.is_recoverable() => {
                            send(&outbound_tx, WireMessage::error(
                                ErrorCode::InvalidInput,
                                "frame payload could not be parsed",
                            ))
                            .await;
                        }
                        Err(e) => {
                            // Length prefix is no longer trustworthy.
                            tracing::warn!(conn_id, error = %e, "unrecoverable framing error");
                            send(&outbound_tx, WireMessage::error(
                                ErrorCode::InvalidInput,
                                "protocol violation, closing connection",
                            ))
                            .await;
                            break 'conn;
                        }
                    }
                }
            }
        }
    }

    // Tear-down: session state, transfers, presence, registry.
    handle.set_state(ConnState::Closing);
    ctx.transfers.cancel_connection(conn_id).await;

    if let Some(user) = handle.user() {
        if let Err(e) = ctx.store.set_online(user.user_id, false).await {
            tracing::debug!(user_id = user.user_id, error = %e, "offline mirror failed");
        }
    }
    ctx.sessions.unregister(conn_id);
    announce_public_presence(&ctx).await;

    // The handle holds an outbound sender clone; both must go before the
    // writer can observe channel closure and drain out.
    drop(handle);
    drop(outbound_tx);
    let _ = writer.await;
    tracing::info!(conn_id, %addr, "connection closed");
}

async fn send(tx: &mpsc::Sender<WireMessage>, msg: WireMessage) {
    // A failed send means the writer is gone; the read loop will notice.
    let _ = tx.send(msg).await;
}

async fn send_error(tx: &mpsc::Sender<WireMessage>, err: &ServerError) {
    send(tx, WireMessage::error(err.code(), err.to_string())).await;
}

async fn dispatch(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    msg: WireMessage,
) {
    let authed = handle.user();

    if authed.is_none() && !msg.allowed_before_auth() {
        send_error(tx, &ServerError::AuthRequired).await;
        return;
    }
    if let Some(user) = &authed {
        ctx.sessions.update_activity(user.user_id);
    }

    let msg_type = msg.type_name();
    let result = match msg {
        WireMessage::Register { username, password } => {
            handle_register(ctx, handle, tx, &username, &password).await
        }
        WireMessage::Login { username, password } => {
            handle_login(ctx, handle, tx, &username, &password).await
        }
        WireMessage::Logout => handle_logout(ctx, handle).await,
        WireMessage::Ping { timestamp } => handle_ping(handle, tx, timestamp).await,
        WireMessage::Pong { .. } => {
            handle.touch_ping(None);
            Ok(())
        }
        WireMessage::Chat {
            group_id, content, ..
        } => handle_chat(ctx, handle, group_id, &content).await,
        WireMessage::Private {
            target_user,
            content,
            ..
        } => handle_private(ctx, handle, target_user.as_deref(), &content).await,
        WireMessage::JoinGroup { group_id, name } => {
            handle_join_group(ctx, handle, tx, group_id, name.as_deref()).await
        }
        WireMessage::LeaveGroup { group_id } => {
            handle_leave_group(ctx, handle, tx, group_id).await
        }
        WireMessage::CreateGroup {
            name,
            is_private,
            members,
        } => handle_create_group(ctx, handle, tx, &name, is_private, &members).await,
        WireMessage::HistoryRequest {
            group_id,
            limit,
            before_id,
        } => handle_history(ctx, handle, tx, group_id, limit, before_id).await,
        WireMessage::UploadRequest {
            filename,
            file_size,
            mime_type,
            checksum,
            chunk_size,
            group_id,
        } => {
            handle_upload_request(
                ctx, handle, tx, &filename, file_size, &mime_type, &checksum, chunk_size, group_id,
            )
            .await
        }
        WireMessage::UploadChunk {
            file_id,
            chunk_index,
            data,
            chunk_checksum,
        } => {
            ctx.transfers
                .put_chunk(handle.conn_id, &file_id, chunk_index, &data, &chunk_checksum)
                .await
        }
        WireMessage::UploadComplete { file_id } => {
            handle_upload_complete(ctx, handle, tx, &file_id).await
        }
        WireMessage::DownloadRequest {
            file_id,
            range_start,
            range_end,
        } => handle_download_request(ctx, handle, tx, &file_id, range_start, range_end).await,
        WireMessage::DownloadComplete { file_id } => {
            ctx.transfers.complete_download(handle.conn_id, &file_id);
            Ok(())
        }
        // Server-to-client frames arriving from a client are protocol
        // misuse.
        other => {
            tracing::debug!(msg_type = other.type_name(), "unexpected client frame");
            Err(ServerError::invalid_input("unexpected message type"))
        }
    };

    if let Err(e) = result {
        tracing::debug!(msg_type, error = %e, "request failed");
        send_error(tx, &e).await;
    }
}

// ============ Auth ============

async fn handle_register(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    username: &str,
    password: &str,
) -> Result<()> {
    let user_id = ctx.auth.register(username, password).await?;

    send(
        tx,
        WireMessage::RegisterResponse {
            success: true,
            user_id: Some(user_id),
            message: format!("welcome, {username}"),
        },
    )
    .await;

    // Registration logs the fresh account in on this connection.
    let outcome = ctx.auth.login(handle.conn_id, username, password).await?;
    finish_login(ctx, tx, outcome.user.id, &outcome.user.username, &outcome.token, 0).await;
    Ok(())
}

async fn handle_login(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    username: &str,
    password: &str,
) -> Result<()> {
    let outcome = ctx.auth.login(handle.conn_id, username, password).await?;

    // Replay the offline queue before any new traffic reaches this
    // connection: the frames go straight onto our own outbound queue.
    let queued = ctx
        .store
        .drain_offline(outcome.user.id, OFFLINE_DRAIN_LIMIT)
        .await?;

    finish_login(
        ctx,
        tx,
        outcome.user.id,
        &outcome.user.username,
        &outcome.token,
        queued.len() as u32,
    )
    .await;

    for row in queued {
        match serde_json::from_str::<WireMessage>(&row.payload) {
            Ok(frame) => send(tx, frame).await,
            Err(e) => {
                tracing::warn!(row_id = row.id, error = %e, "offline payload undecodable, skipped")
            }
        }
    }
    Ok(())
}

async fn finish_login(
    ctx: &Arc<ServerContext>,
    tx: &mpsc::Sender<WireMessage>,
    user_id: i64,
    username: &str,
    token: &str,
    offline_count: u32,
) {
    send(
        tx,
        WireMessage::LoginResponse {
            success: true,
            user_id: Some(user_id),
            username: Some(username.to_string()),
            session_token: Some(token.to_string()),
            offline_count,
            message: format!("logged in as {username}"),
        },
    )
    .await;
    announce_public_presence(ctx).await;
}

async fn handle_logout(ctx: &Arc<ServerContext>, handle: &Arc<SessionHandle>) -> Result<()> {
    ctx.auth.logout(handle.conn_id).await?;
    handle.close();
    Ok(())
}

async fn handle_ping(
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    timestamp: i64,
) -> Result<()> {
    let now_millis = chrono::Utc::now().timestamp_millis();
    let latency = (now_millis - timestamp >= 0).then_some(now_millis - timestamp);
    handle.touch_ping(latency);
    send(tx, WireMessage::Pong { timestamp }).await;
    Ok(())
}

// ============ Chat ============

async fn handle_chat(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    group_id: i64,
    content: &str,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;

    if !ctx.groups.is_member(group_id, user.user_id).await? {
        return Err(ServerError::NotAMember(group_id));
    }

    let (message_id, timestamp) = ctx
        .store
        .save_message(group_id, user.user_id, content, MessageKind::Text)
        .await?;

    let frame = WireMessage::Chat {
        group_id,
        content: content.to_string(),
        sender_id: Some(user.user_id),
        sender_username: Some(user.username.clone()),
        timestamp: Some(timestamp),
        message_id: Some(message_id),
    };
    ctx.router.submit(RouteRequest {
        message_id: Some(message_id),
        sender_id: user.user_id,
        kind: RouteKind::Group { group_id },
        priority: PRIORITY_NORMAL,
        transient: false,
        payload: frame,
    })?;

    if let Some(ai) = &ctx.ai {
        if let Some(question) = ai.detect_mention(content) {
            spawn_assistant_reply(ctx, Arc::clone(ai), group_id, user.user_id, user.username, question);
        }
    }
    Ok(())
}

/// Ask the assistant off the dispatch path and route the reply as a
/// normal group message from the system pseudo-user.
fn spawn_assistant_reply(
    ctx: &Arc<ServerContext>,
    ai: Arc<crate::ai::AiRelay>,
    group_id: i64,
    sender_id: i64,
    sender_name: String,
    question: String,
) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        let reply = ai.respond(group_id, sender_id, &sender_name, &question).await;

        let saved = ctx
            .store
            .save_message(group_id, SYSTEM_SENDER, &reply, MessageKind::Ai)
            .await;
        let (message_id, timestamp) = match saved {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(group_id, error = %e, "assistant reply not persisted");
                return;
            }
        };

        let frame = WireMessage::Chat {
            group_id,
            content: reply,
            sender_id: Some(SYSTEM_SENDER),
            sender_username: Some("assistant".to_string()),
            timestamp: Some(timestamp),
            message_id: Some(message_id),
        };
        if let Err(e) = ctx.router.submit(RouteRequest {
            message_id: Some(message_id),
            sender_id: SYSTEM_SENDER,
            kind: RouteKind::Group { group_id },
            priority: PRIORITY_NORMAL,
            transient: false,
            payload: frame,
        }) {
            tracing::warn!(group_id, error = %e, "assistant reply not routed");
        }
    });
}

async fn handle_private(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    target_user: Option<&str>,
    content: &str,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    let target_name =
        target_user.ok_or_else(|| ServerError::invalid_input("target_user is required"))?;

    if content.chars().count() > parley_store::MAX_CONTENT_LEN {
        return Err(ServerError::MessageTooLong);
    }
    if ctx.store.get_user(user.user_id).await?.is_banned {
        return Err(ServerError::UserBanned);
    }

    let target = ctx
        .store
        .get_user_by_name(target_name)
        .await
        .map_err(ServerError::from)?
        .ok_or(ServerError::UserNotFound)?;

    let frame = WireMessage::Private {
        target_user: Some(target.username.clone()),
        content: content.to_string(),
        sender_id: Some(user.user_id),
        sender_username: Some(user.username.clone()),
        timestamp: Some(chrono::Utc::now()),
        message_id: None,
    };
    ctx.router.submit(RouteRequest {
        message_id: None,
        sender_id: user.user_id,
        kind: RouteKind::Private {
            target_user: target.id,
        },
        priority: PRIORITY_NORMAL,
        transient: false,
        payload: frame,
    })?;
    Ok(())
}

// ============ Groups ============

async fn handle_join_group(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    group_id: Option<i64>,
    name: Option<&str>,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;

    let group = match (group_id, name) {
        (Some(id), _) => ctx.groups.get(id).await?,
        (None, Some(name)) => ctx.groups.get_by_name(name).await?,
        (None, None) => {
            return Err(ServerError::invalid_input("group_id or name is required"));
        }
    };

    let group = ctx.groups.join(user.user_id, group.id).await?;
    send(
        tx,
        WireMessage::GroupResponse {
            success: true,
            group_id: Some(group.id),
            name: Some(group.name.clone()),
            message: format!("joined {}", group.name),
        },
    )
    .await;
    announce_group_presence(ctx, group.id, &format!("{} joined", user.username)).await;
    Ok(())
}

async fn handle_leave_group(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    group_id: i64,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    let group = ctx.groups.leave(user.user_id, group_id).await?;

    send(
        tx,
        WireMessage::GroupResponse {
            success: true,
            group_id: Some(group.id),
            name: Some(group.name.clone()),
            message: format!("left {}", group.name),
        },
    )
    .await;
    announce_group_presence(ctx, group.id, &format!("{} left", user.username)).await;
    Ok(())
}

async fn handle_create_group(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    name: &str,
    is_private: bool,
    members: &[String],
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    let group = ctx
        .groups
        .create_group(user.user_id, name, is_private, members)
        .await?;

    send(
        tx,
        WireMessage::GroupResponse {
            success: true,
            group_id: Some(group.id),
            name: Some(group.name),
            message: "group created".to_string(),
        },
    )
    .await;
    Ok(())
}

async fn handle_history(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    group_id: i64,
    limit: Option<u32>,
    before_id: Option<i64>,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    if !ctx.groups.is_member(group_id, user.user_id).await? {
        return Err(ServerError::NotAMember(group_id));
    }

    let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);
    let (rows, has_more) = ctx.store.get_history(group_id, limit, before_id).await?;

    let messages = rows
        .into_iter()
        .map(|r| HistoryEntry {
            message_id: r.message_id,
            group_id: r.group_id,
            sender_id: r.sender_id,
            sender_username: r.sender_username,
            content: r.content,
            message_type: r.message_type.as_str().to_string(),
            timestamp: r.timestamp,
        })
        .collect();

    send(
        tx,
        WireMessage::HistoryResponse {
            group_id,
            messages,
            has_more,
        },
    )
    .await;
    Ok(())
}

// ============ File transfer ============

#[allow(clippy::too_many_arguments)]
async fn handle_upload_request(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    filename: &str,
    file_size: u64,
    mime_type: &str,
    checksum: &str,
    chunk_size: usize,
    group_id: i64,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    if !ctx.groups.is_member(group_id, user.user_id).await? {
        return Err(ServerError::NotAMember(group_id));
    }

    let accepted = ctx
        .transfers
        .begin_upload(
            handle.conn_id,
            user.user_id,
            group_id,
            filename,
            file_size,
            mime_type,
            checksum,
            chunk_size,
        )
        .await;

    // Upload handshake failures answer in-band, not with an error frame.
    let response = match accepted {
        Ok(ticket) => WireMessage::UploadResponse {
            success: true,
            file_id: Some(ticket.file_id),
            chunk_size: Some(ticket.chunk_size),
            total_chunks: Some(ticket.total_chunks),
            error_code: None,
            message: "upload accepted".to_string(),
        },
        Err(e) => WireMessage::UploadResponse {
            success: false,
            file_id: None,
            chunk_size: None,
            total_chunks: None,
            error_code: Some(e.code()),
            message: e.to_string(),
        },
    };
    send(tx, response).await;
    Ok(())
}

async fn handle_upload_complete(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    file_id: &str,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;
    let done = ctx.transfers.complete_upload(handle.conn_id, file_id).await?;

    // The announcement message and the metadata row reference each other;
    // message first so the row can carry its id.
    let announcement = format!("[file] {} ({} bytes)", done.filename, done.file_size);
    let (message_id, timestamp) = ctx
        .store
        .save_message(done.group_id, user.user_id, &announcement, MessageKind::File)
        .await?;

    ctx.store
        .save_file_metadata(
            &done.file_id,
            &done.filename,
            done.final_path.to_string_lossy().as_ref(),
            done.file_size as i64,
            &done.checksum,
            done.uploader_id,
            done.group_id,
            Some(message_id),
        )
        .await?;

    send(
        tx,
        WireMessage::UploadResponse {
            success: true,
            file_id: Some(done.file_id.clone()),
            chunk_size: None,
            total_chunks: None,
            error_code: None,
            message: "upload complete".to_string(),
        },
    )
    .await;

    let frame = WireMessage::Chat {
        group_id: done.group_id,
        content: announcement,
        sender_id: Some(user.user_id),
        sender_username: Some(user.username.clone()),
        timestamp: Some(timestamp),
        message_id: Some(message_id),
    };
    ctx.router.submit(RouteRequest {
        message_id: Some(message_id),
        sender_id: user.user_id,
        kind: RouteKind::Group {
            group_id: done.group_id,
        },
        priority: PRIORITY_NORMAL,
        transient: false,
        payload: frame,
    })?;
    Ok(())
}

async fn handle_download_request(
    ctx: &Arc<ServerContext>,
    handle: &Arc<SessionHandle>,
    tx: &mpsc::Sender<WireMessage>,
    file_id: &str,
    range_start: Option<u64>,
    range_end: Option<u64>,
) -> Result<()> {
    let user = handle.user().ok_or(ServerError::AuthRequired)?;

    let record = ctx.store.get_file(file_id).await.map_err(ServerError::from)?;
    if !ctx.groups.is_member(record.group_id, user.user_id).await? {
        return Err(ServerError::NotAMember(record.group_id));
    }

    let (record, chunk_size, total_chunks) = ctx
        .transfers
        .begin_download(handle.conn_id, file_id, range_start, range_end)
        .await?;

    let uploader = ctx
        .store
        .get_user(record.uploader_id)
        .await
        .map(|u| u.username)
        .unwrap_or_else(|_| "unknown".to_string());

    send(
        tx,
        WireMessage::DownloadResponse {
            success: true,
            file: Some(parley_proto::FileInfo {
                file_id: record.file_id.clone(),
                original_filename: record.original_filename.clone(),
                file_size: record.file_size as u64,
                checksum: record.checksum.clone(),
                uploader,
                group_id: record.group_id,
                upload_time: record.upload_time,
            }),
            chunk_size: Some(chunk_size),
            total_chunks: Some(total_chunks),
            error_code: None,
            message: "download starting".to_string(),
        },
    )
    .await;

    // Stream chunks from a side task; chat frames interleave freely on
    // the same outbound queue.
    let ctx = Arc::clone(ctx);
    let tx = tx.clone();
    let conn_id = handle.conn_id;
    tokio::spawn(async move {
        loop {
            match ctx.transfers.next_download_chunk(conn_id).await {
                Ok(Some(chunk)) => {
                    let frame = WireMessage::DownloadChunk {
                        file_id: chunk.file_id,
                        chunk_index: chunk.chunk_index,
                        data: chunk.data,
                        chunk_checksum: chunk.checksum,
                    };
                    if tx.send(frame).await.is_err() {
                        return; // connection went away
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "download stream ended");
                    return;
                }
            }
        }
    });
    Ok(())
}

// ============ Presence ============

/// Push a fresh member list of the public group to its online members.
async fn announce_public_presence(ctx: &Arc<ServerContext>) {
    let Ok(public) = ctx.store.public_group().await else {
        return;
    };
    announce_group_presence(ctx, public.id, "presence update").await;
}

async fn announce_group_presence(ctx: &Arc<ServerContext>, group_id: i64, note: &str) {
    let users = match ctx.groups.user_entries(group_id).await {
        Ok(users) => users,
        Err(e) => {
            tracing::debug!(group_id, error = %e, "presence enumeration failed");
            return;
        }
    };

    let frame = WireMessage::UserList {
        users,
        message: note.to_string(),
    };
    if let Err(e) = ctx.router.submit(RouteRequest {
        message_id: None,
        sender_id: SYSTEM_SENDER,
        kind: RouteKind::System {
            target_group: Some(group_id),
            target_user: None,
        },
        priority: PRIORITY_LOW,
        transient: true,
        payload: frame,
    }) {
        tracing::debug!(group_id, error = %e, "presence update not routed");
    }
}
