//! Per-socket connection handling.
//!
//! Each accepted websocket runs a reader (this task) and a writer task.
//! The reader parses frames, applies the policy gates and dispatches
//! commands; the writer drains the bounded frame queue, answers hub ping
//! ticks and handles out-of-band control frames (ban, refresh, close).

use crate::backend::Backend;
use crate::bans::far_future_secs;
use crate::error::{HandlerError, HandlerResult};
use crate::hub::{ControlFrame, Registration, PING_QUEUE_SIZE, SEND_QUEUE_SIZE};
use crate::proto::{
    self, BanIn, ClientCommand, EventDataOut, MsgIn, MuteIn, PingOut, PrivmsgIn, SimpleIn,
    MAX_FRAME_BYTES,
};
use crate::rares::transform_rares;
use crate::user::{User, Userid, ISADMIN};
use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// A ping left unanswered this long closes the connection.
pub const PING_TIMEOUT_MS: i64 = 30_000;

pub const DEFAULT_MUTE_DURATION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_BAN_DURATION: Duration = Duration::from_secs(60 * 60);

/// Run one accepted socket to completion.
pub async fn run(socket: WebSocket, user: Option<User>, ip: String, backend: Arc<Backend>) {
    let id = backend.hub.next_conn_id();
    let (frames_tx, frames_rx) = mpsc::channel::<Arc<String>>(SEND_QUEUE_SIZE);
    let (ping_tx, ping_rx) = mpsc::channel::<i64>(PING_QUEUE_SIZE);
    let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlFrame>();
    let last_pong = Arc::new(AtomicI64::new(0));

    // there is only ever one User per id; the names cache makes sure of that
    let user = match user {
        Some(user) => Some(backend.names.add(user)),
        None => {
            backend.names.add_connection();
            None
        }
    };
    let first_connection = user
        .as_ref()
        .is_some_and(|u| u.connections.load(Ordering::SeqCst) == 1);

    backend
        .hub
        .register(Registration {
            id,
            user: user.clone(),
            ip: ip.clone(),
            frames: frames_tx.clone(),
            ping: ping_tx,
            control: control_tx.clone(),
        })
        .await;

    // hand the roster to the new socket before anything else
    let roster = backend.names.payload();
    let _ = frames_tx.try_send(Arc::new(proto::pack("NAMES", &roster)));

    if first_connection {
        if let Some(user) = &user {
            backend.extractor.add_nick(&user.nick());
            backend
                .hub
                .broadcast("JOIN", &EventDataOut::user_event(user.simplified()))
                .await;
        }
    }

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(run_writer(
        sink,
        frames_rx,
        ping_rx,
        control_rx,
        last_pong.clone(),
    ));

    let ctx = ConnCtx {
        user: user.clone(),
        ip,
        backend: backend.clone(),
        frames: frames_tx,
        last_pong,
    };
    read_loop(stream, &ctx).await;

    backend.hub.unregister(id);
    let _ = control_tx.send(ControlFrame::Close);

    match &user {
        Some(user) => {
            if backend.names.disconnect(user) {
                backend.extractor.remove_nick(&user.nick());
                backend
                    .hub
                    .broadcast("QUIT", &EventDataOut::user_event(user.simplified()))
                    .await;
            }
        }
        None => backend.names.remove_connection(),
    }

    let _ = writer.await;
}

async fn read_loop(mut stream: SplitStream<WebSocket>, ctx: &ConnCtx) {
    loop {
        let message = match tokio::time::timeout(READ_TIMEOUT, stream.next()).await {
            Err(_) => {
                debug!("read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "socket error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    ctx.send_error(HandlerError::TooLong.code());
                    break;
                }
                if let Err(e) = dispatch(ctx, text.as_str()).await {
                    ctx.send_error(e.code());
                    if e.closes_connection() {
                        break;
                    }
                }
            }
            Message::Binary(_) => {
                ctx.send_error(HandlerError::BadPayload.code());
                break;
            }
            Message::Close(_) => break,
            // websocket-level ping/pong is handled by the transport
            _ => {}
        }
    }
}

/// Parse and execute one inbound frame.
pub async fn dispatch(ctx: &ConnCtx, frame: &str) -> HandlerResult {
    match ClientCommand::parse(frame)? {
        ClientCommand::Msg(msg) => handle_msg(ctx, msg).await,
        ClientCommand::Privmsg(msg) => handle_privmsg(ctx, msg).await,
        ClientCommand::Mute(msg) => handle_mute(ctx, msg).await,
        ClientCommand::Unmute(msg) => handle_unmute(ctx, msg).await,
        ClientCommand::Ban(msg) => handle_ban(ctx, msg).await,
        ClientCommand::Unban(msg) => handle_unban(ctx, msg).await,
        ClientCommand::Subonly(msg) => handle_subonly(ctx, msg).await,
        ClientCommand::Broadcast(msg) => handle_broadcast(ctx, msg).await,
        ClientCommand::Refresh(msg) => handle_refresh(ctx, msg).await,
        ClientCommand::Ping(msg) => handle_ping(ctx, msg),
        ClientCommand::Pong(_) => {
            ctx.last_pong.store(proto::unix_milli(), Ordering::Relaxed);
            Ok(())
        }
    }
}

/// Per-connection handler context.
pub struct ConnCtx {
    pub user: Option<Arc<User>>,
    pub ip: String,
    pub backend: Arc<Backend>,
    pub frames: mpsc::Sender<Arc<String>>,
    pub last_pong: Arc<AtomicI64>,
}

impl ConnCtx {
    fn require_user(&self) -> Result<&Arc<User>, HandlerError> {
        self.user.as_ref().ok_or(HandlerError::NeedLogin)
    }

    fn require_moderator(&self) -> Result<&Arc<User>, HandlerError> {
        let user = self.require_user()?;
        if !user.is_moderator() {
            return Err(HandlerError::NoPermission);
        }
        Ok(user)
    }

    /// Resolve a moderation or privmsg target: connected users first,
    /// then the users table for offline targets.
    async fn lookup_target(&self, nick: &str) -> Result<(Userid, bool), HandlerError> {
        if nick.is_empty() {
            return Err(HandlerError::BadPayload);
        }
        if let Some(entry) = self.backend.names.lookup_nick(nick) {
            return Ok((entry.id, entry.protected));
        }
        match self.backend.db.lookup_nick(nick).await {
            Ok(Some(found)) => Ok(found),
            Ok(None) => Err(HandlerError::NotFound),
            Err(e) => {
                warn!(nick = %nick, error = %e, "target lookup failed");
                Err(HandlerError::NotFound)
            }
        }
    }

    /// Enqueue an `ERR` reply; a full queue drops it like any other frame.
    fn send_error(&self, code: &str) {
        let _ = self.frames.try_send(Arc::new(proto::pack_err(code)));
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn handle_msg(ctx: &ConnCtx, msg: MsgIn) -> HandlerResult {
    let user = ctx.require_user()?;
    if msg.data.is_empty() {
        return Err(HandlerError::BadPayload);
    }
    if ctx.backend.state.submode() && !user.is_subscriber() {
        return Err(HandlerError::Submode);
    }
    if ctx.backend.state.is_muted(user.id) {
        return Err(HandlerError::Muted);
    }
    user.check_throttle(
        &msg.data,
        Instant::now(),
        ctx.backend.config.delay(),
        ctx.backend.config.max_delay_scale(),
    )?;

    let entities = ctx.backend.extractor.extract(&msg.data);
    let mut out = EventDataOut::message(user.simplified(), msg.data, entities);
    transform_rares(&mut out, ctx.backend.config.chat.rare_chance);
    if ctx.backend.combos.transform(&mut out).is_err() {
        // already counted for this combo; broadcast undecorated
        debug!(nick = %user.nick(), "combo duplicate");
    }
    ctx.backend.hub.broadcast("MSG", &out).await;
    Ok(())
}

async fn handle_privmsg(ctx: &ConnCtx, msg: PrivmsgIn) -> HandlerResult {
    let user = ctx.require_user()?;
    if msg.data.is_empty() {
        return Err(HandlerError::BadPayload);
    }
    let (target, protected) = ctx.lookup_target(&msg.nick).await?;
    if target == user.id || protected {
        return Err(HandlerError::NotFound);
    }
    if ctx.backend.state.is_muted(user.id) {
        return Err(HandlerError::Muted);
    }
    user.check_throttle(
        &msg.data,
        Instant::now(),
        ctx.backend.config.delay(),
        ctx.backend.config.max_delay_scale(),
    )?;

    let entities = ctx.backend.extractor.extract(&msg.data);
    let mut out = EventDataOut::message(user.simplified(), msg.data, entities);
    transform_rares(&mut out, ctx.backend.config.chat.rare_chance);
    ctx.backend.hub.privmsg(target, "PRIVMSG", &out).await;
    Ok(())
}

async fn handle_mute(ctx: &ConnCtx, msg: MuteIn) -> HandlerResult {
    let user = ctx.require_moderator()?;
    let (target, protected) = ctx.lookup_target(&msg.data).await?;
    if protected {
        return Err(HandlerError::NoPermission);
    }
    let duration = match msg.duration {
        Some(ns) if ns <= 0 => return Err(HandlerError::BadPayload),
        Some(ns) => Duration::from_nanos(ns as u64),
        None => DEFAULT_MUTE_DURATION,
    };
    let until = Utc::now().timestamp_millis() + duration.as_millis() as i64;
    ctx.backend.state.mute(target, until);
    ctx.backend
        .hub
        .broadcast("MUTE", &EventDataOut::notice(user.simplified(), msg.data))
        .await;
    Ok(())
}

async fn handle_unmute(ctx: &ConnCtx, msg: SimpleIn) -> HandlerResult {
    let user = ctx.require_moderator()?;
    let (target, protected) = ctx.lookup_target(&msg.data).await?;
    if protected {
        return Err(HandlerError::NoPermission);
    }
    ctx.backend.state.unmute(target);
    ctx.backend
        .hub
        .broadcast("UNMUTE", &EventDataOut::notice(user.simplified(), msg.data))
        .await;
    Ok(())
}

async fn handle_ban(ctx: &ConnCtx, msg: BanIn) -> HandlerResult {
    let user = ctx.require_moderator()?;
    if msg.reason.is_empty() {
        return Err(HandlerError::NeedBanReason);
    }
    let (target, protected) = ctx.lookup_target(&msg.nick).await?;
    if protected {
        return Err(HandlerError::NoPermission);
    }

    let start = Utc::now().timestamp();
    let end = if msg.ispermanent {
        far_future_secs()
    } else {
        let duration = match msg.duration {
            Some(ns) if ns <= 0 => return Err(HandlerError::BadPayload),
            Some(ns) => Duration::from_nanos(ns as u64),
            None => DEFAULT_BAN_DURATION,
        };
        start + duration.as_secs() as i64
    };

    ctx.backend.bans.ban_user(target, end);

    // the ip is only stored when banip is set and one is available
    let mut stored_ip = None;
    if msg.banip {
        let ips = ctx.backend.hub.ips_for_user(target).await;
        stored_ip = ips.first().cloned();
        for ip in ips {
            ctx.backend.bans.ban_ip(&ip, target, end);
            ctx.backend.hub.notify_ip_ban(ip).await;
        }
    }
    ctx.backend.hub.notify_ban(target).await;
    ctx.backend
        .db
        .queue_insert_ban(user.id, target, stored_ip, msg.reason, start, end)
        .await;
    ctx.backend
        .hub
        .broadcast("BAN", &EventDataOut::notice(user.simplified(), msg.nick))
        .await;
    Ok(())
}

async fn handle_unban(ctx: &ConnCtx, msg: SimpleIn) -> HandlerResult {
    let user = ctx.require_moderator()?;
    let (target, _) = ctx.lookup_target(&msg.data).await?;
    ctx.backend.bans.unban_user(target);
    ctx.backend.db.queue_delete_ban(target).await;
    ctx.backend
        .hub
        .broadcast("UNBAN", &EventDataOut::notice(user.simplified(), msg.data))
        .await;
    Ok(())
}

async fn handle_subonly(ctx: &ConnCtx, msg: SimpleIn) -> HandlerResult {
    let user = ctx.require_moderator()?;
    let enabled = match msg.data.as_str() {
        "on" => true,
        "off" => false,
        _ => return Err(HandlerError::BadPayload),
    };
    ctx.backend.state.set_submode(enabled);
    ctx.backend
        .hub
        .broadcast("SUBONLY", &EventDataOut::notice(user.simplified(), msg.data))
        .await;
    Ok(())
}

async fn handle_broadcast(ctx: &ConnCtx, msg: SimpleIn) -> HandlerResult {
    let user = ctx.require_user()?;
    if user.features() & ISADMIN == 0 {
        return Err(HandlerError::NoPermission);
    }
    if msg.data.is_empty() {
        return Err(HandlerError::BadPayload);
    }
    ctx.backend
        .hub
        .broadcast("BROADCAST", &EventDataOut::system(msg.data))
        .await;
    Ok(())
}

async fn handle_refresh(ctx: &ConnCtx, msg: SimpleIn) -> HandlerResult {
    ctx.require_moderator()?;
    let (target, protected) = ctx.lookup_target(&msg.data).await?;
    if protected {
        return Err(HandlerError::NoPermission);
    }
    ctx.backend.hub.refresh_user(target).await;
    Ok(())
}

fn handle_ping(ctx: &ConnCtx, msg: proto::PingIn) -> HandlerResult {
    let data = msg.data.unwrap_or_else(proto::unix_milli);
    if let Ok(frame) = proto::pack_json("PONG", &PingOut { data }) {
        let _ = ctx.frames.try_send(Arc::new(frame));
    }
    Ok(())
}

// ============================================================================
// Writer task
// ============================================================================

async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<Arc<String>>,
    mut ping: mpsc::Receiver<i64>,
    mut control: mpsc::UnboundedReceiver<ControlFrame>,
    last_pong: Arc<AtomicI64>,
) {
    let mut pending_ping: Option<i64> = None;
    loop {
        tokio::select! {
            biased;

            frame = control.recv() => match frame {
                Some(ControlFrame::Banned) => {
                    let _ = write_frame(&mut sink, &proto::pack_err("banned")).await;
                    break;
                }
                Some(ControlFrame::Refresh(frame)) => {
                    let _ = write_frame(&mut sink, &frame).await;
                    break;
                }
                Some(ControlFrame::Close) | None => break,
            },

            tick = ping.recv() => match tick {
                Some(now) => {
                    if let Some(sent) = pending_ping {
                        if last_pong.load(Ordering::Relaxed) >= sent {
                            pending_ping = None;
                        } else if now.saturating_sub(sent) >= PING_TIMEOUT_MS {
                            debug!("ping timeout");
                            break;
                        }
                    }
                    let frame = match proto::pack_json("PING", &PingOut { data: now }) {
                        Ok(frame) => frame,
                        Err(_) => break,
                    };
                    if write_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                    if pending_ping.is_none() {
                        pending_ping = Some(now);
                    }
                }
                // the hub closes the ping channel when it overflows
                None => {
                    debug!("ping channel closed");
                    break;
                }
            },

            frame = frames.recv() => match frame {
                Some(frame) => {
                    if write_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = sink.close().await;
}

async fn write_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &str) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(frame.to_string().into())))
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "write failed");
            Err(())
        }
        Err(_) => {
            debug!("write deadline expired");
            Err(())
        }
    }
}
