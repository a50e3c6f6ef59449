//! The hub: a single-task fan-out switchboard.
//!
//! All mutations of the connection set happen inside the hub task;
//! external mutators enqueue onto bounded channels and return. Broadcast
//! fan-out never blocks on a slow connection: a full per-connection frame
//! queue drops that frame for that connection only.

use crate::history::History;
use crate::proto;
use crate::user::{User, Userid};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Per-connection frame queue capacity; overflow drops the frame.
pub const SEND_QUEUE_SIZE: usize = 16;
/// Hub ingress capacity for broadcasts and private messages.
pub const BROADCAST_QUEUE_SIZE: usize = 256;
/// Ping channel capacity; overflow closes the channel.
pub const PING_QUEUE_SIZE: usize = 2;
/// Operator-driven control queues are tiny.
const CONTROL_QUEUE_SIZE: usize = 4;
const REGISTER_QUEUE_SIZE: usize = 256;

pub type ConnId = u64;

/// Out-of-band frames delivered through the unbounded control channel;
/// these must not be droppable the way chat frames are.
#[derive(Debug)]
pub enum ControlFrame {
    /// Write `ERR "banned"` and close.
    Banned,
    /// Write the prepared `REFRESH` frame and close.
    Refresh(Arc<String>),
    /// Local teardown.
    Close,
}

/// Everything the hub needs to reach one connection.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnId,
    pub user: Option<Arc<User>>,
    pub ip: String,
    pub frames: mpsc::Sender<Arc<String>>,
    pub ping: mpsc::Sender<i64>,
    pub control: mpsc::UnboundedSender<ControlFrame>,
}

struct ConnEntry {
    user: Option<Arc<User>>,
    ip: String,
    frames: mpsc::Sender<Arc<String>>,
    ping: Option<mpsc::Sender<i64>>,
    control: mpsc::UnboundedSender<ControlFrame>,
}

/// A broadcast: event name plus the pre-marshalled frame.
#[derive(Debug, Clone)]
pub struct HubMessage {
    pub event: &'static str,
    pub frame: Arc<String>,
}

/// A targeted delivery.
#[derive(Debug, Clone)]
pub struct PrivateMessage {
    pub target: Userid,
    pub frame: Arc<String>,
}

struct IpsRequest {
    target: Userid,
    reply: oneshot::Sender<Vec<String>>,
}

/// Cloneable producer half of the hub.
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Registration>,
    unregister: mpsc::UnboundedSender<ConnId>,
    broadcast: mpsc::Sender<HubMessage>,
    privmsg: mpsc::Sender<PrivateMessage>,
    bans: mpsc::Sender<Userid>,
    ipbans: mpsc::Sender<String>,
    refreshuser: mpsc::Sender<Userid>,
    getips: mpsc::Sender<IpsRequest>,
    next_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, registration: Registration) {
        let _ = self.register.send(registration).await;
    }

    /// Unregistration is accepted unconditionally; the hub drains it
    /// promptly.
    pub fn unregister(&self, id: ConnId) {
        let _ = self.unregister.send(id);
    }

    /// Fan a pre-marshalled frame to every connection.
    pub async fn broadcast_frame(&self, event: &'static str, frame: Arc<String>) {
        let _ = self.broadcast.send(HubMessage { event, frame }).await;
    }

    /// Marshal `payload` and fan it to every connection.
    pub async fn broadcast<T: Serialize>(&self, event: &'static str, payload: &T) {
        match proto::pack_json(event, payload) {
            Ok(frame) => self.broadcast_frame(event, Arc::new(frame)).await,
            Err(e) => warn!(event, error = %e, "could not marshal broadcast"),
        }
    }

    /// Deliver an event to every connection of `target`.
    pub async fn privmsg<T: Serialize>(&self, target: Userid, event: &'static str, payload: &T) {
        match proto::pack_json(event, payload) {
            Ok(frame) => {
                let _ = self
                    .privmsg
                    .send(PrivateMessage { target, frame: Arc::new(frame) })
                    .await;
            }
            Err(e) => warn!(event, error = %e, "could not marshal private message"),
        }
    }

    /// Disconnect every connection of a banned user.
    pub async fn notify_ban(&self, target: Userid) {
        let _ = self.bans.send(target).await;
    }

    /// Disconnect every connection from a banned masked IP.
    pub async fn notify_ip_ban(&self, ip: String) {
        let _ = self.ipbans.send(ip).await;
    }

    /// Tell every connection of `target` to reload its profile.
    pub async fn refresh_user(&self, target: Userid) {
        let _ = self.refreshuser.send(target).await;
    }

    /// The masked IPs currently held by connections of `target`.
    pub async fn ips_for_user(&self, target: Userid) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        let _ = self.getips.send(IpsRequest { target, reply: tx }).await;
        rx.await.unwrap_or_default()
    }
}

/// The consumer half; run exactly once.
pub struct Hub {
    connections: HashMap<ConnId, ConnEntry>,
    history: Arc<History>,
    register: mpsc::Receiver<Registration>,
    unregister: mpsc::UnboundedReceiver<ConnId>,
    broadcast: mpsc::Receiver<HubMessage>,
    privmsg: mpsc::Receiver<PrivateMessage>,
    bans: mpsc::Receiver<Userid>,
    ipbans: mpsc::Receiver<String>,
    refreshuser: mpsc::Receiver<Userid>,
    getips: mpsc::Receiver<IpsRequest>,
}

impl Hub {
    pub fn new(history: Arc<History>) -> (HubHandle, Hub) {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_SIZE);
        let (privmsg_tx, privmsg_rx) = mpsc::channel(BROADCAST_QUEUE_SIZE);
        let (bans_tx, bans_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let (ipbans_tx, ipbans_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let (refresh_tx, refresh_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);
        let (getips_tx, getips_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);

        let handle = HubHandle {
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            privmsg: privmsg_tx,
            bans: bans_tx,
            ipbans: ipbans_tx,
            refreshuser: refresh_tx,
            getips: getips_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        let hub = Hub {
            connections: HashMap::new(),
            history,
            register: register_rx,
            unregister: unregister_rx,
            broadcast: broadcast_rx,
            privmsg: privmsg_rx,
            bans: bans_rx,
            ipbans: ipbans_rx,
            refreshuser: refresh_rx,
            getips: getips_rx,
        };
        (handle, hub)
    }

    /// Run the switchboard until every producer handle is gone.
    pub async fn run(mut self) {
        let mut pinger = tokio::time::interval(PING_INTERVAL);
        pinger.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        pinger.tick().await;

        loop {
            tokio::select! {
                Some(registration) = self.register.recv() => {
                    self.connections.insert(registration.id, ConnEntry {
                        user: registration.user,
                        ip: registration.ip,
                        frames: registration.frames,
                        ping: Some(registration.ping),
                        control: registration.control,
                    });
                }
                Some(id) = self.unregister.recv() => {
                    self.connections.remove(&id);
                }
                Some(message) = self.broadcast.recv() => {
                    if message.event != "JOIN" && message.event != "QUIT" {
                        self.history.push(message.frame.clone());
                    }
                    for entry in self.connections.values() {
                        // drop, never block: a slow consumer loses this
                        // frame only
                        let _ = entry.frames.try_send(message.frame.clone());
                    }
                }
                Some(message) = self.privmsg.recv() => {
                    for entry in self.connections.values() {
                        if entry.user.as_ref().map(|u| u.id) == Some(message.target) {
                            let _ = entry.frames.try_send(message.frame.clone());
                        }
                    }
                }
                Some(target) = self.bans.recv() => {
                    for entry in self.connections.values() {
                        if entry.user.as_ref().map(|u| u.id) == Some(target) {
                            let _ = entry.control.send(ControlFrame::Banned);
                        }
                    }
                }
                Some(ip) = self.ipbans.recv() => {
                    for entry in self.connections.values() {
                        if entry.ip == ip {
                            debug!(ip = %ip, "disconnecting ip-banned connection");
                            let _ = entry.control.send(ControlFrame::Banned);
                        }
                    }
                }
                Some(target) = self.refreshuser.recv() => {
                    for entry in self.connections.values() {
                        let Some(user) = entry.user.as_ref() else { continue };
                        if user.id != target {
                            continue;
                        }
                        match proto::pack_json("REFRESH", &user.simplified()) {
                            Ok(frame) => {
                                let _ = entry.control.send(ControlFrame::Refresh(Arc::new(frame)));
                            }
                            Err(e) => warn!(error = %e, "could not marshal refresh"),
                        }
                    }
                }
                Some(request) = self.getips.recv() => {
                    let ips = self
                        .connections
                        .values()
                        .filter(|entry| entry.user.as_ref().map(|u| u.id) == Some(request.target))
                        .map(|entry| entry.ip.clone())
                        .collect();
                    let _ = request.reply.send(ips);
                }
                _ = pinger.tick() => {
                    let now = proto::unix_milli();
                    for entry in self.connections.values_mut() {
                        let Some(ping) = entry.ping.as_ref() else { continue };
                        match ping.try_send(now) {
                            Ok(()) | Err(TrySendError::Closed(_)) => {}
                            Err(TrySendError::Full(_)) => {
                                // the writer stopped draining pings;
                                // closing the channel tears it down
                                entry.ping = None;
                            }
                        }
                    }
                }
                else => break,
            }
        }
    }
}
