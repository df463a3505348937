use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use parlor_core::ids::{RoomId, SessionId, UserId};
use parlor_core::ServerMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, error};

use crate::error::DeliveryError;

/// Identity a session takes on after a successful login. Fixed for the session's lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUser {
    pub id: UserId,
    pub name: String,
    pub login: String,
}

#[derive(Debug, Default)]
struct SessionState {
    user: Option<SessionUser>,
    room_ids: HashSet<RoomId>,
}

/// One live client connection.
///
/// The connection task owns the session; the registry holds `Arc` handles that
/// are removed during teardown. Room membership here mirrors the registry's
/// room index and is only changed by the registry while it holds its lock.
pub struct Session {
    id: SessionId,
    outbox: mpsc::Sender<Arc<str>>,
    send_timeout: Duration,
    state: Mutex<SessionState>,
    torn_down: AtomicBool,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl Session {
    pub fn new(outbox: mpsc::Sender<Arc<str>>, send_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            outbox,
            send_timeout,
            state: Mutex::new(SessionState::default()),
            torn_down: AtomicBool::new(false),
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// A session plus the receiving end of its outbound queue.
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(tx, send_timeout)), rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn user(&self) -> Option<SessionUser> {
        self.state.lock().user.clone()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.state.lock().user.as_ref().map(|u| u.id)
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().user.is_some()
    }

    /// Attach the logged-in user. A session authenticates at most once.
    pub fn authenticate(&self, user: SessionUser) -> bool {
        let mut state = self.state.lock();
        if state.user.is_some() {
            return false;
        }
        state.user = Some(user);
        true
    }

    pub fn in_room(&self, room_id: RoomId) -> bool {
        self.state.lock().room_ids.contains(&room_id)
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.state.lock().room_ids.iter().copied().collect()
    }

    pub(crate) fn insert_room(&self, room_id: RoomId) -> bool {
        self.state.lock().room_ids.insert(room_id)
    }

    pub(crate) fn remove_room(&self, room_id: RoomId) -> bool {
        self.state.lock().room_ids.remove(&room_id)
    }

    pub(crate) fn take_rooms(&self) -> Vec<RoomId> {
        self.state.lock().room_ids.drain().collect()
    }

    /// Queue an encoded frame, waiting up to the send timeout if the queue is full.
    pub async fn deliver(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        match self.outbox.send_timeout(frame, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Timeout)
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Closed)
            }
        }
    }

    /// Encode and queue a frame for this client. Failures are logged, never returned.
    pub async fn send(&self, message: &ServerMessage) {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(session_id = %self.id, kind = message.kind(), error = %e, "failed to encode frame");
                return;
            }
        };
        if let Err(e) = self.deliver(Arc::from(frame)).await {
            debug!(session_id = %self.id, kind = message.kind(), error = %e, "dropped frame");
        }
    }

    /// Returns true exactly once: for the caller that should run teardown.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Record inbound traffic (frames or pongs).
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .finish()
    }
}
