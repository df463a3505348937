//! Process-wide presence and room membership.
//!
//! Three indexes live behind one mutex:
//! - `unauthenticated`: sessions that have not logged in yet
//! - `by_user`: user id to that user's live sessions
//! - `by_room`: room id to member sessions, mirroring each session's room cache
//!
//! Every authenticated session sits in exactly one `by_user` bucket and in
//! exactly the `by_room` buckets its room cache names. A session is either
//! unauthenticated or indexed by user, never both. Empty buckets are removed.
//!
//! Mutations finish under the lock; recipients are snapshotted and the lock
//! released before any frame is sent. Lock order is registry, then session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parlor_core::ids::{RoomId, SessionId, UserId};
use parlor_core::protocol::Presence;
use parlor_core::ServerMessage;
use tracing::{debug, info};

use crate::fanout::{Fanout, FanoutReport};
use crate::session::Session;

type Bucket = HashMap<SessionId, Arc<Session>>;

/// Sessions affected by joining a user to a room.
#[derive(Debug, Default)]
pub struct JoinOutcome {
    /// Members present before the join, none of them the joining user's.
    pub existing: Vec<Arc<Session>>,
    /// The user's sessions that were added.
    pub joined: Vec<Arc<Session>>,
}

/// Presence and membership operations used by connections and the dispatcher.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    fn register_unauthenticated(&self, session: &Arc<Session>);

    /// Move an authenticated session from the unauthenticated set into its user bucket.
    fn promote_to_authenticated(&self, session: &Arc<Session>) -> bool;

    /// Promote, join the given rooms, and tell every peer sharing a room.
    async fn online(&self, session: &Arc<Session>, room_ids: &[RoomId]);

    /// Remove the session everywhere and tell peers if it was logged in. Idempotent.
    async fn offline(&self, session: &Arc<Session>);

    fn join_room(&self, session: &Arc<Session>, room_id: RoomId) -> bool;

    fn leave_room(&self, session: &Arc<Session>, room_id: RoomId) -> bool;

    /// Join every live session of a user to a room.
    fn join_user_to_room(&self, user_id: UserId, room_id: RoomId) -> JoinOutcome;

    /// Remove every live session of a user from a room; returns the sessions removed.
    fn leave_user_from_room(&self, user_id: UserId, room_id: RoomId) -> Vec<Arc<Session>>;

    fn room_members(&self, room_id: RoomId) -> Vec<Arc<Session>>;

    fn user_sessions(&self, user_id: UserId) -> Vec<Arc<Session>>;

    async fn notify_room(
        &self,
        room_id: RoomId,
        message: &ServerMessage,
        excluding: Option<&SessionId>,
    ) -> FanoutReport;

    async fn notify_user(
        &self,
        user_id: UserId,
        message: &ServerMessage,
        excluding: Option<&SessionId>,
    ) -> FanoutReport;

    async fn broadcast(&self, sessions: &[Arc<Session>], message: &ServerMessage) -> FanoutReport;

    fn is_online(&self, user_id: UserId) -> bool;

    /// Live sessions, logged in or not.
    fn connection_count(&self) -> usize;

    fn online_user_count(&self) -> usize;
}

#[derive(Default)]
struct Indexes {
    unauthenticated: Bucket,
    by_user: HashMap<UserId, Bucket>,
    by_room: HashMap<RoomId, Bucket>,
}

impl Indexes {
    fn is_indexed_by_user(&self, session: &Session) -> bool {
        session
            .user_id()
            .and_then(|user_id| self.by_user.get(&user_id))
            .is_some_and(|bucket| bucket.contains_key(session.id()))
    }

    fn join(&mut self, session: &Arc<Session>, room_id: RoomId) -> bool {
        if !self.is_indexed_by_user(session) || !session.insert_room(room_id) {
            return false;
        }
        self.by_room
            .entry(room_id)
            .or_default()
            .insert(session.id().clone(), Arc::clone(session));
        true
    }

    fn leave(&mut self, session: &Session, room_id: RoomId) -> bool {
        if !session.remove_room(room_id) {
            return false;
        }
        remove_from(&mut self.by_room, &room_id, session.id());
        true
    }

    /// Union of the rooms' members minus `sender`. Keyed by session id so a
    /// peer sharing several rooms appears once.
    fn peers(&self, sender: &SessionId, room_ids: &[RoomId]) -> Vec<Arc<Session>> {
        let mut peers: HashMap<&SessionId, &Arc<Session>> = HashMap::new();
        for room_id in room_ids {
            if let Some(bucket) = self.by_room.get(room_id) {
                for (id, session) in bucket {
                    if id != sender {
                        peers.insert(id, session);
                    }
                }
            }
        }
        peers.into_values().map(Arc::clone).collect()
    }

    fn collect(bucket: Option<&Bucket>, excluding: Option<&SessionId>) -> Vec<Arc<Session>> {
        bucket
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|(id, _)| Some(*id) != excluding)
                    .map(|(_, session)| Arc::clone(session))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn remove_from<K: std::hash::Hash + Eq>(
    index: &mut HashMap<K, Bucket>,
    key: &K,
    session_id: &SessionId,
) -> bool {
    let Some(bucket) = index.get_mut(key) else {
        return false;
    };
    let removed = bucket.remove(session_id).is_some();
    if bucket.is_empty() {
        index.remove(key);
    }
    removed
}

fn presence_of(session: &Session) -> Option<Presence> {
    session.user().map(|user| Presence {
        user_id: user.id,
        user_name: user.name,
    })
}

/// The in-memory registry. One per process, shared by handle.
#[derive(Default)]
pub struct Registry {
    indexes: Mutex<Indexes>,
    fanout: Fanout,
}

impl Registry {
    pub fn new(fanout: Fanout) -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            fanout,
        }
    }

    fn promote_locked(indexes: &mut Indexes, session: &Arc<Session>) -> bool {
        let Some(user_id) = session.user_id() else {
            return false;
        };
        if indexes.unauthenticated.remove(session.id()).is_none() {
            return false;
        }
        indexes
            .by_user
            .entry(user_id)
            .or_default()
            .insert(session.id().clone(), Arc::clone(session));
        true
    }
}

#[async_trait]
impl PresenceRegistry for Registry {
    fn register_unauthenticated(&self, session: &Arc<Session>) {
        let mut indexes = self.indexes.lock();
        indexes
            .unauthenticated
            .insert(session.id().clone(), Arc::clone(session));
    }

    fn promote_to_authenticated(&self, session: &Arc<Session>) -> bool {
        Self::promote_locked(&mut self.indexes.lock(), session)
    }

    async fn online(&self, session: &Arc<Session>, room_ids: &[RoomId]) {
        let Some(presence) = presence_of(session) else {
            return;
        };

        let peers = {
            let mut indexes = self.indexes.lock();
            if !indexes.is_indexed_by_user(session) && !Self::promote_locked(&mut indexes, session) {
                return;
            }
            for room_id in room_ids {
                indexes.join(session, *room_id);
            }
            indexes.peers(session.id(), &session.room_ids())
        };

        info!(
            session_id = %session.id(),
            user_id = %presence.user_id,
            rooms = room_ids.len(),
            peers = peers.len(),
            "user online"
        );
        self.fanout
            .broadcast(&peers, &ServerMessage::UserOnline(presence))
            .await;
    }

    async fn offline(&self, session: &Arc<Session>) {
        let (peers, presence) = {
            let mut indexes = self.indexes.lock();
            if indexes.unauthenticated.remove(session.id()).is_some() {
                debug!(session_id = %session.id(), "unauthenticated session removed");
                return;
            }
            let Some(user_id) = session.user_id() else {
                return;
            };
            if !remove_from(&mut indexes.by_user, &user_id, session.id()) {
                return;
            }
            let rooms = session.take_rooms();
            for room_id in &rooms {
                remove_from(&mut indexes.by_room, room_id, session.id());
            }
            (indexes.peers(session.id(), &rooms), presence_of(session))
        };

        let Some(presence) = presence else {
            return;
        };
        info!(
            session_id = %session.id(),
            user_id = %presence.user_id,
            peers = peers.len(),
            "user offline"
        );
        self.fanout
            .broadcast(&peers, &ServerMessage::UserOffline(presence))
            .await;
    }

    fn join_room(&self, session: &Arc<Session>, room_id: RoomId) -> bool {
        self.indexes.lock().join(session, room_id)
    }

    fn leave_room(&self, session: &Arc<Session>, room_id: RoomId) -> bool {
        self.indexes.lock().leave(session, room_id)
    }

    fn join_user_to_room(&self, user_id: UserId, room_id: RoomId) -> JoinOutcome {
        let mut indexes = self.indexes.lock();
        let existing = indexes
            .by_room
            .get(&room_id)
            .map(|bucket| {
                bucket
                    .values()
                    .filter(|session| session.user_id() != Some(user_id))
                    .map(Arc::clone)
                    .collect()
            })
            .unwrap_or_default();

        let sessions = Indexes::collect(indexes.by_user.get(&user_id), None);
        let joined = sessions
            .into_iter()
            .filter(|session| indexes.join(session, room_id))
            .collect();

        JoinOutcome { existing, joined }
    }

    fn leave_user_from_room(&self, user_id: UserId, room_id: RoomId) -> Vec<Arc<Session>> {
        let mut indexes = self.indexes.lock();
        let sessions = Indexes::collect(indexes.by_user.get(&user_id), None);
        sessions
            .into_iter()
            .filter(|session| indexes.leave(session, room_id))
            .collect()
    }

    fn room_members(&self, room_id: RoomId) -> Vec<Arc<Session>> {
        let indexes = self.indexes.lock();
        Indexes::collect(indexes.by_room.get(&room_id), None)
    }

    fn user_sessions(&self, user_id: UserId) -> Vec<Arc<Session>> {
        let indexes = self.indexes.lock();
        Indexes::collect(indexes.by_user.get(&user_id), None)
    }

    async fn notify_room(
        &self,
        room_id: RoomId,
        message: &ServerMessage,
        excluding: Option<&SessionId>,
    ) -> FanoutReport {
        let recipients = {
            let indexes = self.indexes.lock();
            Indexes::collect(indexes.by_room.get(&room_id), excluding)
        };
        self.fanout.broadcast(&recipients, message).await
    }

    async fn notify_user(
        &self,
        user_id: UserId,
        message: &ServerMessage,
        excluding: Option<&SessionId>,
    ) -> FanoutReport {
        let recipients = {
            let indexes = self.indexes.lock();
            Indexes::collect(indexes.by_user.get(&user_id), excluding)
        };
        self.fanout.broadcast(&recipients, message).await
    }

    async fn broadcast(&self, sessions: &[Arc<Session>], message: &ServerMessage) -> FanoutReport {
        self.fanout.broadcast(sessions, message).await
    }

    fn is_online(&self, user_id: UserId) -> bool {
        self.indexes.lock().by_user.contains_key(&user_id)
    }

    fn connection_count(&self) -> usize {
        let indexes = self.indexes.lock();
        indexes.unauthenticated.len() + indexes.by_user.values().map(HashMap::len).sum::<usize>()
    }

    fn online_user_count(&self) -> usize {
        self.indexes.lock().by_user.len()
    }
}
