//! Command dispatch: one inbound frame in, one response frame out.
//!
//! Each handler validates against the session and store, persists, updates
//! the registry, fans out events, then returns the caller's response.
//! Persisted state is never rolled back when a fanout partially fails.

use std::sync::Arc;

use parlor_core::ids::{MessageId, RoomId, UserId};
use parlor_core::protocol::{
    decode_frame, AuthSnapshot, Command, CommandEnvelope, ContactData, MessageData, Presence,
    RoomData, SuccessPayload, UserData,
};
use parlor_core::records::{RoomType, UserRecord};
use parlor_core::security::AuthSecret;
use parlor_core::{ErrorCode, ServerMessage};
use parlor_store::{ChatStore, UserSnapshot};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::error::CommandError;
use crate::registry::PresenceRegistry;
use crate::session::{Session, SessionUser};

const DEFAULT_HISTORY_LIMIT: u32 = 100;
const DEFAULT_SEARCH_LIMIT: u32 = 50;

enum Reply {
    Authenticated(AuthSnapshot),
    Done(SuccessPayload),
}

type HandlerResult = Result<SuccessPayload, CommandError>;

pub struct Dispatcher {
    store: Arc<dyn ChatStore>,
    registry: Arc<dyn PresenceRegistry>,
    secret: AuthSecret,
    history_limit: u32,
    search_limit: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<dyn PresenceRegistry>,
        secret: AuthSecret,
    ) -> Self {
        Self {
            store,
            registry,
            secret,
            history_limit: DEFAULT_HISTORY_LIMIT,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn from_config(
        config: &ServerConfig,
        store: Arc<dyn ChatStore>,
        registry: Arc<dyn PresenceRegistry>,
    ) -> Self {
        Self::new(store, registry, config.auth_secret.clone())
            .with_limits(config.history_limit, config.search_limit)
    }

    #[must_use]
    pub fn with_limits(mut self, history_limit: u32, search_limit: u32) -> Self {
        self.history_limit = history_limit;
        self.search_limit = search_limit;
        self
    }

    pub fn registry(&self) -> &Arc<dyn PresenceRegistry> {
        &self.registry
    }

    /// Decode and run one text frame. Always yields a response for the sender.
    #[instrument(skip_all, fields(session_id = %session.id(), command))]
    pub async fn handle_frame(&self, session: &Arc<Session>, raw: &str) -> ServerMessage {
        let envelope = match decode_frame(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "rejected frame");
                return ServerMessage::error(e.cmd_id().clone(), e.error_code());
            }
        };
        let _ = tracing::Span::current().record("command", envelope.command.name());
        self.dispatch(session, envelope).await
    }

    pub async fn dispatch(&self, session: &Arc<Session>, envelope: CommandEnvelope) -> ServerMessage {
        let CommandEnvelope { cmd_id, command } = envelope;
        if command.requires_auth() && !session.is_authenticated() {
            debug!(command = command.name(), "command before login");
            return ServerMessage::error(cmd_id, ErrorCode::AuthNeed);
        }

        let name = command.name();
        match self.execute(session, command).await {
            Ok(Reply::Authenticated(snapshot)) => ServerMessage::AuthSuccess { cmd_id, snapshot },
            Ok(Reply::Done(payload)) => ServerMessage::success(cmd_id, payload),
            Err(e) => {
                let code = e.error_code();
                match &e {
                    CommandError::Store(err) => {
                        error!(command = name, error = %err, "command failed");
                    }
                    CommandError::Rejected(_) => {
                        debug!(
                            command = name,
                            error_code = code.code(),
                            kind = code.error_kind(),
                            "command rejected"
                        );
                    }
                }
                ServerMessage::error(cmd_id, code)
            }
        }
    }

    async fn execute(&self, session: &Arc<Session>, command: Command) -> Result<Reply, CommandError> {
        let payload = match command {
            Command::Auth { login, passwd } => return self.auth(session, &login, &passwd).await,
            Command::AuthByKey { user_id, key } => {
                return self.auth_by_key(session, user_id, &key).await;
            }
            Command::MessageCreate { room_id, text } => {
                self.message_create(session, room_id, &text).await?
            }
            Command::MessageEdit { message_id, text } => {
                self.message_edit(session, message_id, &text).await?
            }
            Command::RoomJoin { room_id } => self.room_join(session, room_id).await?,
            Command::RoomLeave { room_id } => self.room_leave(session, room_id).await?,
            Command::RoomCreate { name } => self.room_create(session, &name).await?,
            Command::ContactAdd { user_id } => self.contact_add(session, user_id).await?,
            Command::ContactRemove { user_id } => self.contact_remove(session, user_id).await?,
            Command::UsersSearch { name } => self.users_search(session, &name).await?,
        };
        Ok(Reply::Done(payload))
    }

    // ── Login ──

    async fn auth(&self, session: &Arc<Session>, login: &str, passwd: &str) -> Result<Reply, CommandError> {
        if session.is_authenticated() {
            return Err(ErrorCode::AlreadyAuthenticated.into());
        }
        let user = self
            .store
            .find_user_by_credentials(login, passwd)
            .await?
            .ok_or(ErrorCode::AuthFailed)?;
        self.login(session, user).await
    }

    async fn auth_by_key(
        &self,
        session: &Arc<Session>,
        user_id: UserId,
        key: &str,
    ) -> Result<Reply, CommandError> {
        if session.is_authenticated() {
            return Err(ErrorCode::AlreadyAuthenticated.into());
        }
        let user = self
            .store
            .find_user_by_id(user_id)
            .await?
            .filter(|user| self.secret.verify_key(&user.passwd, key))
            .ok_or(ErrorCode::AuthFailed)?;
        self.login(session, user).await
    }

    async fn login(&self, session: &Arc<Session>, user: UserRecord) -> Result<Reply, CommandError> {
        let snapshot = self
            .store
            .load_user_snapshot(user.id, self.history_limit)
            .await?;

        let identity = SessionUser {
            id: user.id,
            name: user.name.clone(),
            login: user.login.clone(),
        };
        if !session.authenticate(identity) {
            return Err(ErrorCode::AlreadyAuthenticated.into());
        }
        self.registry.online(session, &snapshot.room_ids()).await;

        info!(user_id = %user.id, rooms = snapshot.rooms.len(), "session authenticated");
        Ok(Reply::Authenticated(self.auth_snapshot(&user, &snapshot)))
    }

    fn auth_snapshot(&self, user: &UserRecord, snapshot: &UserSnapshot) -> AuthSnapshot {
        AuthSnapshot {
            user: UserData::new(user, true),
            rooms: snapshot
                .rooms
                .iter()
                .map(|history| RoomData::new(&history.room, &history.messages))
                .collect(),
            users: snapshot.users.iter().map(|u| self.user_data(u)).collect(),
            contacts: snapshot
                .contacts
                .iter()
                .map(|contact| ContactData::for_viewer(contact, user.id))
                .collect(),
        }
    }

    fn user_data(&self, user: &UserRecord) -> UserData {
        UserData::new(user, self.registry.is_online(user.id))
    }

    // ── Messages ──

    async fn message_create(
        &self,
        session: &Arc<Session>,
        room_id: Option<RoomId>,
        text: &str,
    ) -> HandlerResult {
        let user = current_user(session)?;
        let room_id = room_id
            .filter(|room_id| session.in_room(*room_id))
            .ok_or(ErrorCode::UserNotInRoom)?;
        if text.trim().is_empty() {
            return Err(ErrorCode::MessageEmpty.into());
        }

        let message = self.store.create_message(room_id, user.id, text).await?;
        let data = MessageData::from(&message);
        let event = ServerMessage::MessageInfo { message: data.clone() };
        let report = self.registry.notify_room(room_id, &event, Some(session.id())).await;

        debug!(
            message_id = %message.id,
            room_id = %room_id,
            delivered = report.delivered,
            failed = report.failed,
            "message created"
        );
        Ok(SuccessPayload::Message(data))
    }

    async fn message_edit(
        &self,
        session: &Arc<Session>,
        message_id: Option<MessageId>,
        text: &str,
    ) -> HandlerResult {
        let user = current_user(session)?;
        let message_id = message_id.ok_or(ErrorCode::MessageNotFound)?;
        let message = self
            .store
            .get_message(message_id)
            .await?
            .ok_or(ErrorCode::MessageNotFound)?;
        if message.user_id != user.id {
            return Err(ErrorCode::CantEditMessage.into());
        }
        if text.trim().is_empty() {
            return Err(ErrorCode::MessageEmpty.into());
        }

        let updated = self.store.save_message(message_id, text).await?;
        let data = MessageData::from(&updated);
        let event = ServerMessage::MessageEdited { message: data.clone() };
        let report = self
            .registry
            .notify_room(updated.room_id, &event, Some(session.id()))
            .await;

        debug!(
            message_id = %message_id,
            delivered = report.delivered,
            failed = report.failed,
            "message edited"
        );
        Ok(SuccessPayload::Message(data))
    }

    // ── Rooms ──

    async fn room_join(&self, session: &Arc<Session>, room_id: Option<RoomId>) -> HandlerResult {
        let user = current_user(session)?;
        let room_id = room_id.ok_or(ErrorCode::RoomIdRequired)?;
        if session.in_room(room_id) {
            return Err(ErrorCode::AlreadyInRoom.into());
        }
        // Private rooms are only entered through contacts.
        let room = self
            .store
            .find_room(room_id)
            .await?
            .filter(|room| room.enabled && room.room_type == RoomType::Chat)
            .ok_or(ErrorCode::RoomNotFound)?;

        let _ = self.store.add_user_to_room(user.id, room_id).await?;
        let messages = self.store.room_messages(room_id, self.history_limit).await?;
        let data = RoomData::new(&room, &messages);

        let outcome = self.registry.join_user_to_room(user.id, room_id);
        let joined = ServerMessage::UserJoined {
            room_id,
            presence: presence(&user),
        };
        let mut report = self.registry.broadcast(&outcome.existing, &joined).await;
        let devices = other_sessions(outcome.joined, session);
        let added = ServerMessage::AddedToRoom { room: data.clone() };
        report += self.registry.broadcast(&devices, &added).await;

        info!(
            user_id = %user.id,
            room_id = %room_id,
            delivered = report.delivered,
            failed = report.failed,
            "joined room"
        );
        Ok(SuccessPayload::Room(data))
    }

    async fn room_leave(&self, session: &Arc<Session>, room_id: Option<RoomId>) -> HandlerResult {
        let user = current_user(session)?;
        let room_id = room_id
            .filter(|room_id| session.in_room(*room_id))
            .ok_or(ErrorCode::UserNotInRoom)?;

        let _ = self.store.remove_user_from_room(user.id, room_id).await?;
        let left = self.registry.leave_user_from_room(user.id, room_id);

        let mut recipients = self.registry.room_members(room_id);
        recipients.extend(other_sessions(left, session));
        let event = ServerMessage::UserLeave {
            room_id,
            presence: presence(&user),
        };
        let report = self.registry.broadcast(&recipients, &event).await;

        info!(
            user_id = %user.id,
            room_id = %room_id,
            delivered = report.delivered,
            failed = report.failed,
            "left room"
        );
        Ok(SuccessPayload::RoomLeft { room_id })
    }

    async fn room_create(&self, session: &Arc<Session>, name: &str) -> HandlerResult {
        let user = current_user(session)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ErrorCode::RoomNameRequired.into());
        }

        let room = self.store.create_room(name, RoomType::Chat, user.id).await?;
        let data = RoomData::new(&room, &[]);

        let outcome = self.registry.join_user_to_room(user.id, room.id);
        let devices = other_sessions(outcome.joined, session);
        let added = ServerMessage::AddedToRoom { room: data.clone() };
        let report = self.registry.broadcast(&devices, &added).await;

        info!(
            user_id = %user.id,
            room_id = %room.id,
            delivered = report.delivered,
            failed = report.failed,
            "room created"
        );
        Ok(SuccessPayload::Room(data))
    }

    // ── Contacts ──

    async fn contact_add(&self, session: &Arc<Session>, user_id: Option<UserId>) -> HandlerResult {
        let user = current_user(session)?;
        let user_id = user_id
            .filter(|user_id| *user_id != user.id)
            .ok_or(ErrorCode::UserNotFound)?;
        let target = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or(ErrorCode::UserNotFound)?;

        // Check and enable happen under one store lock; a racing add from the
        // other side sees the contact already enabled.
        let activation = self.store.find_or_create_contact(user.id, target.id).await?;
        if !activation.activated {
            return Err(ErrorCode::ContactExists.into());
        }
        let contact = activation.contact;
        let room = self.store.find_or_create_private_room(contact.id).await?;
        let _ = self.store.add_user_to_room(user.id, room.id).await?;
        let _ = self.store.add_user_to_room(target.id, room.id).await?;
        let messages = self.store.room_messages(room.id, self.history_limit).await?;
        let room_data = RoomData::new(&room, &messages);

        let _ = self.registry.join_user_to_room(user.id, room.id);
        let _ = self.registry.join_user_to_room(target.id, room.id);

        let own_data = UserData {
            id: user.id,
            login: user.login.clone(),
            name: user.name.clone(),
            online: true,
        };
        let target_data = self.user_data(&target);

        let to_target = ServerMessage::AddedContact {
            contact_id: contact.id,
            user: own_data,
            room: room_data.clone(),
        };
        let mut report = self.registry.notify_user(target.id, &to_target, None).await;
        let to_devices = ServerMessage::AddedContact {
            contact_id: contact.id,
            user: target_data.clone(),
            room: room_data.clone(),
        };
        report += self
            .registry
            .notify_user(user.id, &to_devices, Some(session.id()))
            .await;

        info!(
            user_id = %user.id,
            contact_id = %contact.id,
            target = %target.id,
            delivered = report.delivered,
            failed = report.failed,
            "contact added"
        );
        Ok(SuccessPayload::ContactAdded {
            contact_id: contact.id,
            room: room_data,
            user: target_data,
        })
    }

    async fn contact_remove(&self, session: &Arc<Session>, user_id: Option<UserId>) -> HandlerResult {
        let user = current_user(session)?;
        let user_id = user_id.ok_or(ErrorCode::UserNotFound)?;
        let target = self
            .store
            .find_user_by_id(user_id)
            .await?
            .ok_or(ErrorCode::UserNotFound)?;
        let contact = self
            .store
            .find_contact(user.id, target.id)
            .await?
            .filter(|contact| contact.enabled)
            .ok_or(ErrorCode::ContactNotExists)?;

        self.store.set_contact_enabled(contact.id, false).await?;
        let room_id = self.store.find_private_room(contact.id).await?.map(|room| room.id);
        if let Some(room_id) = room_id {
            self.store.set_room_enabled(room_id, false).await?;
            let _ = self.registry.leave_user_from_room(user.id, room_id);
            let _ = self.registry.leave_user_from_room(target.id, room_id);
        }

        let to_target = ServerMessage::RemovedContact {
            contact_id: contact.id,
            user_id: user.id,
            room_id,
        };
        let mut report = self.registry.notify_user(target.id, &to_target, None).await;
        let to_devices = ServerMessage::RemovedContact {
            contact_id: contact.id,
            user_id: target.id,
            room_id,
        };
        report += self
            .registry
            .notify_user(user.id, &to_devices, Some(session.id()))
            .await;

        info!(
            user_id = %user.id,
            contact_id = %contact.id,
            delivered = report.delivered,
            failed = report.failed,
            "contact removed"
        );
        Ok(SuccessPayload::ContactRemoved {
            contact_id: contact.id,
            room_id,
        })
    }

    // ── Search ──

    async fn users_search(&self, session: &Arc<Session>, name: &str) -> HandlerResult {
        let user = current_user(session)?;
        let found = self
            .store
            .search_users_by_name(name.trim(), Some(user.id), self.search_limit)
            .await?;
        Ok(SuccessPayload::Users(
            found.iter().map(|u| self.user_data(u)).collect(),
        ))
    }
}

fn current_user(session: &Session) -> Result<SessionUser, CommandError> {
    session.user().ok_or_else(|| ErrorCode::AuthNeed.into())
}

fn presence(user: &SessionUser) -> Presence {
    Presence {
        user_id: user.id,
        user_name: user.name.clone(),
    }
}

fn other_sessions(sessions: Vec<Arc<Session>>, current: &Session) -> Vec<Arc<Session>> {
    sessions
        .into_iter()
        .filter(|s| s.id() != current.id())
        .collect()
}
