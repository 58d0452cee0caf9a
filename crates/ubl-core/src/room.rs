//! Per-room coordinator.
//!
//! The sole writer for a `(tenant, room)` pair. Owns the room config, the
//! `room_seq` counter, a bounded hot window of messages, the idempotency
//! `seen` window, and the in-memory subscriber set.
//!
//! A room moves `uninitialized → initialized` exactly once: `init` creates
//! the config and sends the `system` message `"Room created: <name>"`, which
//! itself produces a receipt and broadcasts like any other message.
//!
//! Membership is frictionless in this core: `assert_member` auto-adds the
//! caller and never rejects. Stricter modes would fail with `not_a_member`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::atom::{
    now_iso, ActionAtom, ActionStatus, Actor, Atom, EffectAtom, EffectOp, Message, MessageBody,
    MessageType, Outcome, Pointers, Trace,
};
use crate::bounded::FifoMap;
use crate::error::ApiError;
use crate::hash;
use crate::id;
use crate::identity::Identity;
use crate::ledger::LedgerHandle;
use crate::runtime::RuntimeCounters;
use crate::store::StateStore;
use crate::tenant::Role;

/// Room mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomMode {
    /// Members of the owning tenant.
    Internal,
    /// Cross-tenant guests allowed.
    External,
    /// End-to-end encrypted (out of scope; mode is carried only).
    E2ee,
}

/// One room member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMember {
    /// Membership role.
    pub role: Role,
    /// RFC 3339 join timestamp.
    pub joined_at: String,
}

/// Per-room policy knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPolicy {
    /// Maximum serialized body size in bytes.
    pub max_message_bytes: usize,
    /// Retention horizon in days.
    pub retention_days: u32,
}

/// Room configuration owned by this coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Owning tenant.
    pub tenant_id: String,
    /// Room id, `r:<slug>`.
    pub room_id: String,
    /// Display name.
    pub name: String,
    /// Room mode.
    pub mode: RoomMode,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Members by user id.
    pub members: BTreeMap<String, RoomMember>,
    /// Policy knobs.
    pub policy: RoomPolicy,
    /// Hot-window size in messages.
    pub hot_limit: usize,
}

/// Idempotency record for one `client_request_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    /// Message minted for the original request.
    pub msg_id: String,
    /// Its room ordinal.
    pub room_seq: u64,
    /// Its action receipt sequence.
    pub receipt_seq: u64,
}

/// Write request for [`RoomCoordinator::send_message`].
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageInput {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The body.
    pub body: MessageBody,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Caller-chosen idempotency key.
    #[serde(default)]
    pub client_request_id: Option<String>,
}

/// A page of history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    /// Messages in ascending `room_seq` order.
    pub messages: Vec<Message>,
    /// Smallest `room_seq` of the page when older messages may remain in
    /// the hot window; null otherwise.
    pub next_cursor: Option<u64>,
}

/// One event on a room stream.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    /// SSE `id:` value (the `room_seq` for message events).
    pub id: u64,
    /// SSE `event:` name.
    pub event: String,
    /// SSE `data:` payload, serialized as single-line JSON.
    pub data: Value,
}

/// Persisted coordinator state document. Subscribers are in-memory only.
#[derive(Debug, Serialize, Deserialize)]
struct RoomDoc {
    config: Option<RoomConfig>,
    seq: u64,
    hot: Vec<Message>,
    seen: FifoMap<String, SeenEntry>,
}

/// The single-writer room coordinator.
pub struct RoomCoordinator {
    tenant_id: String,
    room_id: String,
    key: String,
    config: Option<RoomConfig>,
    seq: u64,
    hot: VecDeque<Message>,
    seen: FifoMap<String, SeenEntry>,
    subscribers: Vec<mpsc::Sender<RoomEvent>>,
    counters: Arc<RuntimeCounters>,
    state_store: Arc<dyn StateStore>,
}

impl RoomCoordinator {
    /// Deterministic state-store key for a room.
    #[must_use]
    pub fn storage_key(tenant_id: &str, room_id: &str) -> String {
        format!("{tenant_id}|{room_id}")
    }

    /// Loads room state from the keyed store.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored document cannot be read.
    pub fn load(
        tenant_id: &str,
        room_id: &str,
        seen_limit: usize,
        counters: Arc<RuntimeCounters>,
        state_store: Arc<dyn StateStore>,
    ) -> Result<Self, ApiError> {
        let key = Self::storage_key(tenant_id, room_id);
        let doc = state_store
            .load(&key)?
            .map(serde_json::from_value::<RoomDoc>)
            .transpose()?;
        let (config, seq, hot, seen) = match doc {
            Some(doc) => (doc.config, doc.seq, doc.hot.into(), doc.seen),
            None => (None, 0, VecDeque::new(), FifoMap::new(seen_limit)),
        };
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            room_id: room_id.to_string(),
            key,
            config,
            seq,
            hot,
            seen,
            subscribers: Vec::new(),
            counters,
            state_store,
        })
    }

    /// True once `init` has run.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// The room config, when initialized.
    #[must_use]
    pub fn config(&self) -> Option<&RoomConfig> {
        self.config.as_ref()
    }

    /// Initializes the room: creates the config and sends the system
    /// message `"Room created: <name>"` through the ordinary send pipeline.
    ///
    /// Idempotent: an initialized room returns immediately. The system
    /// message uses a deterministic idempotency key, so a replayed init
    /// cannot double-send it.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence or the ledger append fails.
    pub async fn init(
        &mut self,
        name: &str,
        mode: RoomMode,
        creator: &Identity,
        request_id: &str,
        max_message_bytes: usize,
        hot_limit: usize,
        ledger: &LedgerHandle,
    ) -> Result<(), ApiError> {
        if self.config.is_some() {
            return Ok(());
        }

        let now = now_iso();
        let mut members = BTreeMap::new();
        members.insert(
            creator.user_id.clone(),
            RoomMember {
                role: Role::Owner,
                joined_at: now.clone(),
            },
        );
        self.config = Some(RoomConfig {
            tenant_id: self.tenant_id.clone(),
            room_id: self.room_id.clone(),
            name: name.to_string(),
            mode,
            created_at: now,
            members,
            policy: RoomPolicy {
                max_message_bytes,
                retention_days: 365,
            },
            hot_limit,
        });
        self.persist()?;

        let input = SendMessageInput {
            kind: MessageType::System,
            body: MessageBody {
                text: format!("Room created: {name}"),
            },
            reply_to: None,
            client_request_id: Some(format!("init:{}", self.room_id)),
        };
        self.send_message(input, creator, request_id, ledger).await?;
        debug!(tenant = %self.tenant_id, room = %self.room_id, "room initialized");
        Ok(())
    }

    /// Ensures the caller is a member, auto-adding them when absent.
    ///
    /// # Errors
    ///
    /// Returns `not_found` on an uninitialized room or an error on a
    /// persistence failure.
    pub fn assert_member(&mut self, identity: &Identity) -> Result<Role, ApiError> {
        let room_id = self.room_id.clone();
        let config = self
            .config
            .as_mut()
            .ok_or_else(|| ApiError::not_found("room", room_id))?;
        if let Some(member) = config.members.get(&identity.user_id) {
            return Ok(member.role);
        }
        config.members.insert(
            identity.user_id.clone(),
            RoomMember {
                role: Role::Member,
                joined_at: now_iso(),
            },
        );
        self.persist()?;
        Ok(Role::Member)
    }

    /// Appends a message to the timeline.
    ///
    /// The pipeline: membership, idempotency lookup, validation, `room_seq`
    /// assignment, the `messenger.send` action atom, the paired
    /// `room.append` effect atom, message storage with the **action's**
    /// receipt, `seen` recording, and broadcast.
    ///
    /// # Errors
    ///
    /// Returns validation errors before any state change, or an internal
    /// error when persistence or the action append fails. An effect-only
    /// append failure does not fail the send: the receipt is proof of
    /// action, and the failure is counted and logged.
    pub async fn send_message(
        &mut self,
        input: SendMessageInput,
        identity: &Identity,
        request_id: &str,
        ledger: &LedgerHandle,
    ) -> Result<Message, ApiError> {
        self.assert_member(identity)?;
        let Some(config) = self.config.clone() else {
            return Err(ApiError::not_found("room", self.room_id.clone()));
        };

        // Idempotency: at-most-once per client_request_id while in `seen`.
        let client_request_id = input
            .client_request_id
            .clone()
            .unwrap_or_else(|| request_id.to_string());
        if let Some(entry) = self.seen.get(&client_request_id).cloned() {
            self.counters.idempotent_replays.fetch_add(1, Ordering::Relaxed);
            return self
                .hot
                .iter()
                .find(|m| m.room_seq == entry.room_seq)
                .cloned()
                .ok_or(ApiError::IdempotencyEvicted { client_request_id });
        }

        // Validation, before any state change.
        let body_value = serde_json::to_value(&input.body)?;
        let body_size = serde_json::to_string(&input.body)?.len();
        if body_size > config.policy.max_message_bytes {
            return Err(ApiError::MessageTooLarge {
                size: body_size,
                max: config.policy.max_message_bytes,
            });
        }
        if let Some(reply_to) = &input.reply_to {
            if !id::is_valid_msg_id(reply_to) {
                return Err(ApiError::validation(format!(
                    "reply_to is not a message id: {reply_to}"
                )));
            }
        }

        // Assign room_seq and persist the counter before touching the
        // ledger, so a concurrent accept cannot reuse it.
        self.seq += 1;
        let room_seq = self.seq;
        self.persist()?;

        let msg_id = id::mint_msg_id();
        let body_hash = hash::body_hash(&body_value)?;
        let action = Atom::Action(ActionAtom {
            tenant_id: self.tenant_id.clone(),
            cid: None,
            prev_hash: None,
            when: now_iso(),
            who: Actor::from_identity(identity),
            did: crate::atom::Did::MessengerSend,
            this: json!({
                "room_id": self.room_id,
                "msg_id": msg_id,
                "room_seq": room_seq,
                "body_hash": body_hash,
            }),
            agreement_id: Some(id::room_agreement_id(&self.room_id)),
            status: ActionStatus::Executed,
            trace: Trace {
                request_id: request_id.to_string(),
            },
        });

        let outcome = match ledger.append_atom(action).await {
            Ok(outcome) => outcome,
            Err(err) => {
                // Roll the consumed ordinal back so accepted room_seqs stay
                // dense.
                self.seq -= 1;
                if let Err(persist_err) = self.persist() {
                    error!(
                        tenant = %self.tenant_id,
                        room = %self.room_id,
                        error = %persist_err,
                        "room_seq rollback persist failed"
                    );
                }
                return Err(err);
            }
        };
        self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);

        let effect = Atom::Effect(EffectAtom {
            tenant_id: self.tenant_id.clone(),
            cid: None,
            ref_action_cid: outcome.receipt.cid.clone(),
            when: now_iso(),
            outcome: Outcome::Ok,
            effects: vec![EffectOp::new("room.append", {
                let mut targets = serde_json::Map::new();
                targets.insert("room_id".into(), json!(self.room_id));
                targets.insert("room_seq".into(), json!(room_seq));
                targets
            })],
            pointers: Pointers {
                msg_id: Some(msg_id.clone()),
                document_id: None,
            },
            error: None,
        });
        match ledger.append_atom(effect).await {
            Ok(_) => {
                self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // The action is committed; the receipt stays proof of
                // action. Counted for operators watching the asymmetry.
                self.counters
                    .effect_append_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(
                    tenant = %self.tenant_id,
                    room = %self.room_id,
                    room_seq,
                    error = %err,
                    "effect append failed after committed action"
                );
            }
        }

        let message = Message {
            msg_id: msg_id.clone(),
            tenant_id: self.tenant_id.clone(),
            room_id: self.room_id.clone(),
            room_seq,
            sender_id: identity.user_id.clone(),
            sent_at: now_iso(),
            kind: input.kind,
            body: input.body,
            reply_to: input.reply_to,
            attachments: Vec::new(),
            receipt: outcome.receipt.clone(),
        };

        self.hot.push_back(message.clone());
        while self.hot.len() > config.hot_limit {
            self.hot.pop_front();
        }
        self.seen.insert(
            client_request_id,
            SeenEntry {
                msg_id,
                room_seq,
                receipt_seq: outcome.receipt.seq,
            },
        );
        self.persist()?;

        self.broadcast(RoomEvent {
            id: room_seq,
            event: "message.created".to_string(),
            data: json!({"message": message}),
        });

        Ok(message)
    }

    /// Pages hot-window history.
    ///
    /// Without a cursor: up to `limit` newest messages, ascending. With one:
    /// up to `limit` newest messages below it, ascending. `next_cursor` is
    /// the smallest returned `room_seq` while older messages remain in hot,
    /// null otherwise. History outside the hot window is unavailable.
    #[must_use]
    pub fn get_history(&self, cursor: Option<u64>, limit: usize) -> HistoryPage {
        let hot_min = self.hot.front().map_or(u64::MAX, |m| m.room_seq);
        let below: Vec<&Message> = match cursor {
            None => self.hot.iter().collect(),
            Some(cursor) => self.hot.iter().filter(|m| m.room_seq < cursor).collect(),
        };
        let skip = below.len().saturating_sub(limit);
        let messages: Vec<Message> = below[skip..].iter().map(|m| (*m).clone()).collect();

        let next_cursor = messages
            .first()
            .filter(|m| m.room_seq > hot_min)
            .map(|m| m.room_seq);
        HistoryPage {
            messages,
            next_cursor,
        }
    }

    /// Subscribes to the live stream, replaying missed hot messages.
    ///
    /// With `from_seq`, every hot message with `room_seq > from_seq` is
    /// replayed first; when the hot window no longer reaches back that far,
    /// a `room.gap` event precedes the replay so the client can backfill
    /// from history. The returned receiver ends when the subscriber is
    /// reaped (send failure on disconnect).
    ///
    /// # Errors
    ///
    /// Returns `not_found` on an uninitialized room or an error on a
    /// persistence failure while auto-joining.
    pub fn subscribe(
        &mut self,
        identity: &Identity,
        from_seq: Option<u64>,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RoomEvent>, ApiError> {
        self.assert_member(identity)?;

        let (tx, rx) = mpsc::channel(capacity.max(self.hot.len() + 16));

        if let Some(from_seq) = from_seq {
            if let Some(hot_min) = self.hot.front().map(|m| m.room_seq) {
                if hot_min > from_seq + 1 {
                    let _ = tx.try_send(RoomEvent {
                        id: from_seq + 1,
                        event: "room.gap".to_string(),
                        data: json!({
                            "from_seq": from_seq + 1,
                            "available_from": hot_min,
                        }),
                    });
                }
            }
            for message in self.hot.iter().filter(|m| m.room_seq > from_seq) {
                let _ = tx.try_send(RoomEvent {
                    id: message.room_seq,
                    event: "message.created".to_string(),
                    data: json!({"message": message}),
                });
            }
        }

        self.subscribers.push(tx);
        self.counters
            .sse_subscribers
            .store(self.subscribers.len() as u64, Ordering::Relaxed);
        Ok(rx)
    }

    /// Sends an event to every live subscriber, reaping dead ones.
    ///
    /// Writes are non-blocking: a full or closed channel drops that
    /// subscriber without holding up the rest.
    fn broadcast(&mut self, event: RoomEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    tenant = %self.tenant_id,
                    room = %self.room_id,
                    error = %err,
                    "dropping dead subscriber"
                );
                false
            }
        });
        self.counters
            .sse_subscribers
            .store(self.subscribers.len() as u64, Ordering::Relaxed);
    }

    fn persist(&self) -> Result<(), ApiError> {
        let doc = RoomDoc {
            config: self.config.clone(),
            seq: self.seq,
            hot: self.hot.iter().cloned().collect(),
            seen: self.seen.clone(),
        };
        let value = serde_json::to_value(&doc)?;
        self.state_store.save(&self.key, &value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerCoordinator, SHARD_ZERO};
    use crate::store::{IndexStore, MemoryStateStore};

    fn ledger() -> LedgerHandle {
        LedgerHandle::new(
            LedgerCoordinator::load(
                "t:ex.com",
                SHARD_ZERO,
                2000,
                5000,
                Arc::new(MemoryStateStore::new()),
                Arc::new(IndexStore::in_memory().unwrap()),
            )
            .unwrap(),
        )
    }

    fn room() -> RoomCoordinator {
        RoomCoordinator::load(
            "t:ex.com",
            "r:general",
            2000,
            Arc::new(RuntimeCounters::default()),
            Arc::new(MemoryStateStore::new()),
        )
        .unwrap()
    }

    async fn initialized_room(ledger: &LedgerHandle) -> RoomCoordinator {
        let mut r = room();
        let alice = Identity::new("u:alice", "alice@ex.com");
        r.init("general", RoomMode::Internal, &alice, "req:init", 8000, 500, ledger)
            .await
            .unwrap();
        r
    }

    fn text_input(text: &str, key: Option<&str>) -> SendMessageInput {
        SendMessageInput {
            kind: MessageType::Text,
            body: MessageBody { text: text.into() },
            reply_to: None,
            client_request_id: key.map(Into::into),
        }
    }

    #[tokio::test]
    async fn init_sends_system_message_with_receipt() {
        let ledger = ledger();
        let r = initialized_room(&ledger).await;
        let page = r.get_history(None, 50);
        assert_eq!(page.messages.len(), 1);
        let system = &page.messages[0];
        assert_eq!(system.room_seq, 1);
        assert_eq!(system.kind, MessageType::System);
        assert_eq!(system.body.text, "Room created: general");
        assert_eq!(system.receipt.seq, 1);
        // Action at seq 1, paired effect at seq 2.
        assert_eq!(ledger.state().await.seq, 2);
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let alice = Identity::new("u:alice", "alice@ex.com");
        r.init("general", RoomMode::Internal, &alice, "req:again", 8000, 500, &ledger)
            .await
            .unwrap();
        assert_eq!(r.get_history(None, 50).messages.len(), 1);
        assert_eq!(ledger.state().await.seq, 2);
    }

    #[tokio::test]
    async fn room_seq_is_dense_and_receipts_chain() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");

        let m1 = r
            .send_message(text_input("hi", Some("k1")), &bob, "req:1", &ledger)
            .await
            .unwrap();
        let m2 = r
            .send_message(text_input("again", Some("k2")), &bob, "req:2", &ledger)
            .await
            .unwrap();

        assert_eq!(m1.room_seq, 2);
        assert_eq!(m2.room_seq, 3);
        // Pairs: (1,2) system, (3,4) hi, (5,6) again.
        assert_eq!(m1.receipt.seq, 3);
        assert_eq!(m2.receipt.seq, 5);
        assert!(ledger.verify_chain().await.valid);
    }

    #[tokio::test]
    async fn idempotent_replay_returns_same_message() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");

        let first = r
            .send_message(text_input("hi", Some("k1")), &bob, "req:1", &ledger)
            .await
            .unwrap();
        let seq_after_first = ledger.state().await.seq;
        let replay = r
            .send_message(text_input("hi", Some("k1")), &bob, "req:2", &ledger)
            .await
            .unwrap();

        assert_eq!(first.msg_id, replay.msg_id);
        assert_eq!(first.room_seq, replay.room_seq);
        assert_eq!(first.receipt, replay.receipt);
        // No new atoms were appended for the replay.
        assert_eq!(ledger.state().await.seq, seq_after_first);
    }

    #[tokio::test]
    async fn request_id_is_fallback_idempotency_key() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");

        let first = r
            .send_message(text_input("hi", None), &bob, "req:same", &ledger)
            .await
            .unwrap();
        let replay = r
            .send_message(text_input("hi", None), &bob, "req:same", &ledger)
            .await
            .unwrap();
        assert_eq!(first.msg_id, replay.msg_id);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_at_the_boundary() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");

        // `{"text":"..."}` adds 11 bytes around the text itself.
        let max = r.config().unwrap().policy.max_message_bytes;
        let fits = "x".repeat(max - 11);
        let seq_before = ledger.state().await.seq;
        r.send_message(text_input(&fits, Some("ok")), &bob, "req:1", &ledger)
            .await
            .unwrap();

        let over = "x".repeat(max - 10);
        let err = r
            .send_message(text_input(&over, Some("no")), &bob, "req:2", &ledger)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MessageTooLarge { .. }));
        // The rejected send consumed neither a room_seq nor ledger seqs.
        assert_eq!(ledger.state().await.seq, seq_before + 2);
        assert_eq!(r.get_history(None, 50).messages.last().unwrap().room_seq, 2);
    }

    #[tokio::test]
    async fn bad_reply_to_is_rejected() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");
        let mut input = text_input("hi", Some("k"));
        input.reply_to = Some("not-a-msg-id".into());
        assert!(matches!(
            r.send_message(input, &bob, "req:1", &ledger).await,
            Err(ApiError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn history_pages_backwards_with_cursor() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let bob = Identity::new("u:bob", "bob@ex.com");
        for n in 0..9 {
            r.send_message(text_input(&format!("m{n}"), Some(&format!("k{n}"))), &bob, "req", &ledger)
                .await
                .unwrap();
        }
        // room_seq 1..=10 in hot.
        let newest = r.get_history(None, 4);
        assert_eq!(
            newest.messages.iter().map(|m| m.room_seq).collect::<Vec<_>>(),
            vec![7, 8, 9, 10]
        );
        assert_eq!(newest.next_cursor, Some(7));

        let older = r.get_history(Some(7), 4);
        assert_eq!(
            older.messages.iter().map(|m| m.room_seq).collect::<Vec<_>>(),
            vec![3, 4, 5, 6]
        );
        assert_eq!(older.next_cursor, Some(3));

        let oldest = r.get_history(Some(3), 4);
        assert_eq!(
            oldest.messages.iter().map(|m| m.room_seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(oldest.next_cursor, None);
    }

    #[tokio::test]
    async fn subscribe_replays_and_flags_gaps() {
        let ledger = ledger();
        let mut r = room();
        let alice = Identity::new("u:alice", "alice@ex.com");
        // Tiny hot window so seqs 1..=3 are evicted.
        r.init("general", RoomMode::Internal, &alice, "req:init", 8000, 3, &ledger)
            .await
            .unwrap();
        for n in 0..5 {
            r.send_message(
                text_input(&format!("m{n}"), Some(&format!("k{n}"))),
                &alice,
                "req",
                &ledger,
            )
            .await
            .unwrap();
        }
        // Hot now holds room_seq 4..=6.
        let mut rx = r.subscribe(&alice, Some(1), 64).unwrap();

        let gap = rx.try_recv().unwrap();
        assert_eq!(gap.event, "room.gap");
        assert_eq!(gap.data["from_seq"], 2);
        assert_eq!(gap.data["available_from"], 4);

        for expected in 4..=6 {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.event, "message.created");
            assert_eq!(event.id, expected);
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn live_broadcast_reaches_subscriber() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let alice = Identity::new("u:alice", "alice@ex.com");
        let mut rx = r.subscribe(&alice, None, 64).unwrap();

        r.send_message(text_input("live", Some("k")), &alice, "req", &ledger)
            .await
            .unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event, "message.created");
        assert_eq!(event.data["message"]["body"]["text"], "live");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_reaped() {
        let ledger = ledger();
        let mut r = initialized_room(&ledger).await;
        let alice = Identity::new("u:alice", "alice@ex.com");
        let rx = r.subscribe(&alice, None, 64).unwrap();
        drop(rx);
        r.send_message(text_input("after", Some("k")), &alice, "req", &ledger)
            .await
            .unwrap();
        assert!(r.subscribers.is_empty());
    }

    #[tokio::test]
    async fn uninitialized_room_is_not_found() {
        let mut r = room();
        let alice = Identity::new("u:alice", "alice@ex.com");
        assert!(matches!(
            r.assert_member(&alice),
            Err(ApiError::NotFound { .. })
        ));
    }
}
