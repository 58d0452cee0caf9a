//! Ledger atoms, receipts, and messages.
//!
//! An atom is one entry in a ledger shard: an `action.v1` records what was
//! attempted, an `effect.v1` records what resulted and names the action it
//! pairs with by content id. Atoms are created once and never mutated.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canon::{self, CanonError};
use crate::hash;

/// Current wall-clock time as an RFC 3339 UTC timestamp with millisecond
/// precision.
#[must_use]
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The operation an action atom records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Did {
    /// A chat message append.
    #[serde(rename = "messenger.send")]
    MessengerSend,
    /// Room creation.
    #[serde(rename = "room.create")]
    RoomCreate,
    /// Tenant creation.
    #[serde(rename = "tenant.create")]
    TenantCreate,
    /// Workspace document creation.
    #[serde(rename = "office.document.create")]
    OfficeDocumentCreate,
    /// Workspace document read.
    #[serde(rename = "office.document.get")]
    OfficeDocumentGet,
    /// Workspace document search.
    #[serde(rename = "office.document.search")]
    OfficeDocumentSearch,
    /// LLM completion request.
    #[serde(rename = "office.llm.complete")]
    OfficeLlmComplete,
    /// Policy evaluation.
    #[serde(rename = "policy.evaluate")]
    PolicyEvaluate,
}

/// Action disposition at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// The action ran to completion.
    Executed,
    /// The action is awaiting an external step.
    Pending,
    /// The action failed.
    Failed,
}

/// The principal behind an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// User id, `u:<slug>`.
    pub user_id: String,
    /// Verified email.
    pub email: String,
    /// Present and true for machine principals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_service: Option<bool>,
}

impl Actor {
    /// Builds an actor from a verified identity.
    #[must_use]
    pub fn from_identity(identity: &crate::identity::Identity) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            email: identity.email.clone(),
            is_service: identity.is_service.then_some(true),
        }
    }
}

/// Correlation back to the originating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// The request id carried on the response envelope.
    pub request_id: String,
}

/// What was attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionAtom {
    /// Owning tenant.
    pub tenant_id: String,
    /// Content id, spliced in by the ledger on append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Head hash before this atom, spliced in by the ledger on append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// RFC 3339 timestamp.
    pub when: String,
    /// The acting principal.
    pub who: Actor,
    /// The operation performed.
    pub did: Did,
    /// Operation-specific context fields.
    pub this: Value,
    /// The agreement authorizing this action, or null.
    pub agreement_id: Option<String>,
    /// Disposition.
    pub status: ActionStatus,
    /// Request correlation.
    pub trace: Trace,
}

/// Outcome of an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The effect applied.
    Ok,
    /// The effect failed.
    Error,
}

/// One applied state change inside an effect atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectOp {
    /// Operation name, e.g. `room.append`.
    pub op: String,
    /// Operation-specific target fields.
    #[serde(flatten)]
    pub targets: serde_json::Map<String, Value>,
}

impl EffectOp {
    /// Builds an effect op from a name and target fields.
    #[must_use]
    pub fn new(op: impl Into<String>, targets: serde_json::Map<String, Value>) -> Self {
        Self {
            op: op.into(),
            targets,
        }
    }
}

/// Pointers from an effect to the entities it created or touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointers {
    /// Message created by the effect, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    /// Document created by the effect, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

/// Error detail on a failed effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

/// What resulted from an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectAtom {
    /// Owning tenant.
    pub tenant_id: String,
    /// Content id, spliced in by the ledger on append.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Content id of the action this effect pairs with.
    pub ref_action_cid: String,
    /// RFC 3339 timestamp.
    pub when: String,
    /// Whether the effect applied.
    pub outcome: Outcome,
    /// The state changes applied.
    pub effects: Vec<EffectOp>,
    /// Entities created or touched.
    pub pointers: Pointers,
    /// Failure detail when `outcome` is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// One ledger entry: an action or its paired effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Atom {
    /// What was attempted.
    #[serde(rename = "action.v1")]
    Action(ActionAtom),
    /// What resulted.
    #[serde(rename = "effect.v1")]
    Effect(EffectAtom),
}

impl Atom {
    /// The atom kind discriminator as serialized.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Action(_) => "action.v1",
            Self::Effect(_) => "effect.v1",
        }
    }

    /// Owning tenant id.
    #[must_use]
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Action(a) => &a.tenant_id,
            Self::Effect(e) => &e.tenant_id,
        }
    }

    /// The content id, if already assigned.
    #[must_use]
    pub fn cid(&self) -> Option<&str> {
        match self {
            Self::Action(a) => a.cid.as_deref(),
            Self::Effect(e) => e.cid.as_deref(),
        }
    }

    /// Assigns the content id.
    pub fn set_cid(&mut self, cid: String) {
        match self {
            Self::Action(a) => a.cid = Some(cid),
            Self::Effect(e) => e.cid = Some(cid),
        }
    }

    /// The acting user for index rows; effects carry no principal.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Action(a) => Some(&a.who.user_id),
            Self::Effect(_) => None,
        }
    }

    /// Computes this atom's content id.
    ///
    /// The hash input is the atom as submitted: the `cid` field is stripped,
    /// and for action atoms `prev_hash` is stripped too, because both are
    /// spliced in after the id is computed. Keeping `prev_hash` out of the
    /// input makes a bit-identical resubmission hash identically even though
    /// the chain head has moved, which is what the dedup window keys on.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] when the atom is not canonicalizable.
    pub fn compute_cid(&self) -> Result<String, CanonError> {
        let mut value = serde_json::to_value(self).map_err(|e| CanonError::Parse {
            message: e.to_string(),
        })?;
        if matches!(self, Self::Action(_)) {
            value = canon::strip_field(&value, "prev_hash");
        }
        hash::cid_for_value(&value)
    }
}

/// Proof of append returned by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// The shard the atom landed in (`"0"` in this core).
    pub ledger_shard: String,
    /// Sequence number within the shard, starting at 1.
    pub seq: u64,
    /// Content id of the appended atom.
    pub cid: String,
    /// Head hash of the shard after the append.
    pub head_hash: String,
    /// RFC 3339 timestamp of the append.
    pub time: String,
}

/// Message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Ordinary user text.
    Text,
    /// Coordinator-generated notices.
    System,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// The message text.
    pub text: String,
}

/// A message on a room timeline, receipt included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique message id, `m:<uuid>`.
    pub msg_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning room.
    pub room_id: String,
    /// Strictly monotonic per-room ordinal, starting at 1.
    pub room_seq: u64,
    /// Sender user id.
    pub sender_id: String,
    /// RFC 3339 timestamp assigned at store time.
    pub sent_at: String,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// The body.
    pub body: MessageBody,
    /// Message this one replies to, if any.
    pub reply_to: Option<String>,
    /// Attachments (always empty in this core).
    #[serde(default)]
    pub attachments: Vec<Value>,
    /// Receipt of the `messenger.send` action atom.
    pub receipt: Receipt,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_action() -> ActionAtom {
        ActionAtom {
            tenant_id: "t:ex.com".into(),
            cid: None,
            prev_hash: None,
            when: "2026-01-01T00:00:00.000Z".into(),
            who: Actor {
                user_id: "u:alice".into(),
                email: "alice@ex.com".into(),
                is_service: None,
            },
            did: Did::MessengerSend,
            this: json!({"room_id": "r:general", "room_seq": 1}),
            agreement_id: Some("a:room:r:general".into()),
            status: ActionStatus::Executed,
            trace: Trace {
                request_id: "req:1".into(),
            },
        }
    }

    #[test]
    fn kind_tag_serializes() {
        let atom = Atom::Action(sample_action());
        let v = serde_json::to_value(&atom).unwrap();
        assert_eq!(v["kind"], "action.v1");
        assert_eq!(v["did"], "messenger.send");
        assert_eq!(v["status"], "executed");
        // Unset cid and prev_hash are omitted, not null.
        assert!(v.get("cid").is_none());
        assert!(v.get("prev_hash").is_none());
        // agreement_id is explicitly nullable, so it always serializes.
        assert!(v.get("agreement_id").is_some());
    }

    #[test]
    fn atom_round_trips() {
        let mut action = sample_action();
        action.cid = Some("c:abc".into());
        action.prev_hash = Some(crate::hash::GENESIS_HEAD.into());
        let atom = Atom::Action(action);
        let json = serde_json::to_string(&atom).unwrap();
        let back: Atom = serde_json::from_str(&json).unwrap();
        assert_eq!(atom, back);
    }

    #[test]
    fn cid_ignores_spliced_fields() {
        let submitted = Atom::Action(sample_action());
        let cid = submitted.compute_cid().unwrap();

        let mut stored = sample_action();
        stored.cid = Some(cid.clone());
        stored.prev_hash = Some(crate::hash::GENESIS_HEAD.into());
        let stored = Atom::Action(stored);

        assert_eq!(stored.compute_cid().unwrap(), cid);
    }

    #[test]
    fn effect_references_action() {
        let effect = Atom::Effect(EffectAtom {
            tenant_id: "t:ex.com".into(),
            cid: None,
            ref_action_cid: "c:abc".into(),
            when: now_iso(),
            outcome: Outcome::Ok,
            effects: vec![EffectOp::new("room.append", {
                let mut m = serde_json::Map::new();
                m.insert("room_id".into(), json!("r:general"));
                m.insert("room_seq".into(), json!(1));
                m
            })],
            pointers: Pointers {
                msg_id: Some("m:x".into()),
                document_id: None,
            },
            error: None,
        });
        let v = serde_json::to_value(&effect).unwrap();
        assert_eq!(v["kind"], "effect.v1");
        assert_eq!(v["effects"][0]["op"], "room.append");
        assert_eq!(v["effects"][0]["room_id"], "r:general");
        assert_eq!(v["pointers"]["msg_id"], "m:x");
        assert!(v["pointers"].get("document_id").is_none());
    }

    #[test]
    fn distinct_content_distinct_cids() {
        let a = Atom::Action(sample_action());
        let mut other = sample_action();
        other.this = json!({"room_id": "r:general", "room_seq": 2});
        let b = Atom::Action(other);
        assert_ne!(a.compute_cid().unwrap(), b.compute_cid().unwrap());
    }
}
