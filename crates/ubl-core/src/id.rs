//! Identifier scheme.
//!
//! All identifiers are UTF-8 strings of the form `<prefix>:<slug>`:
//! tenants `t:`, users `u:`, rooms `r:`, messages `m:`, workspaces `w:`,
//! documents `d:`, agreements `a:`, content ids `c:`, head hashes `h:`,
//! body hashes `b:`, sessions `s:`, requests `req:`.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

/// Pattern for room ids, also published in tool input schemas.
pub const ROOM_ID_PATTERN: &str = "^r:[a-z0-9-]{1,50}$";

/// Pattern for tenant ids.
pub const TENANT_ID_PATTERN: &str = "^t:[a-z0-9._-]{1,100}$";

/// Pattern for message ids.
pub const MSG_ID_PATTERN: &str = "^m:[0-9a-f-]{36}$";

/// Pattern for workspace ids.
pub const WORKSPACE_ID_PATTERN: &str = "^w:[a-z0-9-]{1,50}$";

/// Pattern for document ids.
pub const DOCUMENT_ID_PATTERN: &str = "^d:[0-9a-f-]{36}$";

static ROOM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ROOM_ID_PATTERN).expect("room id pattern"));
static MSG_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(MSG_ID_PATTERN).expect("msg id pattern"));
static WORKSPACE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(WORKSPACE_ID_PATTERN).expect("workspace id pattern"));

/// Maximum slug length for room and workspace ids.
pub const MAX_SLUG_LEN: usize = 50;

/// Lowercases, maps spaces to `-`, strips everything outside `[a-z0-9-]`,
/// and truncates to [`MAX_SLUG_LEN`].
#[must_use]
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.to_lowercase().chars() {
        match ch {
            ' ' => out.push('-'),
            'a'..='z' | '0'..='9' | '-' => out.push(ch),
            _ => {}
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    out
}

/// Builds a room id from a display name: `r:<slug(name)>`.
#[must_use]
pub fn room_id_from_name(name: &str) -> String {
    format!("r:{}", slug(name))
}

/// True when `id` matches the room id pattern.
#[must_use]
pub fn is_valid_room_id(id: &str) -> bool {
    ROOM_ID_RE.is_match(id)
}

/// True when `id` matches the message id pattern.
#[must_use]
pub fn is_valid_msg_id(id: &str) -> bool {
    MSG_ID_RE.is_match(id)
}

/// True when `id` matches the workspace id pattern.
#[must_use]
pub fn is_valid_workspace_id(id: &str) -> bool {
    WORKSPACE_ID_RE.is_match(id)
}

/// Mints a fresh message id `m:<uuid>`.
#[must_use]
pub fn mint_msg_id() -> String {
    format!("m:{}", Uuid::new_v4())
}

/// Mints a fresh document id `d:<uuid>`.
#[must_use]
pub fn mint_document_id() -> String {
    format!("d:{}", Uuid::new_v4())
}

/// Mints a fresh session id `s:<uuid>`.
#[must_use]
pub fn mint_session_id() -> String {
    format!("s:{}", Uuid::new_v4())
}

/// Mints a fresh request id `req:<uuid>`.
#[must_use]
pub fn mint_request_id() -> String {
    format!("req:{}", Uuid::new_v4())
}

/// Agreement id for a tenant license: `a:tenant:<tenant_id>`.
#[must_use]
pub fn tenant_agreement_id(tenant_id: &str) -> String {
    format!("a:tenant:{tenant_id}")
}

/// Agreement id for room governance: `a:room:<room_id>`.
#[must_use]
pub fn room_agreement_id(room_id: &str) -> String {
    format!("a:room:{room_id}")
}

/// Agreement id for a workspace: `a:workspace:<workspace_id>`.
#[must_use]
pub fn workspace_agreement_id(workspace_id: &str) -> String {
    format!("a:workspace:{workspace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_lowercases_and_strips() {
        assert_eq!(slug("General"), "general");
        assert_eq!(slug("Incident Response"), "incident-response");
        assert_eq!(slug("Ops // EMEA!"), "ops--emea");
    }

    #[test]
    fn slug_truncates_to_fifty() {
        let long = "x".repeat(80);
        assert_eq!(slug(&long).len(), MAX_SLUG_LEN);
    }

    #[test]
    fn room_id_round_trip() {
        let id = room_id_from_name("General");
        assert_eq!(id, "r:general");
        assert!(is_valid_room_id(&id));
        assert!(!is_valid_room_id("general"));
        assert!(!is_valid_room_id("r:"));
        assert!(!is_valid_room_id("r:Has Caps"));
    }

    #[test]
    fn minted_ids_carry_prefixes() {
        assert!(is_valid_msg_id(&mint_msg_id()));
        assert!(mint_document_id().starts_with("d:"));
        assert!(mint_session_id().starts_with("s:"));
        assert!(mint_request_id().starts_with("req:"));
    }

    #[test]
    fn agreement_ids() {
        assert_eq!(tenant_agreement_id("t:ex.com"), "a:tenant:t:ex.com");
        assert_eq!(room_agreement_id("r:general"), "a:room:r:general");
        assert_eq!(
            workspace_agreement_id("w:research"),
            "a:workspace:w:research"
        );
    }
}
