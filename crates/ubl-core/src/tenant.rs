//! Per-tenant coordinator.
//!
//! The sole writer for a tenant's membership directory and room index.
//! Tenants are created lazily on first touch; the creator becomes `owner`
//! and at least one owner exists from then on. Members are never removed in
//! this core. Cross-coordinator steps (initializing the room a summary
//! points at) are orchestrated by the runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agreement::{Agreement, AgreementType};
use crate::atom::now_iso;
use crate::error::ApiError;
use crate::id;
use crate::identity::Identity;
use crate::room::RoomMode;
use crate::store::{IndexStore, StateStore};

/// Tenant kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantType {
    /// The platform tenant `t:ubl_core`.
    Platform,
    /// Any customer tenant.
    Customer,
}

/// Membership role, shared between tenants and rooms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control; the creator's role.
    Owner,
    /// Administrative rights.
    Admin,
    /// Ordinary membership.
    Member,
}

/// One tenant member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Membership role.
    pub role: Role,
    /// Member email at join time.
    pub email: String,
    /// RFC 3339 join timestamp.
    pub joined_at: String,
}

/// Tenant-wide defaults applied to new rooms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDefaults {
    /// Default mode for new rooms.
    pub room_mode: RoomMode,
    /// Retention horizon in days.
    pub retention_days: u32,
    /// Default per-message byte limit.
    pub max_message_bytes: usize,
}

/// The tenant record owned by this coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Tenant id, `t:<domain>` or `t:ubl_core`.
    pub tenant_id: String,
    /// Tenant kind.
    #[serde(rename = "type")]
    pub kind: TenantType,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Members by user id.
    pub members: BTreeMap<String, Member>,
    /// Defaults for new rooms.
    pub defaults: TenantDefaults,
}

/// Immutable room summary held in the tenant's room index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    /// Room id, `r:<slug>`.
    pub room_id: String,
    /// Display name as given at creation.
    pub name: String,
    /// Room mode.
    pub mode: RoomMode,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Result of [`TenantCoordinator::ensure_member`].
#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    /// The tenant record after the call.
    pub tenant: TenantRecord,
    /// The caller's role.
    pub role: Role,
    /// True when this call created the tenant.
    pub created: bool,
}

/// Persisted coordinator state document.
#[derive(Debug, Serialize, Deserialize)]
struct TenantDoc {
    tenant: Option<TenantRecord>,
    rooms: Vec<RoomSummary>,
}

/// The single-writer tenant coordinator.
pub struct TenantCoordinator {
    tenant_id: String,
    tenant: Option<TenantRecord>,
    rooms: Vec<RoomSummary>,
    default_max_message_bytes: usize,
    state_store: Arc<dyn StateStore>,
    index: Arc<IndexStore>,
}

impl TenantCoordinator {
    /// Deterministic state-store key for a tenant.
    #[must_use]
    pub fn storage_key(tenant_id: &str) -> String {
        tenant_id.to_string()
    }

    /// Loads tenant state from the keyed store.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored document cannot be read.
    pub fn load(
        tenant_id: &str,
        default_max_message_bytes: usize,
        state_store: Arc<dyn StateStore>,
        index: Arc<IndexStore>,
    ) -> Result<Self, ApiError> {
        let doc = state_store
            .load(&Self::storage_key(tenant_id))?
            .map(serde_json::from_value::<TenantDoc>)
            .transpose()?;
        let (tenant, rooms) = match doc {
            Some(doc) => (doc.tenant, doc.rooms),
            None => (None, Vec::new()),
        };
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            tenant,
            rooms,
            default_max_message_bytes,
            state_store,
            index,
        })
    }

    /// Lazily creates the tenant on first touch and adds the caller.
    ///
    /// A fresh tenant is `platform` iff its id is `t:ubl_core`; the caller
    /// becomes `owner` and a `tenant_license` agreement is persisted. On an
    /// existing tenant, an unknown caller is auto-added as `member`.
    ///
    /// # Errors
    ///
    /// Returns an error on a persistence failure.
    pub fn ensure_member(&mut self, identity: &Identity) -> Result<EnsureOutcome, ApiError> {
        let now = now_iso();

        if self.tenant.is_none() {
            let kind = if self.tenant_id == "t:ubl_core" {
                TenantType::Platform
            } else {
                TenantType::Customer
            };
            let mut members = BTreeMap::new();
            members.insert(
                identity.user_id.clone(),
                Member {
                    role: Role::Owner,
                    email: identity.email.clone(),
                    joined_at: now.clone(),
                },
            );
            let record = TenantRecord {
                tenant_id: self.tenant_id.clone(),
                kind,
                created_at: now,
                members,
                defaults: TenantDefaults {
                    room_mode: RoomMode::Internal,
                    retention_days: 365,
                    max_message_bytes: self.default_max_message_bytes,
                },
            };
            self.tenant = Some(record.clone());
            self.persist()?;

            let kind_str = if kind == TenantType::Platform {
                "platform"
            } else {
                "customer"
            };
            self.index.upsert_tenant(
                &self.tenant_id,
                kind_str,
                &record.created_at,
                &json!({"defaults": record.defaults}),
            )?;
            self.index.upsert_agreement(&Agreement::new(
                id::tenant_agreement_id(&self.tenant_id),
                AgreementType::TenantLicense,
                self.tenant_id.clone(),
                identity.user_id.clone(),
                json!({"tenant_id": self.tenant_id}),
            ))?;

            return Ok(EnsureOutcome {
                tenant: record,
                role: Role::Owner,
                created: true,
            });
        }

        let mut joined = false;
        if let Some(tenant) = &mut self.tenant {
            if !tenant.members.contains_key(&identity.user_id) {
                tenant.members.insert(
                    identity.user_id.clone(),
                    Member {
                        role: Role::Member,
                        email: identity.email.clone(),
                        joined_at: now,
                    },
                );
                joined = true;
            }
        }
        if joined {
            self.persist()?;
        }

        let Some(tenant) = self.tenant.clone() else {
            return Err(ApiError::internal("tenant record vanished mid-call"));
        };
        let role = tenant
            .members
            .get(&identity.user_id)
            .map_or(Role::Member, |m| m.role);
        Ok(EnsureOutcome {
            tenant,
            role,
            created: false,
        })
    }

    /// The room index.
    #[must_use]
    pub fn list_rooms(&self) -> Vec<RoomSummary> {
        self.rooms.clone()
    }

    /// Looks up one room summary.
    #[must_use]
    pub fn get_room(&self, room_id: &str) -> Option<RoomSummary> {
        self.rooms.iter().find(|r| r.room_id == room_id).cloned()
    }

    /// The tenant record, if the tenant has been created.
    #[must_use]
    pub fn get_tenant(&self) -> Option<TenantRecord> {
        self.tenant.clone()
    }

    /// Registers a room summary, idempotently by slug.
    ///
    /// Returns the summary and whether this call created it. A new summary
    /// gets a `room_governance` agreement; the runtime then initializes the
    /// target room coordinator.
    ///
    /// # Errors
    ///
    /// Returns `invalid_room_id` when the name slugs to nothing, or an error
    /// on a persistence failure.
    pub fn create_room(
        &mut self,
        name: &str,
        identity: &Identity,
    ) -> Result<(RoomSummary, bool), ApiError> {
        let room_id = id::room_id_from_name(name);
        if !id::is_valid_room_id(&room_id) {
            return Err(ApiError::InvalidRoomId {
                room_id: room_id.clone(),
            });
        }

        if let Some(existing) = self.get_room(&room_id) {
            return Ok((existing, false));
        }

        let summary = RoomSummary {
            room_id: room_id.clone(),
            name: name.to_string(),
            mode: self
                .tenant
                .as_ref()
                .map_or(RoomMode::Internal, |t| t.defaults.room_mode),
            created_at: now_iso(),
        };
        self.rooms.push(summary.clone());
        self.persist()?;

        self.index.upsert_room(&self.tenant_id, &summary)?;
        self.index.upsert_agreement(&Agreement::new(
            id::room_agreement_id(&room_id),
            AgreementType::RoomGovernance,
            self.tenant_id.clone(),
            identity.user_id.clone(),
            json!({"room_id": room_id, "name": name}),
        ))?;

        Ok((summary, true))
    }

    fn persist(&self) -> Result<(), ApiError> {
        let doc = TenantDoc {
            tenant: self.tenant.clone(),
            rooms: self.rooms.clone(),
        };
        let value = serde_json::to_value(&doc)?;
        self.state_store
            .save(&Self::storage_key(&self.tenant_id), &value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn coordinator(tenant_id: &str) -> TenantCoordinator {
        TenantCoordinator::load(
            tenant_id,
            8000,
            Arc::new(MemoryStateStore::new()),
            Arc::new(IndexStore::in_memory().unwrap()),
        )
        .unwrap()
    }

    #[test]
    fn first_touch_creates_tenant_with_owner() {
        let mut t = coordinator("t:ex.com");
        let alice = Identity::new("u:alice", "alice@ex.com");
        let outcome = t.ensure_member(&alice).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.role, Role::Owner);
        assert_eq!(outcome.tenant.kind, TenantType::Customer);
        assert!(outcome.tenant.members.contains_key("u:alice"));
    }

    #[test]
    fn platform_tenant_is_special_cased() {
        let mut t = coordinator("t:ubl_core");
        let ops = Identity::new("u:ops", "ops@ubl.dev");
        let outcome = t.ensure_member(&ops).unwrap();
        assert_eq!(outcome.tenant.kind, TenantType::Platform);
    }

    #[test]
    fn second_caller_joins_as_member() {
        let mut t = coordinator("t:ex.com");
        t.ensure_member(&Identity::new("u:alice", "alice@ex.com"))
            .unwrap();
        let outcome = t
            .ensure_member(&Identity::new("u:bob", "bob@ex.com"))
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.role, Role::Member);
        // The owner remains.
        assert_eq!(
            outcome.tenant.members.get("u:alice").unwrap().role,
            Role::Owner
        );
    }

    #[test]
    fn create_room_is_idempotent_by_slug() {
        let mut t = coordinator("t:ex.com");
        let alice = Identity::new("u:alice", "alice@ex.com");
        t.ensure_member(&alice).unwrap();

        let (first, created) = t.create_room("Incident Response", &alice).unwrap();
        assert!(created);
        assert_eq!(first.room_id, "r:incident-response");

        let (second, created) = t.create_room("Incident Response", &alice).unwrap();
        assert!(!created);
        assert_eq!(second.room_id, first.room_id);
        assert_eq!(t.list_rooms().len(), 1);
    }

    #[test]
    fn unsluggable_name_is_rejected() {
        let mut t = coordinator("t:ex.com");
        let alice = Identity::new("u:alice", "alice@ex.com");
        t.ensure_member(&alice).unwrap();
        assert!(matches!(
            t.create_room("!!!", &alice),
            Err(ApiError::InvalidRoomId { .. })
        ));
    }
}
