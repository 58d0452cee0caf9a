//! Agreements: named authorization records.
//!
//! An agreement names why an action was allowed. It is created by the
//! coordinator that owns the governed entity, persisted to the index store,
//! and never mutated afterwards. Action atoms reference agreements by id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agreement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgreementType {
    /// Tenant-level license, one per tenant.
    TenantLicense,
    /// Governance of a room.
    RoomGovernance,
    /// Governance of a workspace.
    WorkspaceAgreement,
    /// Grant of tool access.
    ToolAccess,
    /// Approval of a workflow step.
    WorkflowApproval,
}

/// A named authorization record, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agreement {
    /// Id of the form `a:<type>:<entity>`.
    pub id: String,
    /// Agreement kind.
    #[serde(rename = "type")]
    pub kind: AgreementType,
    /// Owning tenant.
    pub tenant_id: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Creating user id.
    pub created_by: String,
    /// Free-form metadata (governed entity, display name, ...).
    pub metadata: Value,
}

impl Agreement {
    /// Builds an agreement stamped with the current time.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        kind: AgreementType,
        tenant_id: impl Into<String>,
        created_by: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            tenant_id: tenant_id.into(),
            created_at: crate::atom::now_iso(),
            created_by: created_by.into(),
            metadata,
        }
    }
}
