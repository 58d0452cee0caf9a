//! Per-key coordinator runtime.
//!
//! Guarantees one active coordinator instance per deterministic key
//! (`tenant_id`, `tenant_id|room_id`, `tenant_id|ledger|0`, ...) and
//! serializes operations on each instance behind an async mutex. Operations
//! on different coordinators run in parallel; there is no shared mutable
//! state outside the coordinators themselves.
//!
//! Cross-coordinator steps (tenant bootstrap creating `r:general`, rooms
//! appending to the tenant shard) are orchestrated here: coordinators never
//! reach around the runtime to touch each other.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::atom::{Atom, Message};
use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::identity::Identity;
use crate::ledger::{ChainReport, LedgerCoordinator, LedgerHandle, LedgerState, SHARD_ZERO};
use crate::room::{HistoryPage, RoomCoordinator, RoomEvent, SendMessageInput};
use crate::store::{IndexStore, StateStore};
use crate::tenant::{Role, RoomSummary, TenantCoordinator, TenantRecord};
use crate::workspace::{Document, LlmCompletion, WorkspaceCoordinator};

/// Process-wide operation counters, exported by the gateway as metrics.
#[derive(Debug, Default)]
pub struct RuntimeCounters {
    /// Atoms appended across all shards.
    pub ledger_appends: AtomicU64,
    /// Effect appends that failed after their action committed.
    pub effect_append_failures: AtomicU64,
    /// Sends answered from the idempotency window.
    pub idempotent_replays: AtomicU64,
    /// Live SSE subscribers (gauge semantics).
    pub sse_subscribers: AtomicU64,
}

/// The per-key single-writer runtime.
pub struct UblRuntime {
    config: Arc<ServiceConfig>,
    state_store: Arc<dyn StateStore>,
    index: Arc<IndexStore>,
    counters: Arc<RuntimeCounters>,
    tenants: RwLock<HashMap<String, Arc<Mutex<TenantCoordinator>>>>,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomCoordinator>>>>,
    workspaces: RwLock<HashMap<String, Arc<Mutex<WorkspaceCoordinator>>>>,
    ledgers: RwLock<HashMap<String, LedgerHandle>>,
}

impl UblRuntime {
    /// Builds a runtime over the given stores.
    #[must_use]
    pub fn new(
        config: ServiceConfig,
        state_store: Arc<dyn StateStore>,
        index: Arc<IndexStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            state_store,
            index,
            counters: Arc::new(RuntimeCounters::default()),
            tenants: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            workspaces: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    /// The immutable service configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Operation counters.
    #[must_use]
    pub fn counters(&self) -> &Arc<RuntimeCounters> {
        &self.counters
    }

    /// The index store (agreements, spans, audit).
    #[must_use]
    pub fn index(&self) -> &Arc<IndexStore> {
        &self.index
    }

    /// Resolves the tenant id for an identity under this configuration.
    #[must_use]
    pub fn tenant_id_for(&self, identity: &Identity) -> String {
        identity.tenant_id(&self.config.platform_domains)
    }

    /// The ledger handle for a tenant's shard 0, loading it on first touch.
    ///
    /// # Errors
    ///
    /// Returns an error when stored shard state cannot be read.
    pub async fn ledger(&self, tenant_id: &str) -> Result<LedgerHandle, ApiError> {
        let key = LedgerCoordinator::storage_key(tenant_id, SHARD_ZERO);
        if let Some(handle) = self.ledgers.read().await.get(&key) {
            return Ok(handle.clone());
        }
        let mut ledgers = self.ledgers.write().await;
        if let Some(handle) = ledgers.get(&key) {
            return Ok(handle.clone());
        }
        let coordinator = LedgerCoordinator::load(
            tenant_id,
            SHARD_ZERO,
            self.config.hot_atoms_limit,
            self.config.dedup_limit,
            Arc::clone(&self.state_store),
            Arc::clone(&self.index),
        )?;
        let handle = LedgerHandle::new(coordinator);
        ledgers.insert(key, handle.clone());
        Ok(handle)
    }

    async fn tenant(&self, tenant_id: &str) -> Result<Arc<Mutex<TenantCoordinator>>, ApiError> {
        let key = TenantCoordinator::storage_key(tenant_id);
        if let Some(handle) = self.tenants.read().await.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let mut tenants = self.tenants.write().await;
        if let Some(handle) = tenants.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let coordinator = TenantCoordinator::load(
            tenant_id,
            self.config.max_message_bytes,
            Arc::clone(&self.state_store),
            Arc::clone(&self.index),
        )?;
        let handle = Arc::new(Mutex::new(coordinator));
        tenants.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    async fn room(
        &self,
        tenant_id: &str,
        room_id: &str,
    ) -> Result<Arc<Mutex<RoomCoordinator>>, ApiError> {
        let key = RoomCoordinator::storage_key(tenant_id, room_id);
        if let Some(handle) = self.rooms.read().await.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let mut rooms = self.rooms.write().await;
        if let Some(handle) = rooms.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let coordinator = RoomCoordinator::load(
            tenant_id,
            room_id,
            self.config.seen_limit,
            Arc::clone(&self.counters),
            Arc::clone(&self.state_store),
        )?;
        let handle = Arc::new(Mutex::new(coordinator));
        rooms.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    async fn workspace(
        &self,
        tenant_id: &str,
        workspace_id: &str,
    ) -> Result<Arc<Mutex<WorkspaceCoordinator>>, ApiError> {
        let key = WorkspaceCoordinator::storage_key(tenant_id, workspace_id);
        if let Some(handle) = self.workspaces.read().await.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let mut workspaces = self.workspaces.write().await;
        if let Some(handle) = workspaces.get(&key) {
            return Ok(Arc::clone(handle));
        }
        let coordinator = WorkspaceCoordinator::load(
            tenant_id,
            workspace_id,
            Arc::clone(&self.counters),
            Arc::clone(&self.state_store),
            Arc::clone(&self.index),
        )?;
        let handle = Arc::new(Mutex::new(coordinator));
        workspaces.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Lazily creates the caller's tenant and ensures membership.
    ///
    /// First touch creates the tenant (`platform` iff `t:ubl_core`), makes
    /// the caller `owner`, persists the `tenant_license` agreement, and
    /// bootstraps the `r:general` room (whose init sends the receipted
    /// system message).
    ///
    /// # Errors
    ///
    /// Returns an error on persistence or ledger failure during bootstrap.
    pub async fn ensure_tenant_and_member(
        &self,
        identity: &Identity,
        request_id: &str,
    ) -> Result<(TenantRecord, Role), ApiError> {
        let tenant_id = self.tenant_id_for(identity);
        let outcome = {
            let tenant = self.tenant(&tenant_id).await?;
            let mut tenant = tenant.lock().await;
            tenant.ensure_member(identity)?
        };
        if outcome.created {
            self.create_room_for(&tenant_id, "general", identity, request_id)
                .await?;
        }
        Ok((outcome.tenant, outcome.role))
    }

    /// Lists the caller's tenant's rooms, bootstrapping the tenant first.
    ///
    /// # Errors
    ///
    /// Returns an error on persistence or ledger failure during bootstrap.
    pub async fn list_rooms(
        &self,
        identity: &Identity,
        request_id: &str,
    ) -> Result<Vec<RoomSummary>, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let tenant = self.tenant(&tenant_id).await?;
        let tenant = tenant.lock().await;
        Ok(tenant.list_rooms())
    }

    /// Creates (or idempotently returns) a room by display name.
    ///
    /// # Errors
    ///
    /// Returns `invalid_room_id` for an unsluggable name, or an error on
    /// persistence or ledger failure.
    pub async fn create_room(
        &self,
        identity: &Identity,
        name: &str,
        request_id: &str,
    ) -> Result<RoomSummary, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        self.create_room_for(&tenant_id, name, identity, request_id)
            .await
    }

    /// Registers the summary with the tenant and initializes the room
    /// coordinator. Init is keyed idempotent, so replays are safe.
    async fn create_room_for(
        &self,
        tenant_id: &str,
        name: &str,
        identity: &Identity,
        request_id: &str,
    ) -> Result<RoomSummary, ApiError> {
        let (summary, max_message_bytes) = {
            let tenant = self.tenant(tenant_id).await?;
            let mut tenant = tenant.lock().await;
            let (summary, _created) = tenant.create_room(name, identity)?;
            let max = tenant
                .get_tenant()
                .map_or(self.config.max_message_bytes, |t| {
                    t.defaults.max_message_bytes
                });
            (summary, max)
        };

        let ledger = self.ledger(tenant_id).await?;
        let room = self.room(tenant_id, &summary.room_id).await?;
        let mut room = room.lock().await;
        if !room.is_initialized() {
            room.init(
                &summary.name,
                summary.mode,
                identity,
                request_id,
                max_message_bytes,
                self.config.hot_messages_limit,
                &ledger,
            )
            .await?;
        }
        Ok(summary)
    }

    /// Looks up one room summary.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when the tenant has no such room.
    pub async fn get_room(
        &self,
        identity: &Identity,
        room_id: &str,
    ) -> Result<RoomSummary, ApiError> {
        let tenant_id = self.tenant_id_for(identity);
        let tenant = self.tenant(&tenant_id).await?;
        let tenant = tenant.lock().await;
        tenant
            .get_room(room_id)
            .ok_or_else(|| ApiError::not_found("room", room_id))
    }

    /// Sends a message to a room.
    ///
    /// # Errors
    ///
    /// Propagates room validation and ledger failures; `not_found` when the
    /// room was never created.
    pub async fn send_message(
        &self,
        identity: &Identity,
        room_id: &str,
        input: SendMessageInput,
        request_id: &str,
    ) -> Result<Message, ApiError> {
        if !crate::id::is_valid_room_id(room_id) {
            return Err(ApiError::InvalidRoomId {
                room_id: room_id.to_string(),
            });
        }
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        let room = self.room(&tenant_id, room_id).await?;
        let mut room = room.lock().await;
        room.send_message(input, identity, request_id, &ledger).await
    }

    /// Pages a room's hot-window history.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when the room was never created.
    pub async fn get_history(
        &self,
        identity: &Identity,
        room_id: &str,
        cursor: Option<u64>,
        limit: Option<usize>,
        request_id: &str,
    ) -> Result<HistoryPage, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let limit = self.config.clamp_history_limit(limit);
        let room = self.room(&tenant_id, room_id).await?;
        let mut room = room.lock().await;
        room.assert_member(identity)?;
        Ok(room.get_history(cursor, limit))
    }

    /// Subscribes to a room's event stream.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when the room was never created.
    pub async fn subscribe(
        &self,
        identity: &Identity,
        room_id: &str,
        from_seq: Option<u64>,
        request_id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<RoomEvent>, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let room = self.room(&tenant_id, room_id).await?;
        let mut room = room.lock().await;
        room.subscribe(identity, from_seq, self.config.hot_messages_limit + 64)
    }

    /// Returns the atoms behind a receipt sequence: the action and, when
    /// present and matching, its paired effect.
    ///
    /// # Errors
    ///
    /// Returns `not_found` when no atom exists at `seq`.
    pub async fn get_receipt(
        &self,
        identity: &Identity,
        seq: u64,
        request_id: &str,
    ) -> Result<Vec<Atom>, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        ledger.get_by_seq(seq).await
    }

    /// Current `{seq, head}` of the caller's shard.
    ///
    /// # Errors
    ///
    /// Returns an error when stored shard state cannot be read.
    pub async fn ledger_state(&self, identity: &Identity) -> Result<LedgerState, ApiError> {
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        Ok(ledger.state().await)
    }

    /// Verifies the caller's shard hash chain over the hot window.
    ///
    /// # Errors
    ///
    /// Returns an error when stored shard state cannot be read.
    pub async fn verify_chain(&self, identity: &Identity) -> Result<ChainReport, ApiError> {
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        Ok(ledger.verify_chain().await)
    }

    /// Creates a document in a workspace, initializing the workspace on
    /// first touch.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed workspace id or empty
    /// title, or an error on persistence or ledger failure.
    pub async fn create_document(
        &self,
        identity: &Identity,
        workspace_id: &str,
        title: &str,
        content: &str,
        request_id: &str,
    ) -> Result<Document, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        let workspace = self.ensured_workspace(&tenant_id, workspace_id, identity).await?;
        let mut workspace = workspace.lock().await;
        workspace
            .create_document(title, content, identity, request_id, &ledger)
            .await
    }

    /// Reads a document.
    ///
    /// # Errors
    ///
    /// Returns `not_found` for a missing document.
    pub async fn get_document(
        &self,
        identity: &Identity,
        workspace_id: &str,
        document_id: &str,
        request_id: &str,
    ) -> Result<Document, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        let workspace = self.ensured_workspace(&tenant_id, workspace_id, identity).await?;
        let workspace = workspace.lock().await;
        workspace
            .get_document(document_id, identity, request_id, &ledger)
            .await
    }

    /// Searches a workspace's documents.
    ///
    /// # Errors
    ///
    /// Returns an error on a ledger failure.
    pub async fn search_documents(
        &self,
        identity: &Identity,
        workspace_id: &str,
        query: &str,
        request_id: &str,
    ) -> Result<Vec<Document>, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        let workspace = self.ensured_workspace(&tenant_id, workspace_id, identity).await?;
        let workspace = workspace.lock().await;
        workspace
            .search_documents(query, identity, request_id, &ledger)
            .await
    }

    /// Runs the stubbed LLM completion.
    ///
    /// # Errors
    ///
    /// Returns an error on a ledger failure.
    pub async fn llm_complete(
        &self,
        identity: &Identity,
        workspace_id: &str,
        prompt: &str,
        request_id: &str,
    ) -> Result<LlmCompletion, ApiError> {
        self.ensure_tenant_and_member(identity, request_id).await?;
        let tenant_id = self.tenant_id_for(identity);
        let ledger = self.ledger(&tenant_id).await?;
        let workspace = self.ensured_workspace(&tenant_id, workspace_id, identity).await?;
        let workspace = workspace.lock().await;
        workspace
            .llm_complete(prompt, identity, request_id, &ledger)
            .await
    }

    async fn ensured_workspace(
        &self,
        tenant_id: &str,
        workspace_id: &str,
        identity: &Identity,
    ) -> Result<Arc<Mutex<WorkspaceCoordinator>>, ApiError> {
        if !crate::id::is_valid_workspace_id(workspace_id) {
            return Err(ApiError::validation(format!(
                "invalid workspace id: {workspace_id}"
            )));
        }
        let workspace = self.workspace(tenant_id, workspace_id).await?;
        {
            let mut guard = workspace.lock().await;
            if !guard.is_initialized() {
                let name = workspace_id.trim_start_matches("w:").to_string();
                guard.init(&name, identity)?;
            }
        }
        Ok(workspace)
    }
}
