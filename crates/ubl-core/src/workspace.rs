//! Per-workspace coordinator.
//!
//! A lighter sibling of the room coordinator: owns a document map instead of
//! a timeline. Every operation emits an `office.*` action atom to the
//! tenant's ledger shard (document creation also emits the paired effect),
//! so workspace activity is receipted the same way chat is.
//!
//! Search is a case-insensitive substring scan over `title ∥ content`;
//! ranking and stemming are out of scope, and the scan is linear over the
//! document map.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::atom::{
    now_iso, ActionAtom, ActionStatus, Actor, Atom, Did, EffectAtom, EffectOp, Outcome, Pointers,
    Receipt, Trace,
};
use crate::error::ApiError;
use crate::hash;
use crate::id;
use crate::identity::Identity;
use crate::ledger::LedgerHandle;
use crate::runtime::RuntimeCounters;
use crate::store::{IndexStore, StateStore};

/// Fixed completion returned by the stubbed LLM gateway.
const STUB_COMPLETION: &str =
    "This is a placeholder completion; the model gateway is stubbed in this deployment.";

/// Completion tokens reported by the stub.
const STUB_COMPLETION_TOKENS: u64 = 20;

/// Workspace configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Owning tenant.
    pub tenant_id: String,
    /// Workspace id, `w:<slug>`.
    pub workspace_id: String,
    /// Display name.
    pub name: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Creating user id.
    pub created_by: String,
}

/// A workspace document, receipt included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id, `d:<uuid>`.
    pub document_id: String,
    /// Owning workspace.
    pub workspace_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Title.
    pub title: String,
    /// Full content.
    pub content: String,
    /// `b:` hash of the raw UTF-8 content.
    pub content_hash: String,
    /// Creating user id.
    pub created_by: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Receipt of the `office.document.create` action atom.
    pub receipt: Receipt,
}

/// Token accounting for the LLM stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Whitespace-split word count of the prompt.
    pub prompt_tokens: u64,
    /// Always [`STUB_COMPLETION_TOKENS`] in this core.
    pub completion_tokens: u64,
    /// Sum of the above.
    pub total_tokens: u64,
}

/// Result of [`WorkspaceCoordinator::llm_complete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCompletion {
    /// The completion text.
    pub completion: String,
    /// Token accounting.
    pub usage: LlmUsage,
    /// Receipt of the `office.llm.complete` action atom.
    pub receipt: Receipt,
}

/// Persisted coordinator state document.
#[derive(Debug, Serialize, Deserialize)]
struct WorkspaceDoc {
    config: Option<WorkspaceConfig>,
    documents: BTreeMap<String, Document>,
}

/// The single-writer workspace coordinator.
pub struct WorkspaceCoordinator {
    tenant_id: String,
    workspace_id: String,
    key: String,
    config: Option<WorkspaceConfig>,
    documents: BTreeMap<String, Document>,
    counters: Arc<RuntimeCounters>,
    state_store: Arc<dyn StateStore>,
    index: Arc<IndexStore>,
}

impl WorkspaceCoordinator {
    /// Deterministic state-store key for a workspace.
    #[must_use]
    pub fn storage_key(tenant_id: &str, workspace_id: &str) -> String {
        format!("{tenant_id}|{workspace_id}")
    }

    /// Loads workspace state from the keyed store.
    ///
    /// # Errors
    ///
    /// Returns an error when the stored document cannot be read.
    pub fn load(
        tenant_id: &str,
        workspace_id: &str,
        counters: Arc<RuntimeCounters>,
        state_store: Arc<dyn StateStore>,
        index: Arc<IndexStore>,
    ) -> Result<Self, ApiError> {
        let key = Self::storage_key(tenant_id, workspace_id);
        let doc = state_store
            .load(&key)?
            .map(serde_json::from_value::<WorkspaceDoc>)
            .transpose()?;
        let (config, documents) = match doc {
            Some(doc) => (doc.config, doc.documents),
            None => (None, BTreeMap::new()),
        };
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            workspace_id: workspace_id.to_string(),
            key,
            config,
            documents,
            counters,
            state_store,
            index,
        })
    }

    /// True once `init` has run.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// Initializes the workspace and persists its `workspace_agreement`.
    ///
    /// Idempotent: an initialized workspace returns immediately.
    ///
    /// # Errors
    ///
    /// Returns an error on a persistence failure.
    pub fn init(&mut self, name: &str, creator: &Identity) -> Result<(), ApiError> {
        if self.config.is_some() {
            return Ok(());
        }
        self.config = Some(WorkspaceConfig {
            tenant_id: self.tenant_id.clone(),
            workspace_id: self.workspace_id.clone(),
            name: name.to_string(),
            created_at: now_iso(),
            created_by: creator.user_id.clone(),
        });
        self.persist()?;
        self.index
            .upsert_agreement(&crate::agreement::Agreement::new(
                id::workspace_agreement_id(&self.workspace_id),
                crate::agreement::AgreementType::WorkspaceAgreement,
                self.tenant_id.clone(),
                creator.user_id.clone(),
                json!({"workspace_id": self.workspace_id, "name": name}),
            ))?;
        Ok(())
    }

    /// Creates a document, emitting the action/effect pair.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty title, or an internal error
    /// when persistence or the action append fails.
    pub async fn create_document(
        &mut self,
        title: &str,
        content: &str,
        identity: &Identity,
        request_id: &str,
        ledger: &LedgerHandle,
    ) -> Result<Document, ApiError> {
        if title.trim().is_empty() {
            return Err(ApiError::validation("document title must not be empty"));
        }

        let document_id = id::mint_document_id();
        let content_hash = hash::content_hash(content);

        let action = self.action(
            identity,
            request_id,
            Did::OfficeDocumentCreate,
            json!({
                "workspace_id": self.workspace_id,
                "document_id": document_id,
                "content_hash": content_hash,
                "title": title,
            }),
        );
        let outcome = ledger.append_atom(action).await?;
        self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);

        let effect = Atom::Effect(EffectAtom {
            tenant_id: self.tenant_id.clone(),
            cid: None,
            ref_action_cid: outcome.receipt.cid.clone(),
            when: now_iso(),
            outcome: Outcome::Ok,
            effects: vec![EffectOp::new("document.create", {
                let mut targets = serde_json::Map::new();
                targets.insert("workspace_id".into(), json!(self.workspace_id));
                targets.insert("document_id".into(), json!(document_id));
                targets
            })],
            pointers: Pointers {
                msg_id: None,
                document_id: Some(document_id.clone()),
            },
            error: None,
        });
        if let Err(err) = ledger.append_atom(effect).await {
            self.counters
                .effect_append_failures
                .fetch_add(1, Ordering::Relaxed);
            error!(
                tenant = %self.tenant_id,
                workspace = %self.workspace_id,
                error = %err,
                "effect append failed after committed action"
            );
        } else {
            self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);
        }

        let document = Document {
            document_id: document_id.clone(),
            workspace_id: self.workspace_id.clone(),
            tenant_id: self.tenant_id.clone(),
            title: title.to_string(),
            content: content.to_string(),
            content_hash,
            created_by: identity.user_id.clone(),
            created_at: now_iso(),
            receipt: outcome.receipt,
        };
        self.documents.insert(document_id, document.clone());
        self.persist()?;
        if let Err(err) = self.index.upsert_document(&document) {
            error!(tenant = %self.tenant_id, error = %err, "document mirror failed");
        }

        Ok(document)
    }

    /// Reads a document, emitting an `office.document.get` action.
    ///
    /// # Errors
    ///
    /// Returns `not_found` before any atom is emitted when the document
    /// does not exist.
    pub async fn get_document(
        &self,
        document_id: &str,
        identity: &Identity,
        request_id: &str,
        ledger: &LedgerHandle,
    ) -> Result<Document, ApiError> {
        let document = self
            .documents
            .get(document_id)
            .cloned()
            .ok_or_else(|| ApiError::not_found("document", document_id))?;

        let action = self.action(
            identity,
            request_id,
            Did::OfficeDocumentGet,
            json!({
                "workspace_id": self.workspace_id,
                "document_id": document_id,
            }),
        );
        ledger.append_atom(action).await?;
        self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);
        Ok(document)
    }

    /// Case-insensitive substring search over `title ∥ content`.
    ///
    /// # Errors
    ///
    /// Returns an error when the action append fails.
    pub async fn search_documents(
        &self,
        query: &str,
        identity: &Identity,
        request_id: &str,
        ledger: &LedgerHandle,
    ) -> Result<Vec<Document>, ApiError> {
        let needle = query.to_lowercase();
        let hits: Vec<Document> = self
            .documents
            .values()
            .filter(|d| {
                format!("{}{}", d.title, d.content)
                    .to_lowercase()
                    .contains(&needle)
            })
            .cloned()
            .collect();

        let action = self.action(
            identity,
            request_id,
            Did::OfficeDocumentSearch,
            json!({
                "workspace_id": self.workspace_id,
                "query": query,
                "result_count": hits.len(),
            }),
        );
        ledger.append_atom(action).await?;
        self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);
        Ok(hits)
    }

    /// Stubbed completion: fixed text, word-count usage accounting.
    ///
    /// # Errors
    ///
    /// Returns an error when the action append fails.
    pub async fn llm_complete(
        &self,
        prompt: &str,
        identity: &Identity,
        request_id: &str,
        ledger: &LedgerHandle,
    ) -> Result<LlmCompletion, ApiError> {
        let prompt_tokens = prompt.split_whitespace().count() as u64;
        let usage = LlmUsage {
            prompt_tokens,
            completion_tokens: STUB_COMPLETION_TOKENS,
            total_tokens: prompt_tokens + STUB_COMPLETION_TOKENS,
        };

        let action = self.action(
            identity,
            request_id,
            Did::OfficeLlmComplete,
            json!({
                "workspace_id": self.workspace_id,
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
            }),
        );
        let outcome = ledger.append_atom(action).await?;
        self.counters.ledger_appends.fetch_add(1, Ordering::Relaxed);

        Ok(LlmCompletion {
            completion: STUB_COMPLETION.to_string(),
            usage,
            receipt: outcome.receipt,
        })
    }

    fn action(
        &self,
        identity: &Identity,
        request_id: &str,
        did: Did,
        this: serde_json::Value,
    ) -> Atom {
        Atom::Action(ActionAtom {
            tenant_id: self.tenant_id.clone(),
            cid: None,
            prev_hash: None,
            when: now_iso(),
            who: Actor::from_identity(identity),
            did,
            this,
            agreement_id: Some(id::workspace_agreement_id(&self.workspace_id)),
            status: ActionStatus::Executed,
            trace: Trace {
                request_id: request_id.to_string(),
            },
        })
    }

    fn persist(&self) -> Result<(), ApiError> {
        let doc = WorkspaceDoc {
            config: self.config.clone(),
            documents: self.documents.clone(),
        };
        let value = serde_json::to_value(&doc)?;
        self.state_store.save(&self.key, &value)?;
        Ok(())
    }
}
