//! Memory Gateway: one read/write surface over the durable store, the
//! working-context cache and semantic memory.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskpilot_core::config::MemoryConfig;
use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::{
    Credentials, MemoryHit, SemanticRecord, Task, Timestamp, VaultSummary, WorkingContext,
};
use taskpilot_storage::{
    ConfirmationRepository, CostLedger, Database, SemanticRepository, TaskRepository,
    UserRepository, VaultCipher, VaultRepository,
};

use crate::embedding::{DynEmbeddingService, HashingEmbedding};
use crate::index::VectorIndex;
use crate::working::{InMemoryWorkingStore, WorkingStore};

pub struct MemoryGateway {
    tasks: TaskRepository,
    users: UserRepository,
    vault: VaultRepository,
    confirmations: ConfirmationRepository,
    ledger: CostLedger,
    semantic: SemanticRepository,
    index: VectorIndex,
    embedder: Arc<dyn DynEmbeddingService>,
    working: Arc<dyn WorkingStore>,
    config: MemoryConfig,
}

impl MemoryGateway {
    /// Build the gateway and load every stored semantic record into the index.
    pub fn open(
        db: Arc<Database>,
        cipher: VaultCipher,
        embedder: Arc<dyn DynEmbeddingService>,
        working: Arc<dyn WorkingStore>,
        config: MemoryConfig,
    ) -> Result<Self, TaskPilotError> {
        let gateway = Self {
            tasks: TaskRepository::new(Arc::clone(&db)),
            users: UserRepository::new(Arc::clone(&db)),
            vault: VaultRepository::new(Arc::clone(&db), cipher),
            confirmations: ConfirmationRepository::new(Arc::clone(&db)),
            ledger: CostLedger::new(Arc::clone(&db)),
            semantic: SemanticRepository::new(db),
            index: VectorIndex::new(),
            embedder,
            working,
            config,
        };
        let loaded = gateway.rebuild_index()?;
        info!(loaded, "Semantic memory index ready");
        Ok(gateway)
    }

    /// Fully in-process gateway (for testing).
    pub fn in_memory(config: MemoryConfig) -> Result<Self, TaskPilotError> {
        let working = Arc::new(InMemoryWorkingStore::new(Duration::from_secs(
            config.working_ttl_secs,
        )));
        let embedder = Arc::new(HashingEmbedding::new(config.embedding_dimensions));
        Self::open(
            Arc::new(Database::in_memory()?),
            VaultCipher::generate(),
            embedder,
            working,
            config,
        )
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn users(&self) -> &UserRepository {
        &self.users
    }

    pub fn confirmations(&self) -> &ConfirmationRepository {
        &self.confirmations
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    // ========================================================================
    // Working context
    // ========================================================================

    /// The task's working context, rebuilt from the durable log on a miss.
    ///
    /// The plan always comes from the task record, never from the cache.
    pub fn working_context(&self, task: &Task) -> Result<WorkingContext, TaskPilotError> {
        match self.working.get(task.id) {
            Ok(Some(mut ctx)) => {
                ctx.plan = task.plan.clone();
                return Ok(ctx);
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = %task.id, error = %e, "Working store read failed"),
        }

        let ctx = self.rebuild_context(task)?;
        self.save_working(&ctx);
        Ok(ctx)
    }

    /// Fold the `context` object of every log entry (or of a transition's
    /// `detail`), in order, over an empty context. The live transcript is
    /// not recoverable.
    pub fn rebuild_context(&self, task: &Task) -> Result<WorkingContext, TaskPilotError> {
        let mut ctx = WorkingContext::new(task.id);
        ctx.plan = task.plan.clone();
        for entry in self.tasks.logs(task.id)? {
            let updates = entry.payload.get("context").or_else(|| {
                entry
                    .payload
                    .get("detail")
                    .and_then(|detail| detail.get("context"))
            });
            if let Some(updates) = updates {
                ctx.merge(updates);
            }
        }
        debug!(task_id = %task.id, vars = ctx.vars.len(), "Rebuilt working context");
        Ok(ctx)
    }

    /// Best-effort cache write.
    pub fn save_working(&self, ctx: &WorkingContext) {
        if let Err(e) = self.working.put(ctx.clone()) {
            warn!(task_id = %ctx.task_id, error = %e, "Working store write failed");
        }
    }

    pub fn forget_working(&self, task_id: Uuid) {
        if let Err(e) = self.working.remove(task_id) {
            warn!(task_id = %task_id, error = %e, "Working store remove failed");
        }
    }

    pub fn purge_working(&self) -> usize {
        self.working.purge_expired().unwrap_or_else(|e| {
            warn!(error = %e, "Working store purge failed");
            0
        })
    }

    // ========================================================================
    // Vault
    // ========================================================================

    pub fn store_credentials(
        &self,
        user_id: Uuid,
        company: &str,
        account_number: &str,
        secret: &str,
        metadata: &Value,
    ) -> Result<VaultSummary, TaskPilotError> {
        self.vault
            .upsert(user_id, company, account_number, secret, metadata)
    }

    pub fn credential_summary(
        &self,
        user_id: Uuid,
        company: &str,
    ) -> Result<Option<VaultSummary>, TaskPilotError> {
        self.vault.summary(user_id, company)
    }

    /// Decrypt credentials. Call only immediately before the external use.
    pub fn reveal_credentials(
        &self,
        user_id: Uuid,
        company: &str,
    ) -> Result<Option<Credentials>, TaskPilotError> {
        self.vault.reveal(user_id, company)
    }

    // ========================================================================
    // Semantic memory
    // ========================================================================

    /// Append a semantic record for `user_id`. Written durably before the
    /// index sees it.
    pub async fn remember(
        &self,
        user_id: Uuid,
        content: &str,
        metadata: Value,
    ) -> Result<Uuid, TaskPilotError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(TaskPilotError::InvalidInput(
                "Memory content must not be empty".into(),
            ));
        }

        let embedding = self.embedder.embed_boxed(content).await?;
        let record = SemanticRecord {
            id: Uuid::new_v4(),
            user_id,
            content: content.to_string(),
            metadata,
            created_at: Timestamp::now(),
        };
        self.semantic.insert(&record, &embedding)?;
        self.index.insert(
            record.id,
            user_id,
            embedding,
            record.content.clone(),
            record.metadata.clone(),
        )?;
        debug!(user_id = %user_id, memory_id = %record.id, "Stored semantic memory");
        Ok(record.id)
    }

    /// Similarity search over one user's records. `None` falls back to the
    /// configured limit and threshold.
    pub async fn recall(
        &self,
        user_id: Uuid,
        query: &str,
        limit: Option<usize>,
        min_similarity: Option<f64>,
    ) -> Result<Vec<MemoryHit>, TaskPilotError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed_boxed(query).await?;
        let hits = self.index.search(
            user_id,
            &embedding,
            limit.unwrap_or(self.config.default_limit),
            min_similarity.unwrap_or(self.config.min_similarity),
        )?;
        Ok(hits
            .into_iter()
            .map(|hit| MemoryHit {
                id: hit.id,
                content: hit.content,
                metadata: hit.metadata,
                score: hit.score,
            })
            .collect())
    }

    /// Reload the index from the durable store.
    pub fn rebuild_index(&self) -> Result<usize, TaskPilotError> {
        let records = self.semantic.load_all()?;
        let count = records.len();
        for (record, embedding) in records {
            self.index.insert(
                record.id,
                record.user_id,
                embedding,
                record.content,
                record.metadata,
            )?;
        }
        Ok(count)
    }

    /// Delete a user and everything they own, including indexed memories.
    pub fn delete_user(&self, user_id: Uuid) -> Result<bool, TaskPilotError> {
        let deleted = self.users.delete(user_id)?;
        if deleted {
            let removed = self.index.remove_owner(user_id)?;
            info!(user_id = %user_id, memories = removed, "Deleted user");
        }
        Ok(deleted)
    }
}
