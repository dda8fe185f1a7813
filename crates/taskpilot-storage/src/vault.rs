//! Credential vault.
//!
//! Secrets are sealed with AES-256-GCM under a single process key before
//! they reach SQLite. Each entry gets a fresh 96-bit nonce. Account numbers
//! are stored in the clear and only ever shown masked.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::sensitive::mask_account;
use taskpilot_core::types::{normalize_company, Credentials, Timestamp, VaultSummary};

use crate::db::{storage_err, Database, OptionalExt};
use crate::tasks::parse_uuid;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Nonce and ciphertext, both base64 encoded for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub nonce_b64: String,
    pub ciphertext_b64: String,
}

/// Symmetric cipher for vault secrets.
#[derive(Clone)]
pub struct VaultCipher {
    cipher: Aes256Gcm,
}

impl VaultCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Build a cipher from a 64-character hex key.
    pub fn from_hex(hex_key: &str) -> Result<Self, TaskPilotError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| TaskPilotError::Crypto(format!("Invalid vault key: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            TaskPilotError::Crypto(format!(
                "Vault key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self::new(&key))
    }

    /// A cipher with a random key. Secrets sealed with it do not survive a
    /// restart.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Read the hex key at `path`, creating it with owner-only permissions
    /// if it does not exist.
    pub fn load_or_create_key_file(path: &Path) -> Result<Self, TaskPilotError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            return Self::from_hex(&contents);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let key = Aes256Gcm::generate_key(OsRng);
        // The mode applies at creation, so the key is never readable by others.
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(hex::encode(key.as_slice()).as_bytes())?;
        file.sync_all()?;

        info!("Generated vault key at {}", path.display());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, TaskPilotError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| TaskPilotError::Crypto("Encryption failed".into()))?;
        Ok(SealedSecret {
            nonce_b64: BASE64.encode(nonce.as_slice()),
            ciphertext_b64: BASE64.encode(ciphertext),
        })
    }

    pub fn open(&self, sealed: &SealedSecret) -> Result<String, TaskPilotError> {
        let nonce = BASE64
            .decode(&sealed.nonce_b64)
            .map_err(|e| TaskPilotError::Crypto(format!("Invalid nonce encoding: {}", e)))?;
        if nonce.len() != NONCE_LEN {
            return Err(TaskPilotError::Crypto(format!(
                "Nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = BASE64
            .decode(&sealed.ciphertext_b64)
            .map_err(|e| TaskPilotError::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| TaskPilotError::Crypto("Decryption failed".into()))?;
        String::from_utf8(plaintext)
            .map_err(|e| TaskPilotError::Crypto(format!("Secret is not UTF-8: {}", e)))
    }
}

impl std::fmt::Debug for VaultCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultCipher").finish_non_exhaustive()
    }
}

/// Encrypted per-user, per-company credential storage.
pub struct VaultRepository {
    db: Arc<Database>,
    cipher: VaultCipher,
}

impl VaultRepository {
    pub fn new(db: Arc<Database>, cipher: VaultCipher) -> Self {
        Self { db, cipher }
    }

    /// Store or replace the credentials for `(user_id, company)`.
    pub fn upsert(
        &self,
        user_id: Uuid,
        company: &str,
        account_number: &str,
        secret: &str,
        metadata: &Value,
    ) -> Result<VaultSummary, TaskPilotError> {
        let company = normalize_company(company);
        if company.is_empty() {
            return Err(TaskPilotError::InvalidInput("Company must not be empty".into()));
        }
        let sealed = self.cipher.seal(secret)?;
        let now = Timestamp::now();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO vault_entries (id, user_id, company, account_number, secret_nonce,
                     secret_ciphertext, metadata, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT (user_id, company) DO UPDATE SET
                     account_number = excluded.account_number,
                     secret_nonce = excluded.secret_nonce,
                     secret_ciphertext = excluded.secret_ciphertext,
                     metadata = excluded.metadata,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    user_id.to_string(),
                    company,
                    account_number,
                    sealed.nonce_b64,
                    sealed.ciphertext_b64,
                    metadata.to_string(),
                    now.0,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    TaskPilotError::NotFound(format!("User {}", user_id))
                }
                other => TaskPilotError::Storage(format!("Failed to store credentials: {}", other)),
            })?;
            Ok(())
        })?;

        self.summary(user_id, &company)?
            .ok_or_else(|| TaskPilotError::Storage("Vault entry vanished after write".into()))
    }

    /// Entry metadata without decrypting anything.
    pub fn summary(
        &self,
        user_id: Uuid,
        company: &str,
    ) -> Result<Option<VaultSummary>, TaskPilotError> {
        Ok(self
            .find_row(user_id, company)?
            .map(|row| row.summary(user_id))
            .transpose()?)
    }

    /// Every entry a user has stored, without secrets.
    pub fn list(&self, user_id: Uuid) -> Result<Vec<VaultSummary>, TaskPilotError> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, company, account_number, secret_nonce, secret_ciphertext,
                            metadata, updated_at
                     FROM vault_entries WHERE user_id = ?1 ORDER BY company",
                )
                .map_err(storage_err)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id.to_string()], VaultRow::from_row)
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            Ok(rows)
        })?;
        rows.into_iter().map(|row| row.summary(user_id)).collect()
    }

    /// Decrypt the credentials for `(user_id, company)`.
    ///
    /// The plaintext leaves this function only inside [`Credentials`], whose
    /// `Debug` output is masked.
    pub fn reveal(
        &self,
        user_id: Uuid,
        company: &str,
    ) -> Result<Option<Credentials>, TaskPilotError> {
        let row = match self.find_row(user_id, company)? {
            Some(row) => row,
            None => return Ok(None),
        };
        let secret = self.cipher.open(&SealedSecret {
            nonce_b64: row.nonce,
            ciphertext_b64: row.ciphertext,
        })?;
        Ok(Some(Credentials {
            id: parse_uuid(&row.id)?,
            company: row.company,
            account_number: row.account_number,
            secret,
            metadata: serde_json::from_str(&row.metadata)?,
        }))
    }

    pub fn delete(&self, user_id: Uuid, company: &str) -> Result<bool, TaskPilotError> {
        let company = normalize_company(company);
        self.db.with_conn(|conn| {
            let affected = conn
                .execute(
                    "DELETE FROM vault_entries WHERE user_id = ?1 AND company = ?2",
                    rusqlite::params![user_id.to_string(), company],
                )
                .map_err(storage_err)?;
            Ok(affected > 0)
        })
    }

    fn find_row(&self, user_id: Uuid, company: &str) -> Result<Option<VaultRow>, TaskPilotError> {
        let company = normalize_company(company);
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, company, account_number, secret_nonce, secret_ciphertext,
                        metadata, updated_at
                 FROM vault_entries WHERE user_id = ?1 AND company = ?2",
                rusqlite::params![user_id.to_string(), company],
                VaultRow::from_row,
            )
            .optional()
            .map_err(storage_err)
        })
    }
}

struct VaultRow {
    id: String,
    company: String,
    account_number: String,
    nonce: String,
    ciphertext: String,
    metadata: String,
    updated_at: i64,
}

impl VaultRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            company: row.get(1)?,
            account_number: row.get(2)?,
            nonce: row.get(3)?,
            ciphertext: row.get(4)?,
            metadata: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn summary(self, user_id: Uuid) -> Result<VaultSummary, TaskPilotError> {
        Ok(VaultSummary {
            id: parse_uuid(&self.id)?,
            user_id,
            company: self.company,
            account_hint: mask_account(&self.account_number),
            metadata: serde_json::from_str(&self.metadata)?,
            updated_at: Timestamp(self.updated_at),
        })
    }
}
