//! SQLite-backed credential and entity storage.
//!
//! Secrets are encrypted at rest (AES-256-GCM, one blob per credential).
//! The store deliberately enforces no uniqueness on the
//! (user, provider, external id) lookup key - it is an opaque record store;
//! deciding what multiple matches mean belongs to the reconciliation layer.

use super::encryption::SecretCipher;
use super::{CredentialRecord, EntityRecord};
use crate::auth::TokenSet;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Persistent store for credentials and entities.
///
/// # Thread safety
/// The connection is wrapped in a `Mutex`; SQLite serializes all writes,
/// which also serializes concurrent credential updates (each update is one
/// atomic statement).
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: SecretCipher,
}

impl CredentialStore {
    /// Opens (or creates) the store.
    ///
    /// # Arguments
    /// * `db_path` - SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = SecretCipher::from_base64_key(encryption_key)
            .context("Invalid encryption key")?;
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                provider      TEXT NOT NULL,
                external_id   TEXT NOT NULL,
                secrets       TEXT NOT NULL,
                secrets_nonce TEXT NOT NULL,
                auth_is_valid INTEGER NOT NULL,
                expires_at    TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_lookup
                ON credentials(user_id, provider, external_id);

            CREATE TABLE IF NOT EXISTS entities (
                id            TEXT PRIMARY KEY,
                user_id       TEXT NOT NULL,
                provider      TEXT NOT NULL,
                external_id   TEXT NOT NULL,
                name          TEXT,
                credential_id TEXT,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_entities_lookup
                ON entities(user_id, provider, external_id);
            "#,
        )
        .context("Failed to create schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    /// Inserts a new credential with freshly-generated id. The secret bundle
    /// is sealed before it touches the database.
    pub fn create_credential(
        &self,
        user_id: &str,
        provider: &str,
        external_id: &str,
        secrets: &TokenSet,
    ) -> Result<CredentialRecord> {
        let id = Uuid::new_v4().to_string();
        let (sealed, nonce) = self.seal_secrets(secrets)?;
        let now = Utc::now();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials
                    (id, user_id, provider, external_id, secrets, secrets_nonce,
                     auth_is_valid, expires_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)
                "#,
                params![
                    id,
                    user_id,
                    provider,
                    external_id,
                    sealed,
                    nonce,
                    secrets.expires_at.map(|dt| dt.to_rfc3339()),
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert credential")?;

        Ok(CredentialRecord {
            id,
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            secrets: secrets.clone(),
            auth_is_valid: true,
            expires_at: secrets.expires_at,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns a credential by id, or `None`.
    pub fn get_credential(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM credentials WHERE id = ?1",
                CREDENTIAL_COLUMNS
            ))
            .context("Failed to prepare query")?;
        let mut rows = stmt.query(params![id]).context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(self.credential_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Returns *all* credentials matching the lookup key, in creation order.
    /// Passing `None` for `external_id` matches every account under the
    /// provider.
    pub fn find_credentials(
        &self,
        user_id: &str,
        provider: &str,
        external_id: Option<&str>,
    ) -> Result<Vec<CredentialRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut records = Vec::new();

        match external_id {
            Some(external_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM credentials
                         WHERE user_id = ?1 AND provider = ?2 AND external_id = ?3
                         ORDER BY created_at ASC",
                        CREDENTIAL_COLUMNS
                    ))
                    .context("Failed to prepare query")?;
                let mut rows = stmt
                    .query(params![user_id, provider, external_id])
                    .context("Failed to execute query")?;
                while let Some(row) = rows.next().context("Failed to read row")? {
                    records.push(self.credential_from_row(row)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM credentials
                         WHERE user_id = ?1 AND provider = ?2
                         ORDER BY created_at ASC",
                        CREDENTIAL_COLUMNS
                    ))
                    .context("Failed to prepare query")?;
                let mut rows = stmt
                    .query(params![user_id, provider])
                    .context("Failed to execute query")?;
                while let Some(row) = rows.next().context("Failed to read row")? {
                    records.push(self.credential_from_row(row)?);
                }
            }
        }

        Ok(records)
    }

    /// Replaces a credential's secret bundle, re-marking it valid and
    /// refreshing the expiry column.
    pub fn update_credential_secrets(&self, id: &str, secrets: &TokenSet) -> Result<()> {
        let (sealed, nonce) = self.seal_secrets(secrets)?;
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE credentials
                SET secrets = ?2, secrets_nonce = ?3, auth_is_valid = 1,
                    expires_at = ?4, updated_at = ?5
                WHERE id = ?1
                "#,
                params![
                    id,
                    sealed,
                    nonce,
                    secrets.expires_at.map(|dt| dt.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to update credential secrets")?;
        anyhow::ensure!(updated == 1, "Credential '{}' not found", id);
        Ok(())
    }

    /// Flips the validity flag.
    pub fn set_credential_validity(&self, id: &str, valid: bool) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE credentials SET auth_is_valid = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, valid as i64, Utc::now().to_rfc3339()],
            )
            .context("Failed to update credential validity")?;
        anyhow::ensure!(updated == 1, "Credential '{}' not found", id);
        Ok(())
    }

    /// Deletes a credential. Returns whether a row existed.
    pub fn delete_credential(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .unwrap()
            .execute("DELETE FROM credentials WHERE id = ?1", params![id])
            .context("Failed to delete credential")?;
        Ok(deleted > 0)
    }

    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Inserts a new entity record.
    pub fn create_entity(
        &self,
        user_id: &str,
        provider: &str,
        external_id: &str,
        name: Option<&str>,
        credential_id: Option<&str>,
    ) -> Result<EntityRecord> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO entities
                    (id, user_id, provider, external_id, name, credential_id,
                     created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                "#,
                params![
                    id,
                    user_id,
                    provider,
                    external_id,
                    name,
                    credential_id,
                    now.to_rfc3339(),
                ],
            )
            .context("Failed to insert entity")?;

        Ok(EntityRecord {
            id,
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            external_id: external_id.to_string(),
            name: name.map(str::to_string),
            credential_id: credential_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns an entity by id, or `None`.
    pub fn get_entity(&self, id: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM entities WHERE id = ?1",
                ENTITY_COLUMNS
            ))
            .context("Failed to prepare query")?;
        let mut rows = stmt.query(params![id]).context("Failed to execute query")?;

        match rows.next().context("Failed to read row")? {
            Some(row) => Ok(Some(entity_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Returns *all* entities matching the lookup key, in creation order.
    pub fn find_entities(
        &self,
        user_id: &str,
        provider: &str,
        external_id: Option<&str>,
    ) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut records = Vec::new();

        match external_id {
            Some(external_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM entities
                         WHERE user_id = ?1 AND provider = ?2 AND external_id = ?3
                         ORDER BY created_at ASC",
                        ENTITY_COLUMNS
                    ))
                    .context("Failed to prepare query")?;
                let mut rows = stmt
                    .query(params![user_id, provider, external_id])
                    .context("Failed to execute query")?;
                while let Some(row) = rows.next().context("Failed to read row")? {
                    records.push(entity_from_row(row)?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM entities
                         WHERE user_id = ?1 AND provider = ?2
                         ORDER BY created_at ASC",
                        ENTITY_COLUMNS
                    ))
                    .context("Failed to prepare query")?;
                let mut rows = stmt
                    .query(params![user_id, provider])
                    .context("Failed to execute query")?;
                while let Some(row) = rows.next().context("Failed to read row")? {
                    records.push(entity_from_row(row)?);
                }
            }
        }

        Ok(records)
    }

    /// Points an entity at a credential (`None` detaches it).
    pub fn link_entity_credential(&self, id: &str, credential_id: Option<&str>) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE entities SET credential_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, credential_id, Utc::now().to_rfc3339()],
            )
            .context("Failed to update entity credential link")?;
        anyhow::ensure!(updated == 1, "Entity '{}' not found", id);
        Ok(())
    }

    /// Updates an entity's display name.
    pub fn update_entity_name(&self, id: &str, name: &str) -> Result<()> {
        let updated = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE entities SET name = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, name, Utc::now().to_rfc3339()],
            )
            .context("Failed to update entity name")?;
        anyhow::ensure!(updated == 1, "Entity '{}' not found", id);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Row mapping
    // -----------------------------------------------------------------------

    fn seal_secrets(&self, secrets: &TokenSet) -> Result<(String, String)> {
        let serialized =
            serde_json::to_string(secrets).context("Failed to serialize secrets")?;
        self.cipher
            .seal(&serialized)
            .context("Failed to encrypt secrets")
    }

    fn credential_from_row(&self, row: &rusqlite::Row<'_>) -> Result<CredentialRecord> {
        let sealed: String = row.get(4).context("Failed to read secrets column")?;
        let nonce: String = row.get(5).context("Failed to read nonce column")?;
        let serialized = self
            .cipher
            .open(&sealed, &nonce)
            .context("Failed to decrypt secrets")?;
        let secrets: TokenSet =
            serde_json::from_str(&serialized).context("Failed to deserialize secrets")?;

        Ok(CredentialRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            provider: row.get(2)?,
            external_id: row.get(3)?,
            secrets,
            auth_is_valid: row.get::<_, i64>(6)? != 0,
            expires_at: parse_timestamp_opt(row.get(7)?)?,
            created_at: parse_timestamp(row.get(8)?)?,
            updated_at: parse_timestamp(row.get(9)?)?,
        })
    }
}

const CREDENTIAL_COLUMNS: &str = "id, user_id, provider, external_id, secrets, secrets_nonce, \
                                  auth_is_valid, expires_at, created_at, updated_at";

const ENTITY_COLUMNS: &str =
    "id, user_id, provider, external_id, name, credential_id, created_at, updated_at";

fn entity_from_row(row: &rusqlite::Row<'_>) -> Result<EntityRecord> {
    Ok(EntityRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        external_id: row.get(3)?,
        name: row.get(4)?,
        credential_id: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?)?,
        updated_at: parse_timestamp(row.get(7)?)?,
    })
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", raw))
}

fn parse_timestamp_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(parse_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn test_store() -> CredentialStore {
        CredentialStore::new(":memory:", &BASE64.encode([0u8; 32])).expect("test store")
    }

    fn token_set() -> TokenSet {
        TokenSet {
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn create_and_get_credential() {
        let store = test_store();
        let created = store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();

        let fetched = store.get_credential(&created.id).unwrap().unwrap();
        assert_eq!(fetched.user_id, "user1");
        assert_eq!(fetched.provider, "github");
        assert_eq!(fetched.external_id, "acct-1");
        assert_eq!(fetched.secrets.access_token, "access-token-12345");
        assert!(fetched.auth_is_valid);
        assert!(fetched.expires_at.is_some());
    }

    #[test]
    fn get_nonexistent_credential() {
        let store = test_store();
        assert!(store.get_credential("no-such-id").unwrap().is_none());
    }

    #[test]
    fn find_credentials_filters_by_key() {
        let store = test_store();
        store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();
        store
            .create_credential("user1", "github", "acct-2", &token_set())
            .unwrap();
        store
            .create_credential("user2", "github", "acct-1", &token_set())
            .unwrap();

        let all = store.find_credentials("user1", "github", None).unwrap();
        assert_eq!(all.len(), 2);

        let scoped = store
            .find_credentials("user1", "github", Some("acct-1"))
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].external_id, "acct-1");

        assert!(store.find_credentials("user3", "github", None).unwrap().is_empty());
    }

    #[test]
    fn duplicate_keys_are_stored_not_rejected() {
        // Ambiguity detection is the reconciliation layer's job.
        let store = test_store();
        store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();
        store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();

        let matches = store
            .find_credentials("user1", "github", Some("acct-1"))
            .unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn update_secrets_remarks_valid() {
        let store = test_store();
        let created = store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();
        store.set_credential_validity(&created.id, false).unwrap();

        let rotated = TokenSet {
            access_token: "new-access".to_string(),
            refresh_token: Some("new-refresh".to_string()),
            expires_at: None,
            extra: serde_json::Map::new(),
        };
        store.update_credential_secrets(&created.id, &rotated).unwrap();

        let fetched = store.get_credential(&created.id).unwrap().unwrap();
        assert_eq!(fetched.secrets.access_token, "new-access");
        assert!(fetched.auth_is_valid);
        assert!(fetched.expires_at.is_none());
    }

    #[test]
    fn update_missing_credential_fails() {
        let store = test_store();
        assert!(store
            .update_credential_secrets("ghost", &token_set())
            .is_err());
        assert!(store.set_credential_validity("ghost", false).is_err());
    }

    #[test]
    fn delete_credential_reports_existence() {
        let store = test_store();
        let created = store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();

        assert!(store.delete_credential(&created.id).unwrap());
        assert!(store.get_credential(&created.id).unwrap().is_none());
        assert!(!store.delete_credential(&created.id).unwrap());
    }

    #[test]
    fn entity_lifecycle() {
        let store = test_store();
        let credential = store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();
        let entity = store
            .create_entity("user1", "github", "acct-1", Some("Acme Org"), Some(&credential.id))
            .unwrap();

        let fetched = store.get_entity(&entity.id).unwrap().unwrap();
        assert_eq!(fetched.name.as_deref(), Some("Acme Org"));
        assert_eq!(fetched.credential_id.as_deref(), Some(credential.id.as_str()));

        store.link_entity_credential(&entity.id, None).unwrap();
        let detached = store.get_entity(&entity.id).unwrap().unwrap();
        assert!(detached.credential_id.is_none());
        // Entity survives detachment
        assert_eq!(detached.external_id, "acct-1");

        store.update_entity_name(&entity.id, "Acme Holdings").unwrap();
        let renamed = store.get_entity(&entity.id).unwrap().unwrap();
        assert_eq!(renamed.name.as_deref(), Some("Acme Holdings"));
    }

    #[test]
    fn records_survive_a_store_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("credentials.db");
        let key = BASE64.encode([3u8; 32]);

        let id = {
            let store = CredentialStore::new(&db_path, &key).unwrap();
            store
                .create_credential("user1", "github", "acct-1", &token_set())
                .unwrap()
                .id
        };

        let reopened = CredentialStore::new(&db_path, &key).unwrap();
        let fetched = reopened.get_credential(&id).unwrap().unwrap();
        assert_eq!(fetched.secrets.access_token, "access-token-12345");

        // A different master key cannot decrypt what is on disk
        let wrong_key = BASE64.encode([4u8; 32]);
        let wrong = CredentialStore::new(&db_path, &wrong_key).unwrap();
        assert!(wrong.get_credential(&id).is_err());
    }

    #[test]
    fn secrets_are_not_plaintext_at_rest() {
        let store = test_store();
        store
            .create_credential("user1", "github", "acct-1", &token_set())
            .unwrap();

        let conn = store.conn.lock().unwrap();
        let raw: String = conn
            .query_row("SELECT secrets FROM credentials", [], |row| row.get(0))
            .unwrap();
        assert!(!raw.contains("access-token-12345"));
    }
}
