use std::path::Path;

use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;
use tokio_rusqlite::Connection;

use rollcall_core::{Embedding, EmbeddingError, IdentityIndex, SubjectKey, EMBEDDING_DIM};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid stored embedding: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("invalid subject key in store: {0:?}")]
    InvalidKey(String),
    #[error("subject already enrolled: {0}")]
    SubjectExists(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// An enrolled identity record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Subject {
    pub key: SubjectKey,
    pub display_name: String,
    pub group_label: Option<String>,
    pub reference_image: Option<String>,
    pub enrolled_at: String,
}

/// One accepted attendance event. Never mutated, never deleted by normal
/// operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub subject_key: SubjectKey,
    /// Local calendar day the event belongs to (`YYYY-MM-DD`).
    pub day: String,
    pub recorded_at: String,
    pub confidence: f64,
}

/// Result of a ledger mark: either a freshly recorded event, or a refusal
/// because one already exists for the (subject, day) key.
#[derive(Debug, Clone)]
pub enum MarkOutcome {
    Recorded(AttendanceEvent),
    Duplicate,
}

/// SQLite-backed roster, index persistence, and attendance ledger.
///
/// Embedding blobs are encrypted with AES-256-GCM before storage. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600, owner-readable only).
///
/// The ledger's at-most-one-event-per-(subject, day) invariant lives in the
/// schema (`UNIQUE(subject_key, day)`), so concurrent marks cannot both pass
/// a duplicate check and both write.
#[derive(Clone)]
pub struct AttendanceStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl AttendanceStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/rollcall"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path.to_path_buf()).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS subjects (
                     key TEXT PRIMARY KEY,
                     display_name TEXT NOT NULL,
                     group_label TEXT,
                     reference_image TEXT,
                     enrolled_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS index_entries (
                     seq INTEGER PRIMARY KEY AUTOINCREMENT,
                     subject_key TEXT NOT NULL,
                     embedding BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_entries_subject ON index_entries(subject_key);
                 CREATE TABLE IF NOT EXISTS attendance (
                     id TEXT PRIMARY KEY,
                     subject_key TEXT NOT NULL,
                     day TEXT NOT NULL,
                     recorded_at TEXT NOT NULL,
                     confidence REAL NOT NULL,
                     UNIQUE(subject_key, day)
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    // ── Subject roster ────────────────────────────────────────────────────────

    /// Enroll a new subject record. Fails with [`StoreError::SubjectExists`]
    /// if the key is already taken.
    pub async fn insert_subject(
        &self,
        key: &SubjectKey,
        display_name: &str,
        group_label: Option<&str>,
        reference_image: Option<&str>,
    ) -> Result<Subject, StoreError> {
        let subject = Subject {
            key: key.clone(),
            display_name: display_name.to_string(),
            group_label: group_label.map(str::to_string),
            reference_image: reference_image.map(str::to_string),
            enrolled_at: Local::now().to_rfc3339(),
        };

        let row = subject.clone();
        let result = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subjects (key, display_name, group_label, reference_image, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.key.as_str(),
                        row.display_name,
                        row.group_label,
                        row.reference_image,
                        row.enrolled_at
                    ],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(subject),
            Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::SubjectExists(key.to_string()))
            }
            Err(e) => Err(StoreError::Db(e)),
        }
    }

    pub async fn get_subject(&self, key: &SubjectKey) -> Result<Option<Subject>, StoreError> {
        let key_str = key.to_string();
        let row: Option<(String, String, Option<String>, Option<String>, String)> = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT key, display_name, group_label, reference_image, enrolled_at
                         FROM subjects WHERE key = ?1",
                        [&key_str],
                        |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        row.map(|(key, display_name, group_label, reference_image, enrolled_at)| {
            Ok(Subject {
                key: SubjectKey::new(&key).map_err(|_| StoreError::InvalidKey(key))?,
                display_name,
                group_label,
                reference_image,
                enrolled_at,
            })
        })
        .transpose()
    }

    /// List all enrolled subjects in enrollment order.
    pub async fn list_subjects(&self) -> Result<Vec<Subject>, StoreError> {
        let rows: Vec<(String, String, Option<String>, Option<String>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, display_name, group_label, reference_image, enrolled_at
                     FROM subjects ORDER BY enrolled_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(key, display_name, group_label, reference_image, enrolled_at)| {
                Ok(Subject {
                    key: SubjectKey::new(&key).map_err(|_| StoreError::InvalidKey(key))?,
                    display_name,
                    group_label,
                    reference_image,
                    enrolled_at,
                })
            })
            .collect()
    }

    /// Remove a subject and retract all of its index entries in one
    /// transaction. Attendance events are kept — they are historical record.
    pub async fn remove_subject(&self, key: &SubjectKey) -> Result<bool, StoreError> {
        let key_str = key.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM index_entries WHERE subject_key = ?1",
                    [&key_str],
                )?;
                let affected = tx.execute("DELETE FROM subjects WHERE key = ?1", [&key_str])?;
                tx.commit()?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count_subjects(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM subjects", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Identity index persistence ────────────────────────────────────────────

    /// Append one (embedding, subject key) pair to the persisted index.
    pub async fn append_index_entry(
        &self,
        key: &SubjectKey,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        let blob = self.encrypt_embedding(embedding)?;
        let key_str = key.to_string();
        let created_at = Local::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO index_entries (subject_key, embedding, created_at)
                     VALUES (?1, ?2, ?3)",
                    params![key_str, blob, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Rebuild the in-memory index from persisted entries, in insertion
    /// order, so the k-th vector always corresponds to the k-th key.
    pub async fn load_index(&self) -> Result<IdentityIndex, StoreError> {
        let rows: Vec<(String, Vec<u8>)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT subject_key, embedding FROM index_entries ORDER BY seq",
                )?;
                let rows =
                    stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut index = IdentityIndex::new();
        for (key, blob) in rows {
            let embedding = self.decrypt_embedding(&blob)?;
            let key = SubjectKey::new(&key).map_err(|_| StoreError::InvalidKey(key))?;
            index.insert(embedding, key);
        }
        Ok(index)
    }

    // ── Attendance ledger ─────────────────────────────────────────────────────

    /// Whether an accepted event already exists for (subject, day).
    pub async fn has_marked_today(
        &self,
        key: &SubjectKey,
        day: NaiveDate,
    ) -> Result<bool, StoreError> {
        let key_str = key.to_string();
        let day_str = day.to_string();
        self.conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM attendance WHERE subject_key = ?1 AND day = ?2)",
                    params![key_str, day_str],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Record an attendance event unless one already exists for the
    /// subject's calendar day.
    ///
    /// Check-then-act runs inside SQLite (`INSERT OR IGNORE` against the
    /// unique key), so of N concurrent marks for the same (subject, day)
    /// exactly one is recorded and the rest report [`MarkOutcome::Duplicate`].
    pub async fn mark(
        &self,
        key: &SubjectKey,
        confidence: f32,
        timestamp: DateTime<Local>,
    ) -> Result<MarkOutcome, StoreError> {
        let event = AttendanceEvent {
            id: uuid::Uuid::new_v4().to_string(),
            subject_key: key.clone(),
            day: timestamp.date_naive().to_string(),
            recorded_at: timestamp.to_rfc3339(),
            confidence: confidence as f64,
        };

        let row = event.clone();
        let inserted = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT OR IGNORE INTO attendance (id, subject_key, day, recorded_at, confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.id,
                        row.subject_key.as_str(),
                        row.day,
                        row.recorded_at,
                        row.confidence
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if inserted == 0 {
            Ok(MarkOutcome::Duplicate)
        } else {
            Ok(MarkOutcome::Recorded(event))
        }
    }

    /// Most recent events for a subject, newest first.
    pub async fn recent_events(
        &self,
        key: &SubjectKey,
        limit: u32,
    ) -> Result<Vec<AttendanceEvent>, StoreError> {
        let key_str = key.to_string();
        let rows: Vec<(String, String, String, String, f64)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, subject_key, day, recorded_at, confidence
                     FROM attendance WHERE subject_key = ?1
                     ORDER BY day DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![key_str, limit], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        rows.into_iter()
            .map(|(id, key, day, recorded_at, confidence)| {
                Ok(AttendanceEvent {
                    id,
                    subject_key: SubjectKey::new(&key).map_err(|_| StoreError::InvalidKey(key))?,
                    day,
                    recorded_at,
                    confidence,
                })
            })
            .collect()
    }

    pub async fn count_events(&self, key: &SubjectKey) -> Result<u64, StoreError> {
        let key_str = key.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE subject_key = ?1",
                    [&key_str],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Administration ────────────────────────────────────────────────────────

    /// Clear subjects, index entries, and events in a single transaction.
    /// The vector/key pair can never survive a reset half-cleared.
    pub async fn reset_all(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM attendance", [])?;
                tx.execute("DELETE FROM index_entries", [])?;
                tx.execute("DELETE FROM subjects", [])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt an embedding with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, embedding: &Embedding) -> Result<Vec<u8>, StoreError> {
        let plaintext = embedding_to_bytes(embedding.values());

        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt an embedding blob and validate it.
    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Embedding, StoreError> {
        const NONCE_LEN: usize = 12;

        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_embedding(&plaintext)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding(bytes: &[u8]) -> Result<Embedding, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        values.push(f32::from_le_bytes(arr));
    }

    // Embedding::new re-validates dimension and finiteness
    Ok(Embedding::new(values)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn memory_store() -> AttendanceStore {
        AttendanceStore::open(Path::new(":memory:")).await.unwrap()
    }

    fn key(s: &str) -> SubjectKey {
        SubjectKey::new(s).unwrap()
    }

    fn axis_embedding(i: usize) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[i] = 1.0;
        Embedding::new(values).unwrap()
    }

    fn local_ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn subject_roundtrip() {
        let store = memory_store().await;
        store
            .insert_subject(&key("s-001"), "Asha Rao", Some("cohort-a"), None)
            .await
            .unwrap();

        let subject = store.get_subject(&key("s-001")).await.unwrap().unwrap();
        assert_eq!(subject.key.as_str(), "s-001");
        assert_eq!(subject.display_name, "Asha Rao");
        assert_eq!(subject.group_label.as_deref(), Some("cohort-a"));
        assert!(subject.reference_image.is_none());

        assert!(store.get_subject(&key("s-404")).await.unwrap().is_none());
        assert_eq!(store.count_subjects().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_subject_key_rejected() {
        let store = memory_store().await;
        store
            .insert_subject(&key("s-001"), "Asha Rao", None, None)
            .await
            .unwrap();
        let err = store
            .insert_subject(&key("s-001"), "Someone Else", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SubjectExists(_)));
    }

    #[tokio::test]
    async fn index_entries_roundtrip_in_order() {
        let store = memory_store().await;
        for (i, k) in ["s1", "s2", "s3"].iter().enumerate() {
            store
                .append_index_entry(&key(k), &axis_embedding(i))
                .await
                .unwrap();
        }

        let index = store.load_index().await.unwrap();
        assert_eq!(index.len(), 3);

        let mut mix = vec![0.0; EMBEDDING_DIM];
        mix[0] = 0.1;
        mix[1] = 0.9;
        let probe = Embedding::normalized(mix).unwrap();
        let hit = index.query_nearest(&probe).unwrap().unwrap();
        assert_eq!(hit.subject_key.as_str(), "s2");
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = std::env::temp_dir().join(format!(
            "rollcall-store-test-reload-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let db_path = dir.join("attendance.db");

        let probe = axis_embedding(7);
        let before = {
            let store = AttendanceStore::open(&db_path).await.unwrap();
            store
                .append_index_entry(&key("s-001"), &axis_embedding(7))
                .await
                .unwrap();
            store
                .append_index_entry(&key("s-002"), &axis_embedding(9))
                .await
                .unwrap();
            let index = store.load_index().await.unwrap();
            index.query_nearest(&probe).unwrap().unwrap()
        };

        let store = AttendanceStore::open(&db_path).await.unwrap();
        let index = store.load_index().await.unwrap();
        assert_eq!(index.len(), 2);
        let after = index.query_nearest(&probe).unwrap().unwrap();
        assert_eq!(before.subject_key, after.subject_key);
        assert_eq!(before.similarity, after.similarity);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn wrong_key_fails_decryption() {
        let store1 = AttendanceStore {
            conn: Connection::open(std::path::PathBuf::from(":memory:"))
                .await
                .unwrap(),
            enc_key: [1u8; 32],
        };
        let store2 = AttendanceStore {
            conn: store1.conn.clone(),
            enc_key: [2u8; 32],
        };

        let blob = store1.encrypt_embedding(&axis_embedding(0)).unwrap();
        let err = store2.decrypt_embedding(&blob).unwrap_err();
        assert!(matches!(err, StoreError::DecryptionFailed));
    }

    #[tokio::test]
    async fn rejects_malformed_blobs() {
        let store = memory_store().await;
        let err = store.decrypt_embedding(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(10)));

        let mut blob = store.encrypt_embedding(&axis_embedding(0)).unwrap();
        blob.truncate(blob.len() - 1);
        let err = store.decrypt_embedding(&blob).unwrap_err();
        assert!(matches!(err, StoreError::DecryptionFailed));
    }

    #[tokio::test]
    async fn rejects_non_finite_plaintext() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[42] = f32::NAN;
        let bytes = embedding_to_bytes(&values);
        let err = bytes_to_embedding(&bytes).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Embedding(EmbeddingError::InvalidValue)
        ));

        let err = bytes_to_embedding(&[0u8; 100]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidBlob(100)));
    }

    #[tokio::test]
    async fn mark_refuses_same_day_duplicate() {
        let store = memory_store().await;
        let subject = key("s-001");

        let first = store
            .mark(&subject, 0.91, local_ts(2026, 3, 2, 9))
            .await
            .unwrap();
        assert!(matches!(first, MarkOutcome::Recorded(_)));
        assert!(store
            .has_marked_today(&subject, local_ts(2026, 3, 2, 9).date_naive())
            .await
            .unwrap());

        // Later the same day, even with a different timestamp/confidence.
        let second = store
            .mark(&subject, 0.99, local_ts(2026, 3, 2, 17))
            .await
            .unwrap();
        assert!(matches!(second, MarkOutcome::Duplicate));
        assert_eq!(store.count_events(&subject).await.unwrap(), 1);

        // A new calendar day is a new key.
        let next_day = store
            .mark(&subject, 0.88, local_ts(2026, 3, 3, 9))
            .await
            .unwrap();
        assert!(matches!(next_day, MarkOutcome::Recorded(_)));
        assert_eq!(store.count_events(&subject).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_marks_record_exactly_once() {
        let store = memory_store().await;
        let subject = key("s-001");
        let ts = local_ts(2026, 3, 2, 9);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let subject = subject.clone();
            handles.push(tokio::spawn(
                async move { store.mark(&subject, 0.9, ts).await },
            ));
        }

        let mut recorded = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                MarkOutcome::Recorded(_) => recorded += 1,
                MarkOutcome::Duplicate => duplicates += 1,
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(duplicates, 7);
        assert_eq!(store.count_events(&subject).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_subject_retracts_index_entries() {
        let store = memory_store().await;
        let subject = key("s-001");
        store
            .insert_subject(&subject, "Asha Rao", None, None)
            .await
            .unwrap();
        store
            .append_index_entry(&subject, &axis_embedding(0))
            .await
            .unwrap();
        store
            .append_index_entry(&subject, &axis_embedding(1))
            .await
            .unwrap();

        assert!(store.remove_subject(&subject).await.unwrap());
        assert!(store.get_subject(&subject).await.unwrap().is_none());
        assert!(store.load_index().await.unwrap().is_empty());

        // Second removal is a no-op.
        assert!(!store.remove_subject(&subject).await.unwrap());
    }

    #[tokio::test]
    async fn recent_events_newest_first() {
        let store = memory_store().await;
        let subject = key("s-001");
        for d in 1..=4 {
            store
                .mark(&subject, 0.9, local_ts(2026, 3, d, 9))
                .await
                .unwrap();
        }

        let events = store.recent_events(&subject, 2).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].day, "2026-03-04");
        assert_eq!(events[1].day, "2026-03-03");
        assert_eq!(store.count_events(&subject).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn reset_all_clears_everything() {
        let store = memory_store().await;
        let subject = key("s-001");
        store
            .insert_subject(&subject, "Asha Rao", None, None)
            .await
            .unwrap();
        store
            .append_index_entry(&subject, &axis_embedding(0))
            .await
            .unwrap();
        store
            .mark(&subject, 0.9, local_ts(2026, 3, 2, 9))
            .await
            .unwrap();

        store.reset_all().await.unwrap();

        assert_eq!(store.count_subjects().await.unwrap(), 0);
        assert!(store.load_index().await.unwrap().is_empty());
        assert_eq!(store.count_events(&subject).await.unwrap(), 0);
    }
}
