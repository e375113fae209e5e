//! Persistence seam for invitation codes.
//!
//! The keyed record store lives outside this crate; the session
//! manager only needs CRUD. [`MemoryCodeStore`] is the in-process
//! implementation used by the host binary and the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ShareError;
use crate::invite::{CodeRecord, InviteCode};

/// CRUD access to persisted invitation-code records.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Insert a new record. Fails if the code already exists.
    async fn insert(&self, record: CodeRecord) -> Result<(), ShareError>;

    /// Fetch a record by code.
    async fn get(&self, code: &InviteCode) -> Result<Option<CodeRecord>, ShareError>;

    /// Overwrite an existing record.
    async fn update(&self, record: CodeRecord) -> Result<(), ShareError>;

    /// Delete a record. Deleting a missing code is not an error.
    async fn remove(&self, code: &InviteCode) -> Result<(), ShareError>;
}

// ── MemoryCodeStore ──────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCodeStore {
    records: RwLock<HashMap<InviteCode, CodeRecord>>,
}

impl MemoryCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl CodeStore for MemoryCodeStore {
    async fn insert(&self, record: CodeRecord) -> Result<(), ShareError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.code) {
            return Err(ShareError::Store(format!("code {} already exists", record.code)));
        }
        records.insert(record.code.clone(), record);
        Ok(())
    }

    async fn get(&self, code: &InviteCode) -> Result<Option<CodeRecord>, ShareError> {
        Ok(self.records.read().await.get(code).cloned())
    }

    async fn update(&self, record: CodeRecord) -> Result<(), ShareError> {
        let mut records = self.records.write().await;
        match records.get_mut(&record.code) {
            Some(slot) => {
                *slot = record;
                Ok(())
            }
            None => Err(ShareError::Store(format!("code {} not found", record.code))),
        }
    }

    async fn remove(&self, code: &InviteCode) -> Result<(), ShareError> {
        self.records.write().await.remove(code);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn record(code: &str) -> CodeRecord {
        let now = SystemTime::now();
        CodeRecord {
            code: InviteCode::parse(code).unwrap(),
            session_id: 1,
            created_at: now,
            expires_at: now,
            max_uses: Some(2),
            use_count: 0,
            revoked: false,
        }
    }

    #[tokio::test]
    async fn crud_cycle() {
        let store = MemoryCodeStore::new();
        let mut rec = record("QWERTY");
        store.insert(rec.clone()).await.unwrap();
        assert!(store.insert(rec.clone()).await.is_err());

        rec.use_count = 1;
        store.update(rec.clone()).await.unwrap();
        let got = store.get(&rec.code).await.unwrap().unwrap();
        assert_eq!(got.use_count, 1);

        store.remove(&rec.code).await.unwrap();
        assert!(store.get(&rec.code).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_missing_fails() {
        let store = MemoryCodeStore::new();
        tokio_test::assert_err!(store.update(record("ZXCVBN")).await);
    }
}
