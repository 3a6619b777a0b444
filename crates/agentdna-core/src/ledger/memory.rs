use std::sync::Mutex;

use async_trait::async_trait;

use super::{AuditFilter, AuditLedger, AuditRecord, RecordId};
use crate::error::Result;

/// Process-local ledger, mostly for tests and single-shot tools.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl AuditLedger for MemoryLedger {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, mut record: AuditRecord) -> Result<RecordId> {
        let id = RecordId::generate();
        record.record_id = Some(id);
        self.lock().push(record);
        Ok(id)
    }

    async fn fetch_page(
        &self,
        filter: &AuditFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self
            .lock()
            .iter()
            .filter(|record| filter.matches(record))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
