//! In-memory key slot (non-persistent, for tests and ephemeral sessions)

use super::{KeyResult, KeySlot, KeyStoreError, PrivateKeyRecord};
use std::sync::{PoisonError, RwLock};

fn handle_poison<T>(_err: PoisonError<T>) -> KeyStoreError {
    KeyStoreError::Other("Lock poisoned: a thread panicked while holding the lock".to_string())
}

#[derive(Default)]
pub struct MemoryKeySlot {
    record: RwLock<Option<PrivateKeyRecord>>,
}

impl MemoryKeySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeySlot for MemoryKeySlot {
    fn load(&self) -> KeyResult<Option<PrivateKeyRecord>> {
        Ok(self.record.read().map_err(handle_poison)?.clone())
    }

    fn save(&self, record: &PrivateKeyRecord) -> KeyResult<()> {
        *self.record.write().map_err(handle_poison)? = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> KeyResult<()> {
        *self.record.write().map_err(handle_poison)? = None;
        Ok(())
    }
}
