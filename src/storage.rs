//! Storage stack assembly shared by the pipelines.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use dbkp_datastore::{make_store, AuditStore, DedupStore, ObjectStore, StoreOptions};
use dbkp_tools::error::Result;

/// The assembled store plus a direct handle on the dedup layer when one
/// is part of the stack (the pipelines need its `last_chunks`).
pub(crate) struct StorageStack {
    pub store: Arc<dyn ObjectStore>,
    pub dedup: Option<Arc<DedupStore>>,
}

/// Build the store for one operation.
///
/// Wrapping order is fixed: audit sits directly on the backend so chunk
/// uploads are audited too, the dedup layer sits on top. Deduplication
/// is wrapped here and nowhere else.
pub(crate) fn build_storage(
    uri: &str,
    dedup: bool,
    parity_stripe: usize,
    audit: bool,
    allow_insecure: bool,
    cancel: &CancellationToken,
) -> Result<StorageStack> {
    let options = StoreOptions {
        allow_insecure,
        cancel: cancel.clone(),
        ..Default::default()
    };
    let mut store: Arc<dyn ObjectStore> = make_store(uri, &options)?;
    if audit {
        store = Arc::new(AuditStore::new(store));
    }

    if dedup {
        let dedup_store = Arc::new(if parity_stripe > 0 {
            DedupStore::with_parity(store, parity_stripe, cancel.clone())
        } else {
            DedupStore::new(store, cancel.clone())
        });
        Ok(StorageStack {
            store: dedup_store.clone(),
            dedup: Some(dedup_store),
        })
    } else {
        Ok(StorageStack { store, dedup: None })
    }
}
