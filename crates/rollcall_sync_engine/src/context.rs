//! Shared state handed to the push, pull and feed routines.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteApi;
use rollcall_store::{LocalStore, OwnerId};
use std::future::Future;
use std::sync::Arc;

pub(crate) struct SyncContext {
    pub(crate) owner: OwnerId,
    pub(crate) store: LocalStore,
    pub(crate) remote: Arc<dyn RemoteApi>,
    pub(crate) config: SyncConfig,
}

impl SyncContext {
    /// Awaits a remote call, bounded by the request timeout.
    ///
    /// Callers must not hold a store lock here.
    pub(crate) async fn call<F, T>(&self, request: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let limit = self.config.request_timeout;
        tokio::time::timeout(limit, request)
            .await
            .map_err(|_| SyncError::Timeout(limit))?
    }
}
