//! Scoped read-modify-write over the client pool.
//!
//! `modify` is the only sanctioned way to mutate a resource: it reads under
//! a per-`(source, type, id)` lock, hands the resource to the caller's
//! closure, and writes the result back before the lock is released. The
//! resource cannot escape the scope unwritten.

use carebridge_core::{Error, Resource, Result};

use crate::client::FhirClientPool;

/// What a modify scope body decided to do with the resource it was handed.
#[derive(Debug)]
pub enum ScopeOutcome {
    /// Write the (possibly mutated) resource back via `update`.
    Commit(Resource),
    /// Discard all changes; the caller sees `Conflict`.
    Abort,
}

impl FhirClientPool {
    /// Read-modify-write `resource_type/id` on `source` under mutual
    /// exclusion.
    ///
    /// The per-key lock queues waiters in FIFO order, so a second `modify`
    /// on the same key begins only after the first completes. The body
    /// receives the freshly-read resource by value and decides between
    /// [`ScopeOutcome::Commit`] and [`ScopeOutcome::Abort`]; body errors
    /// propagate without writing. A transport failure on the write-back
    /// surfaces as `UpdateFailed`. The lock is released on every path.
    pub async fn modify<F, Fut>(
        &self,
        resource_type: &str,
        id: &str,
        source: Option<&str>,
        body: F,
    ) -> Result<Resource>
    where
        F: FnOnce(Resource) -> Fut,
        Fut: Future<Output = Result<ScopeOutcome>>,
    {
        let src = self.resolve(source)?;
        let lock = self.lock_for(src.name(), resource_type, id);
        let _guard = lock.lock().await;

        let resource = self.read(resource_type, id, Some(src.name())).await?;

        match body(resource).await? {
            ScopeOutcome::Commit(updated) => self
                .update(updated, Some(src.name()))
                .await
                .map_err(|e| match e {
                    Error::InvalidArgument(msg) => Error::InvalidArgument(msg),
                    other => Error::update_failed(other.to_string()),
                }),
            ScopeOutcome::Abort => Err(Error::conflict(format!(
                "modify scope for {resource_type}/{id} aborted"
            ))),
        }
    }
}
