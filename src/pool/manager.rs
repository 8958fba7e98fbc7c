//! Connection factory seam for [`Pool`](super::Pool).

use async_trait::async_trait;

use crate::error::Result;

/// Creates, checks and tears down backend connections for a pool.
///
/// `create` should fail with [`GuardError::BackendUnavailable`] when the
/// backend cannot be reached; any other error is reported to the caller
/// under that variant as well.
///
/// [`GuardError::BackendUnavailable`]: crate::error::GuardError::BackendUnavailable
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn create(&self) -> Result<Self::Connection>;

    /// Close a connection that is leaving the pool.
    async fn destroy(&self, conn: Self::Connection) {
        drop(conn);
    }

    /// Checked when a connection is returned. `false` destroys it instead of
    /// putting it back into rotation.
    fn is_valid(&self, _conn: &Self::Connection) -> bool {
        true
    }
}
