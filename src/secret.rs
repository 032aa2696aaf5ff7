use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

/// Errors an external secrets store can surface through the seam.
#[derive(Debug, Clone, Error)]
pub enum SecretsError {
    #[error("secrets store error: {0}")]
    Upstream(String),

    #[error("secrets io error: {0}")]
    Io(String),

    #[error("no secrets found")]
    NotFound,
}

/// Produces the environment map for a worker when its config carries none.
/// The concrete store lives outside the core; this is the seam the
/// supervisor calls through when forking and when `restart` resolves a
/// fresh environment. Embedders hand their store integration to
/// [`crate::supervisor::Supervisor::new`].
#[async_trait]
pub trait SecretsSource: Send + Sync {
    async fn load(
        &self,
        worker_id: &str,
        storage: &Path,
    ) -> Result<HashMap<String, String>, SecretsError>;
}

/// Fixed map, for tests and embedders that resolve secrets themselves
/// before handing configs to the supervisor.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets(pub HashMap<String, String>);

#[async_trait]
impl SecretsSource for StaticSecrets {
    async fn load(
        &self,
        _worker_id: &str,
        _storage: &Path,
    ) -> Result<HashMap<String, String>, SecretsError> {
        Ok(self.0.clone())
    }
}
