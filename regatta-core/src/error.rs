use regatta_model::group::GroupError;
use regatta_model::instance::{InstanceId, InstanceIdError};
use regatta_model::path::PathId;

/// The error taxonomy every asynchronous entry point settles with.
///
/// The kill service and the garbage collector never surface these: their
/// internal failures are logged and swallowed. The deployment executor maps
/// unknown failures to [`CoreError::DeploymentFailed`].
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    #[error("{0} conflicts with an existing id")]
    Conflict(PathId),

    #[error("run specs locked by deployment {deployment_id}: {run_spec_ids:?}")]
    AppLocked {
        deployment_id: String,
        run_spec_ids: Vec<PathId>,
    },

    #[error("deployment {0} was cancelled")]
    DeploymentCancelled(String),

    #[error("deployment {id} failed: {reason}")]
    DeploymentFailed { id: String, reason: String },

    #[error("instance {0} has no run spec anymore")]
    Orphaned(InstanceId),

    #[error(transparent)]
    MatchError(#[from] InstanceIdError),

    #[error("plugin {0} failed to initialize")]
    PluginInitializationFailure(String),

    #[error("repository scan failed: {0}")]
    ScanError(String),

    #[error("repository compaction failed: {0}")]
    CompactError(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<GroupError> for CoreError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::Conflict(id) => CoreError::Conflict(id),
            GroupError::Validation(msg) => CoreError::ValidationFailure(msg),
            GroupError::Cycle(msg) => {
                CoreError::ValidationFailure(format!("dependency cycle: {msg}"))
            }
        }
    }
}

impl CoreError {
    /// Fatal errors abort the process instead of settling a caller's future.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::PluginInitializationFailure(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
