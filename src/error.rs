use thiserror::Error;

use crate::limits::LimitsError;
use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("descriptor text is empty")]
    EmptyText,
    #[error("payload is empty")]
    EmptyPayload,
    #[error("invalid limits: {0}")]
    Limits(#[from] LimitsError),
}
