use thiserror::Error;

use cabs_store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("synchronization needs at least two stores, got {0}")]
    TooFewStores(usize),

    #[error("store {index} has no anchor capability")]
    NotAnchorStore { index: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SyncResult<T> = Result<T, SyncError>;
