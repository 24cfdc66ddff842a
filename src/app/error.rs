use thiserror::Error;

use crate::{database, media, token_pool, upstream};

/// Error surface of the app operations.
///
/// Plan and quota denials are not errors: they come back as
/// `PlanDecision` values. Everything here is either caller fault
/// (validation), a resource condition, or a collaborator failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("user not found")]
    UserNotFound,

    #[error("job not found")]
    JobNotFound,

    #[error("no tokens available")]
    NoTokensAvailable,

    #[error("upstream error: {0}")]
    Upstream(#[from] upstream::Error),

    #[error("media upload failed: {0}")]
    MediaUpload(#[from] media::Error),

    #[error(transparent)]
    Database(#[from] database::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<token_pool::Error> for Error {
    fn from(err: token_pool::Error) -> Self {
        match err {
            token_pool::Error::NoTokensAvailable => Self::NoTokensAvailable,
            token_pool::Error::Database(err) => Self::Database(err),
        }
    }
}
