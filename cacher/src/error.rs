//! This module provides the failures of fetch-and-cache tasks and the reports carrying them.

use reqwest::StatusCode;
use thiserror::Error;

use crate::storage::StorageError;

/// Failure of a single fetch-and-cache operation.
///
/// None of them is fatal: the worker abandons the current task only.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("status code is {0}")]
    HttpStatus(StatusCode),
    #[error("maximum size exceeded ({limit} bytes)")]
    SizeLimitExceeded { limit: usize },
    #[error("upload failed: {0}")]
    Upload(#[from] StorageError),
    #[error("maximum recursion cache depth exceeded")]
    RecursionDepthExceeded,
    #[error("{dropped} referenced assets dropped, the task queue is overloaded")]
    Overloaded { dropped: usize },
}

/// An [`Error`] together with the provenance of the asset that failed.
///
/// The context is the URL trail leading to the asset, from the originally requested URL down to the failing one.
#[derive(Debug, Error)]
#[error("{context}: {cause}")]
pub struct Report {
    pub context: String,
    #[source]
    pub cause: Error,
}

impl Report {
    pub fn new(context: impl Into<String>, cause: Error) -> Self {
        Self {
            context: context.into(),
            cause,
        }
    }
}
