//! Batch needle deletion
//!
//! Each file id is handled on its own and gets its own result; only a cookie
//! mismatch aborts the batch, leaving later ids without a result.

use crate::store::VolumeStore;
use needlefs_common::{FileId, Size};
use serde::Serialize;
use tracing::{debug, warn};

/// Error text for chunk manifests, which must be deleted chunk by chunk
pub const CHUNK_MANIFEST_ERROR: &str = "ChunkManifest: not allowed in batch delete mode.";

/// Error text for a file id whose cookie differs from the stored needle
pub const COOKIE_MISMATCH_ERROR: &str = "File Random Cookie does not match.";

/// Outcome of one entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DeleteStatus {
    Accepted,
    BadRequest,
    NotFound,
    NotAcceptable,
    InternalError,
}

impl DeleteStatus {
    /// HTTP status code carried on the wire
    #[must_use]
    pub const fn http_code(self) -> u16 {
        match self {
            Self::Accepted => 202,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::NotAcceptable => 406,
            Self::InternalError => 500,
        }
    }
}

/// Result for one file id
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub file_id: String,
    pub status: DeleteStatus,
    /// Freed bytes; only set when accepted
    pub size: Size,
    /// Empty when accepted
    pub error: String,
}

impl DeleteResult {
    fn accepted(file_id: &str, size: Size) -> Self {
        Self {
            file_id: file_id.to_string(),
            status: DeleteStatus::Accepted,
            size,
            error: String::new(),
        }
    }

    fn failed(file_id: &str, status: DeleteStatus, error: impl Into<String>) -> Self {
        Self {
            file_id: file_id.to_string(),
            status,
            size: 0,
            error: error.into(),
        }
    }
}

/// Batch delete handler over any volume store
pub struct BatchDeleter<'a, S: VolumeStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: VolumeStore + ?Sized> BatchDeleter<'a, S> {
    pub const fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Delete every file id in order, stopping at the first cookie mismatch
    pub fn delete<T: AsRef<str>>(&self, file_ids: &[T]) -> Vec<DeleteResult> {
        let mut results = Vec::with_capacity(file_ids.len());

        for raw in file_ids {
            let raw = raw.as_ref();

            let fid = match raw.parse::<FileId>() {
                Ok(fid) => fid,
                Err(e) => {
                    results.push(DeleteResult::failed(raw, DeleteStatus::BadRequest, e.to_string()));
                    continue;
                }
            };

            let needle = match self.store.read_needle(fid.volume_id, fid.key) {
                Ok(needle) => needle,
                Err(e) => {
                    results.push(DeleteResult::failed(raw, DeleteStatus::NotFound, e.to_string()));
                    continue;
                }
            };

            if needle.is_chunk_manifest() {
                results.push(DeleteResult::failed(
                    raw,
                    DeleteStatus::NotAcceptable,
                    CHUNK_MANIFEST_ERROR,
                ));
                continue;
            }

            if needle.cookie != fid.cookie {
                warn!("Batch delete of {} stopped: cookie mismatch", raw);
                results.push(DeleteResult::failed(
                    raw,
                    DeleteStatus::BadRequest,
                    COOKIE_MISMATCH_ERROR,
                ));
                break;
            }

            match self.store.delete_needle(fid.volume_id, fid.key) {
                Ok(size) => results.push(DeleteResult::accepted(raw, size)),
                Err(e) => results.push(DeleteResult::failed(
                    raw,
                    DeleteStatus::InternalError,
                    e.to_string(),
                )),
            }
        }

        debug!(
            "Batch delete: {} ids requested, {} results",
            file_ids.len(),
            results.len()
        );
        results
    }
}
