//! Storage of payment evidence (slip images).
//!
//! The settlement core only needs two things from a blob store: put some bytes
//! under a path and get back a URL, and delete a URL later. Deletions are
//! always best-effort outside of bill creation, so their outcome is collected in
//! a [`CleanupManifest`] instead of failing the operation.

use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::types::{BillId, ItemId, UserId, WorkspaceId};

mod local;

pub use local::LocalEvidenceStore;

const DEFAULT_EXTENSION: &str = ".jpg";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub content_type: String,
    pub uploaded_by: UserId,
    pub uploaded_at: DateTime<Utc>,
}

impl EvidenceMetadata {
    /// Metadata for an upload, guessing the content type from the original file name.
    pub fn new(file_name: &str, uploaded_by: UserId, uploaded_at: DateTime<Utc>) -> Self {
        let content_type = match extension(file_name).as_str() {
            ".png" => "image/png",
            ".gif" => "image/gif",
            ".webp" => "image/webp",
            ".pdf" => "application/pdf",
            _ => "image/jpeg",
        };
        EvidenceMetadata {
            content_type: content_type.to_string(),
            uploaded_by,
            uploaded_at,
        }
    }
}

pub trait EvidenceStore {
    /// Store `bytes` under `path` and return the URL of the stored file.
    fn store(
        &self,
        bytes: &[u8],
        path: &str,
        metadata: &EvidenceMetadata,
    ) -> Result<String, StorageError>;

    /// Delete the file behind `url`. Returns `false` if the store does not know it.
    fn delete(&self, url: &str) -> Result<bool, StorageError>;
}

/// What an evidence file is uploaded for; decides where it is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvidenceKind {
    /// The creator's own slip, attached when the bill is created.
    BillCreate {
        workspace: WorkspaceId,
        user: UserId,
    },
    /// A participant's payment for one item, and one round for round bills.
    PaymentSubmit {
        bill: BillId,
        item: ItemId,
        user: UserId,
        round: Option<u32>,
    },
}

/// Build the storage path of an evidence file.
///
/// The timestamp keeps successive uploads of the same share apart; the
/// extension is taken from the original file name.
pub fn evidence_path(kind: EvidenceKind, file_name: &str, now: DateTime<Utc>) -> String {
    let ts = now.timestamp_millis();
    let ext = extension(file_name);
    match kind {
        EvidenceKind::BillCreate { workspace, user } => {
            format!("bills/{workspace}/main/{user}/{ts}{ext}")
        }
        EvidenceKind::PaymentSubmit {
            bill,
            item,
            user,
            round: Some(round),
        } => format!("bills/{bill}/payments/{user}/{item}/round-{round}/{ts}{ext}"),
        EvidenceKind::PaymentSubmit {
            bill,
            item,
            user,
            round: None,
        } => format!("bills/{bill}/payments/{user}/{item}/{ts}{ext}"),
    }
}

fn extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// The outcome of deleting a set of evidence files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupManifest {
    pub deleted: Vec<String>,
    pub failed: Vec<CleanupFailure>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub url: String,
    pub reason: String,
}

impl CleanupManifest {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete every URL, collecting failures instead of stopping at the first one.
///
/// A URL the store does not know about counts as a failure: the file it
/// pointed to is not accounted for.
pub fn delete_all<E: EvidenceStore + ?Sized>(store: &E, urls: &[String]) -> CleanupManifest {
    let mut manifest = CleanupManifest::default();

    for url in urls {
        match store.delete(url) {
            Ok(true) => {
                debug!("Deleted evidence {url}");
                manifest.deleted.push(url.clone());
            }
            Ok(false) => {
                warn!("Evidence {url} was not found in the store");
                manifest.failed.push(CleanupFailure {
                    url: url.clone(),
                    reason: "not found".to_string(),
                });
            }
            Err(e) => {
                warn!("Cannot delete evidence {url}: {e}");
                manifest.failed.push(CleanupFailure {
                    url: url.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    manifest
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryEvidenceStore;
    use super::*;
    use crate::types::fixtures::date;

    #[test]
    fn test_evidence_path() {
        let now = date(2);
        let ts = now.timestamp_millis();

        let path = evidence_path(
            EvidenceKind::BillCreate {
                workspace: 5,
                user: 1,
            },
            "receipt.PNG",
            now,
        );
        assert_eq!(path, format!("bills/5/main/1/{ts}.png"));

        let path = evidence_path(
            EvidenceKind::PaymentSubmit {
                bill: 10,
                item: 20,
                user: 2,
                round: None,
            },
            "slip",
            now,
        );
        assert_eq!(path, format!("bills/10/payments/2/20/{ts}.jpg"));

        let path = evidence_path(
            EvidenceKind::PaymentSubmit {
                bill: 10,
                item: 20,
                user: 2,
                round: Some(3),
            },
            "slip.jpeg",
            now,
        );
        assert_eq!(path, format!("bills/10/payments/2/20/round-3/{ts}.jpeg"));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(EvidenceMetadata::new("a.png", 1, date(1)).content_type, "image/png");
        assert_eq!(EvidenceMetadata::new("a", 1, date(1)).content_type, "image/jpeg");
    }

    #[test]
    fn test_delete_all_collects_failures() {
        let store = MemoryEvidenceStore::default();
        let metadata = EvidenceMetadata::new("a.jpg", 1, date(1));
        let urls: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|p| store.store(b"img", p, &metadata).unwrap())
            .collect();
        store.fail_delete_of(&urls[1]);

        let mut all = urls.clone();
        all.push("mem://missing".to_string());
        let manifest = delete_all(&store, &all);

        assert_eq!(manifest.deleted, vec![urls[0].clone(), urls[2].clone()]);
        let failed: Vec<_> = manifest.failed.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(failed, vec![urls[1].as_str(), "mem://missing"]);
        assert!(!manifest.is_complete());
        assert!(store.contains(&urls[1]));
    }
}
