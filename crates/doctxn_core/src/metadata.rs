//! Staging metadata carried in a document's extended attributes.
//!
//! Metadata lives under the [`TXN_XATTR_KEY`] key of the xattr object so that
//! other attributes on the document survive staging and unstaging.

use crate::atr::AtrRef;
use crate::staged::OperationType;
use crate::types::{AttemptId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Xattr key holding transaction metadata.
pub const TXN_XATTR_KEY: &str = "txn";

/// Errors decoding or encoding staging metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The metadata is not valid JSON for [`TransactionMetadata`].
    #[error("invalid transaction metadata: {0}")]
    Json(#[from] serde_json::Error),

    /// The document's xattrs are present but not a JSON object.
    #[error("xattrs are not an object")]
    NotAnObject,
}

/// Metadata marking a document as staged by an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
    /// Staging transaction.
    pub txn_id: TransactionId,
    /// Staging attempt.
    pub attempt_id: AttemptId,
    /// Staged operation.
    pub operation_type: OperationType,
    /// ATR holding the attempt's entry.
    pub atr_ref: AtrRef,
    /// Content the document will have after commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_content: Option<Value>,
}

impl TransactionMetadata {
    /// Extracts metadata from a document's xattrs.
    ///
    /// Returns `Ok(None)` when the document is not staged and `Err` with a
    /// reason when the metadata is present but undecodable.
    pub fn from_xattrs(xattrs: Option<&Value>) -> Result<Option<Self>, MetadataError> {
        let Some(raw) = xattrs.and_then(|x| x.get(TXN_XATTR_KEY)) else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(raw.clone())?))
    }

    /// Merges this metadata into an existing xattr object.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::NotAnObject`] if `existing` holds anything
    /// other than a JSON object.
    pub fn into_xattrs(self, existing: Option<Value>) -> Result<Value, MetadataError> {
        let mut map = match existing {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(MetadataError::NotAnObject),
        };
        let encoded = serde_json::to_value(self)?;
        map.insert(TXN_XATTR_KEY.to_string(), encoded);
        Ok(Value::Object(map))
    }
}

/// Removes transaction metadata from an xattr object.
///
/// Returns `None` when nothing else remains.
pub(crate) fn strip(xattrs: Option<Value>) -> Option<Value> {
    match xattrs {
        Some(Value::Object(mut map)) => {
            map.remove(TXN_XATTR_KEY);
            if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            }
        }
        _ => None,
    }
}
