//! On-disk record format.
//!
//! - `<bucket>/<work_id>.json`: pretty JSON, one record per file
//! - `archive/<work_id>.json.gz`: the same JSON, gzip compressed
//! - `claims/<work_id>/<worker_id>.json`: claim intents

use std::io::{Read, Write};
use std::path::PathBuf;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::domain::{Bucket, ClaimIntent, StoreError, WorkId, WorkOrder, WorkerId};

pub const CLAIMS_DIR: &str = "claims";

const JSON_EXT: &str = ".json";
const GZ_EXT: &str = ".json.gz";

fn extension(bucket: Bucket) -> &'static str {
    if bucket.is_compressed() { GZ_EXT } else { JSON_EXT }
}

/// Repository-relative path of a record.
pub fn record_path(bucket: Bucket, work_id: &WorkId) -> PathBuf {
    PathBuf::from(bucket.dir_name()).join(format!("{}{}", work_id, extension(bucket)))
}

/// Repository-relative path of a claim intent.
pub fn intent_path(work_id: &WorkId, worker_id: &WorkerId) -> PathBuf {
    PathBuf::from(CLAIMS_DIR)
        .join(work_id.as_str())
        .join(format!("{worker_id}{JSON_EXT}"))
}

/// Recover the work id from a file name inside `bucket`.
///
/// Returns `None` for anything that is not one of our records.
pub fn work_id_from_file_name(bucket: Bucket, file_name: &str) -> Option<WorkId> {
    let stem = file_name.strip_suffix(extension(bucket))?;
    WorkId::parse(stem).ok()
}

pub fn encode_order(bucket: Bucket, order: &WorkOrder) -> Result<Vec<u8>, StoreError> {
    let path = record_path(bucket, &order.work_id);
    let mut json = serde_json::to_vec_pretty(order).map_err(|source| StoreError::Codec {
        path: path.display().to_string(),
        source,
    })?;
    json.push(b'\n');
    if !bucket.is_compressed() {
        return Ok(json);
    }
    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&json)
        .and_then(|_| gz.finish())
        .map_err(|e| StoreError::io(path, e))
}

pub fn decode_order(bucket: Bucket, work_id: &WorkId, bytes: &[u8]) -> Result<WorkOrder, StoreError> {
    let path = record_path(bucket, work_id);
    let json = if bucket.is_compressed() {
        let mut out = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| StoreError::io(&path, e))?;
        out
    } else {
        bytes.to_vec()
    };
    serde_json::from_slice(&json).map_err(|source| StoreError::Codec {
        path: path.display().to_string(),
        source,
    })
}

pub fn encode_intent(intent: &ClaimIntent) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(intent).map_err(|source| StoreError::Codec {
        path: intent_path(&intent.work_id, &intent.worker_id)
            .display()
            .to_string(),
        source,
    })
}

pub fn decode_intent(path: &str, bytes: &[u8]) -> Result<ClaimIntent, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Codec {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::work_order::tests::{at, order};

    #[test]
    fn paths_follow_bucket_layout() {
        let id = WorkId::parse("wo-1").unwrap();
        let worker = WorkerId::parse("host_1_0000abcd").unwrap();
        assert_eq!(record_path(Bucket::Retry, &id), PathBuf::from("retry/wo-1.json"));
        assert_eq!(
            record_path(Bucket::Archive, &id),
            PathBuf::from("archive/wo-1.json.gz")
        );
        assert_eq!(
            intent_path(&id, &worker),
            PathBuf::from("claims/wo-1/host_1_0000abcd.json")
        );
    }

    #[test]
    fn file_names_map_back_to_ids() {
        assert_eq!(
            work_id_from_file_name(Bucket::Available, "wo-1.json").map(|id| id.to_string()),
            Some("wo-1".to_string())
        );
        assert!(work_id_from_file_name(Bucket::Available, "README.md").is_none());
        assert!(work_id_from_file_name(Bucket::Archive, "wo-1.json").is_none());
    }

    #[test]
    fn archived_records_are_gzip() {
        let mut o = order("W1");
        o.claim(WorkerId::parse("a").unwrap(), at(1)).unwrap();
        o.complete(serde_json::json!({"ok": true}), at(2)).unwrap();
        o.archive(at(3)).unwrap();

        let bytes = encode_order(Bucket::Archive, &o).unwrap();
        // gzip magic
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
        assert_eq!(decode_order(Bucket::Archive, &o.work_id, &bytes).unwrap(), o);
    }

    #[test]
    fn corrupt_json_is_a_codec_error() {
        let id = WorkId::parse("W1").unwrap();
        let err = decode_order(Bucket::Available, &id, b"{not json").unwrap_err();
        assert!(matches!(err, StoreError::Codec { ref path, .. } if path == "available/W1.json"));
    }
}
