// Snapshot format: a self-describing, content-hashed serialization of the
// full state-machine state plus `lastAppliedIndex`.
// `create_snapshot`/`restore_from_snapshot` use `encode`/`decode` below;
// `write_to_file`/`read_from_file` give any on-disk caller the same
// write-to-temp + atomic rename discipline as the persistent store.

use super::domain::{Project, Repository};
use crate::error::{ClusterError, Result};
use crate::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    projects: BTreeMap<String, Project>,
    repositories: BTreeMap<String, Repository>,
    last_applied_index: LogIndex,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    body: Vec<u8>,
    checksum: u32,
}

pub fn encode(
    projects: &BTreeMap<String, Project>,
    repositories: &BTreeMap<String, Repository>,
    last_applied_index: LogIndex,
) -> Result<Vec<u8>> {
    let body = SnapshotBody {
        projects: projects.clone(),
        repositories: repositories.clone(),
        last_applied_index,
    };
    let encoded = bincode::serde::encode_to_vec(&body, bincode::config::standard())?;
    let checksum = crate::storage::checksum::checksum(&encoded);
    let framed = SnapshotFile {
        body: encoded,
        checksum,
    };
    Ok(bincode::serde::encode_to_vec(&framed, bincode::config::standard())?)
}

#[allow(clippy::type_complexity)]
pub fn decode(
    blob: &[u8],
) -> Result<(
    BTreeMap<String, Project>,
    BTreeMap<String, Repository>,
    LogIndex,
)> {
    let (framed, _): (SnapshotFile, usize) =
        bincode::serde::decode_from_slice(blob, bincode::config::standard())?;
    if crate::storage::checksum::checksum(&framed.body) != framed.checksum {
        return Err(ClusterError::Storage(
            "snapshot checksum mismatch".into(),
        ));
    }
    let (body, _): (SnapshotBody, usize) =
        bincode::serde::decode_from_slice(&framed.body, bincode::config::standard())?;
    Ok((body.projects, body.repositories, body.last_applied_index))
}

pub async fn write_to_file(path: impl AsRef<Path>, blob: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, blob).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn read_from_file(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>> {
    match fs::read(path.as_ref()).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ClusterError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips() {
        let mut projects = BTreeMap::new();
        projects.insert(
            "p1".to_string(),
            Project {
                id: "p1".into(),
                name: "P".into(),
                description: "".into(),
                owner_id: "u1".into(),
                repository_id: "repo-p1".into(),
                created_at: 1,
                updated_at: 1,
            },
        );
        let blob = encode(&projects, &BTreeMap::new(), 5).unwrap();
        let (p, r, idx) = decode(&blob).unwrap();
        assert_eq!(p.len(), 1);
        assert!(r.is_empty());
        assert_eq!(idx, 5);
    }

    #[test]
    fn decode_rejects_corrupted_blob() {
        let blob = encode(&BTreeMap::new(), &BTreeMap::new(), 1).unwrap();
        let mut corrupted = blob;
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0xFF;
        assert!(decode(&corrupted).is_err());
    }

    #[tokio::test]
    async fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let blob = encode(&BTreeMap::new(), &BTreeMap::new(), 3).unwrap();
        write_to_file(&path, &blob).await.unwrap();
        let back = read_from_file(&path).await.unwrap().unwrap();
        let (_, _, idx) = decode(&back).unwrap();
        assert_eq!(idx, 3);
    }
}
