//! Artifact blob storage.
//!
//! The only contract the core requires of an artifact store is {put, read,
//! enumerate}; this is a local filesystem tree rooted at
//! `<data_dir>/artifacts/<tenant>/<test>/<run>/<name>`. Artifacts are
//! content-final on write and never mutated, matching the invariant in
//! the data model.

use std::path::{Path, PathBuf};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("io error writing artifact: {0}")]
    Io(#[from] std::io::Error),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, tenant_id: Uuid, test_id: Uuid, run_id: Uuid) -> PathBuf {
        self.root
            .join(tenant_id.to_string())
            .join(test_id.to_string())
            .join(run_id.to_string())
    }

    /// Returns the directory a sandbox child should be handed as
    /// `--artifacts-dir`, creating it if necessary.
    pub async fn prepare_run_dir(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        run_id: Uuid,
    ) -> ArtifactResult<PathBuf> {
        let dir = self.run_dir(tenant_id, test_id, run_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Writes `contents` as `name` inside the run directory, creating parent
    /// directories as needed. Used for `run.log` when the sandbox child
    /// itself didn't write artifacts directly into `artifacts_dir`.
    pub async fn put(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        run_id: Uuid,
        name: &str,
        contents: &[u8],
    ) -> ArtifactResult<()> {
        let dir = self.prepare_run_dir(tenant_id, test_id, run_id).await?;
        tokio::fs::write(dir.join(name), contents).await?;
        Ok(())
    }

    pub async fn read(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        run_id: Uuid,
        name: &str,
    ) -> ArtifactResult<Option<Vec<u8>>> {
        let path = self.run_dir(tenant_id, test_id, run_id).join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists artifact file names actually present in a run's directory.
    /// Used to reconcile the `artifacts` field on [`crate::model::Run`]
    /// against what the sandbox child actually produced (best-effort; a
    /// missing file is not itself an error, per the data model).
    pub async fn enumerate(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        run_id: Uuid,
    ) -> ArtifactResult<Vec<String>> {
        let dir = self.run_dir(tenant_id, test_id, run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Removes run directories whose path's run id is not in `keep_run_ids`.
    /// Used by the retention sweep once run metadata has been pruned past
    /// `artifact_retention_days` (which is typically shorter than
    /// `run_retention_days`, so artifacts disappear before their run row does).
    pub async fn prune_run_dir(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        run_id: Uuid,
    ) -> ArtifactResult<()> {
        let dir = self.run_dir(tenant_id, test_id, run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes an uploaded test source file under `sources/<tenant>/<test>/`,
    /// returning a blob ref relative to the store root for [`crate::model::Test::source_blob_ref`].
    pub async fn write_source(
        &self,
        tenant_id: Uuid,
        test_id: Uuid,
        extension: &str,
        contents: &[u8],
    ) -> ArtifactResult<String> {
        let rel = format!("sources/{tenant_id}/{test_id}/source.{extension}");
        let path = self.root.join(&rel);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents).await?;
        Ok(rel)
    }

    /// Resolves a `source_blob_ref` to an absolute path for the Runner Pool
    /// to hand to a sandbox child.
    pub fn source_path(&self, blob_ref: &str) -> PathBuf {
        self.root.join(blob_ref)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_read_enumerate_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (tenant, test, run) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        store.put(tenant, test, run, "run.log", b"hello").await.unwrap();
        let read_back = store.read(tenant, test, run, "run.log").await.unwrap();
        assert_eq!(read_back, Some(b"hello".to_vec()));

        let names = store.enumerate(tenant, test, run).await.unwrap();
        assert_eq!(names, vec!["run.log".to_string()]);

        let missing = store.read(tenant, test, run, "failure.png").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn write_source_round_trips_through_source_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let (tenant, test) = (Uuid::new_v4(), Uuid::new_v4());

        let blob_ref = store.write_source(tenant, test, "py", b"print('hi')").await.unwrap();
        let contents = tokio::fs::read(store.source_path(&blob_ref)).await.unwrap();
        assert_eq!(contents, b"print('hi')");
    }

    #[tokio::test]
    async fn enumerate_on_missing_dir_returns_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let names = store
            .enumerate(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(names.is_empty());
    }
}
