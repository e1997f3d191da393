//! Filesystem-backed content-address store client.
//!
//! Resolves payload refs as file names under a configured directory.
//! This is the local/development plugin; production deployments swap in
//! a client for their distributed content store through the same
//! [`ContentStore`] trait.

use std::path::PathBuf;

use ledgermesh_core::contentstore::{ContentStore, ContentStoreError};
use ledgermesh_core::BoxFuture;

/// Content store reading payloads from a local directory.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContentStore for LocalContentStore {
    fn name(&self) -> &str {
        "localstore"
    }

    fn retrieve_data<'a>(
        &'a self,
        payload_ref: &'a str,
    ) -> BoxFuture<'a, Result<Vec<u8>, ContentStoreError>> {
        Box::pin(async move {
            // Refs are opaque tokens, never paths.
            if payload_ref.is_empty()
                || payload_ref.contains(['/', '\\'])
                || payload_ref.contains("..")
            {
                return Err(ContentStoreError::NotFound {
                    payload_ref: payload_ref.to_string(),
                });
            }
            let path = self.root.join(payload_ref);
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ContentStoreError::NotFound {
                        payload_ref: payload_ref.to_string(),
                    })
                }
                Err(e) => Err(ContentStoreError::Unavailable {
                    reason: e.to_string(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_payloads_by_ref() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ref1"), b"payload").unwrap();
        let store = LocalContentStore::new(dir.path());
        assert_eq!(store.retrieve_data("ref1").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn missing_ref_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path());
        assert!(matches!(
            store.retrieve_data("missing").await,
            Err(ContentStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn path_shaped_refs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalContentStore::new(dir.path());
        assert!(store.retrieve_data("../etc/passwd").await.is_err());
        assert!(store.retrieve_data("a/b").await.is_err());
    }
}
