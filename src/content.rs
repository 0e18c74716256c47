//! Read-only access to announcement content
//!
//! Announcements whose content does not fit inline carry only its Merkle root;
//! the content itself lives in `<dir>/<hex(content_hash)>`.

use crate::merkle;
use crate::{Error, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load the content committed to by `content_hash`
    ///
    /// Missing content and content whose length or root does not match the
    /// announcement are policy violations.
    pub async fn load(&self, content_hash: &[u8; 32], content_length: u32) -> Result<Vec<u8>> {
        let name = hex::encode(content_hash);
        let data = match tokio::fs::read(self.dir.join(&name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::policy(format!("announcement content {} not found", name)));
            }
            Err(e) => return Err(e.into()),
        };
        if data.len() != content_length as usize {
            return Err(Error::policy(format!(
                "announcement content {} is {} bytes, announcement says {}",
                name,
                data.len(),
                content_length
            )));
        }
        if merkle::content_root(&data) != *content_hash {
            return Err(Error::policy(format!(
                "announcement content {} does not match its hash",
                name
            )));
        }
        debug!(hash = %name, len = data.len(), "loaded announcement content");
        Ok(data)
    }
}
