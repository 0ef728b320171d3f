//! Durable audio storage with stable public URLs.
//!
//! Files land under `<root>/<category>/` with a generated name; the public
//! URL mirrors the same layout so a static-file layer can serve them
//! directly.

use crate::error::SpeechResult;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAudio {
    pub path: PathBuf,
    pub url: String,
}

#[derive(Clone)]
pub struct AudioStore {
    root: PathBuf,
    public_base: String,
}

impl AudioStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// Write `bytes` under `category` and return its path and public URL.
    pub async fn save(
        &self,
        category: &str,
        ext: &str,
        bytes: &[u8],
    ) -> SpeechResult<StoredAudio> {
        let name = format!("{}.{}", Uuid::new_v4(), ext);
        let dir = self.root.join(category);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&name);
        tokio::fs::write(&path, bytes).await?;
        Ok(StoredAudio {
            url: format!("{}/static/{category}/{name}", self.public_base),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_writes_file_and_builds_url() {
        let dir = tempfile::tempdir().unwrap();
        let store = AudioStore::new(dir.path(), "http://h:8000/");
        let stored = store.save("tts", "wav", b"RIFF").await.unwrap();
        assert_eq!(tokio::fs::read(&stored.path).await.unwrap(), b"RIFF");
        assert!(stored.url.starts_with("http://h:8000/static/tts/"));
        assert!(stored.url.ends_with(".wav"));
    }
}
