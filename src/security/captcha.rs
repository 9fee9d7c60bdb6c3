//! CAPTCHA images and the codes clients are expected to type.
//!
//! Images live in `captcha_dir` as `1.png..N.png`; `codes[i - 1]` is the
//! text shown in `i.png`. A client (`sha256(ip + User-Agent)`) keeps the
//! same image until its session falls out of the LRU.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use rand::Rng;
use sha2::{Digest, Sha256};

pub struct CaptchaBook {
    dir: PathBuf,
    codes: Vec<String>,
    /// session key -> image index (1-based)
    sessions: Mutex<LruCache<String, usize>>,
}

/// Session key for a client.
pub fn session_key(ip: &str, user_agent: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

impl CaptchaBook {
    pub fn new(dir: impl Into<PathBuf>, codes: Vec<String>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dir: dir.into(),
            codes,
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.codes.is_empty()
    }

    /// The code the session must enter, if it has been shown an image.
    pub fn expected_code(&self, key: &str) -> Option<String> {
        let index = *self.lock().get(key)?;
        self.codes.get(index - 1).cloned()
    }

    /// Image bytes for the session, assigning an image on first request.
    pub async fn image(&self, key: &str) -> std::io::Result<Bytes> {
        if self.codes.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no captcha codes configured",
            ));
        }

        let index = {
            let mut sessions = self.lock();
            match sessions.get(key) {
                Some(index) => *index,
                None => {
                    let index = rand::thread_rng().gen_range(1..=self.codes.len());
                    sessions.put(key.to_string(), index);
                    index
                }
            }
        };

        let path = self.dir.join(format!("{index}.png"));
        tokio::fs::read(&path).await.map(Bytes::from)
    }

    /// Forget the session once it solved the challenge.
    pub fn forget(&self, key: &str) {
        self.lock().pop(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, usize>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
