//! Ephemeral keyrings
//!
//! A throwaway keyring in its own private temp directory. Untrusted public
//! keys are imported here, never into the caller's primary keyring. The
//! directory is removed on `close()` or when the value is dropped, on every
//! exit path.

use std::path::Path;

use tempfile::TempDir;

use crate::agent::CryptoAgent;
use crate::Result;

const DIR_PREFIX: &str = "parley-keyring-";

pub struct EphemeralKeyring<A: CryptoAgent> {
    dir: Option<TempDir>,
    agent: A,
}

impl<A: CryptoAgent> EphemeralKeyring<A> {
    /// Create a fresh keyring, with an agent cloned from `template` and
    /// rebound to the new directory.
    pub fn new(template: &A) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
        let agent = template.rebound(dir.path().to_path_buf());
        agent.prepare_home()?;
        tracing::debug!(dir = %dir.path().display(), "ephemeral keyring opened");
        Ok(Self {
            dir: Some(dir),
            agent,
        })
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Stop engine daemons bound to the directory and remove it.
    /// Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            self.agent.shutdown();
            let path = dir.path().to_path_buf();
            dir.close()?;
            tracing::debug!(dir = %path.display(), "ephemeral keyring closed");
        }
        Ok(())
    }
}

impl<A: CryptoAgent> Drop for EphemeralKeyring<A> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to remove ephemeral keyring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::GpgAgent;

    #[test]
    fn test_close_is_idempotent() {
        let template = GpgAgent::new("/unused").with_binaries("/nonexistent/gpg", "/nonexistent/gpgconf");
        let mut ring = EphemeralKeyring::new(&template).unwrap();
        let path = ring.path().unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(ring.agent().keyring_dir(), path.as_path());

        ring.close().unwrap();
        assert!(!path.exists());
        assert!(ring.is_closed());
        ring.close().unwrap();
    }

    #[test]
    fn test_drop_removes_directory() {
        let template = GpgAgent::new("/unused").with_binaries("/nonexistent/gpg", "/nonexistent/gpgconf");
        let path = {
            let ring = EphemeralKeyring::new(&template).unwrap();
            ring.path().unwrap().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_template_is_untouched() {
        let template = GpgAgent::new("/primary");
        let ring = EphemeralKeyring::new(&template).unwrap();
        assert_eq!(template.keyring_dir(), Path::new("/primary"));
        assert_ne!(ring.agent().keyring_dir(), template.keyring_dir());
    }
}
