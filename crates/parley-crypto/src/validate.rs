//! Checks against untrusted identities
//!
//! `PubKeyValidator` imports a candidate key into an ephemeral keyring and
//! accepts it only if exactly one fingerprint results. `DetachedSigCheck`
//! builds on it to verify a `{sig, data}` pair against that key. Neither
//! ever touches the caller's primary keyring.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::agent::{CryptoAgent, KeyInfo, VerifyResult};
use crate::keyring::EphemeralKeyring;
use crate::Result;

/// A detached signature and the exact text it covers.
///
/// Exactly these two keys; anything else is a structural error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigDict {
    pub sig: String,
    pub data: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SigDictError {
    #[error("signed envelope is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl SigDict {
    pub fn new(sig: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            sig: sig.into(),
            data: data.into(),
        }
    }

    pub fn parse(text: &str) -> std::result::Result<Self, SigDictError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> std::result::Result<String, SigDictError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Verify `sig_dict.sig` over the exact bytes of `sig_dict.data` with
/// whatever keys `agent` is bound to. The engine reads detached
/// signatures from a file, so the signature goes through a temp file.
pub fn verify_sig_dict<A: CryptoAgent>(agent: &A, sig_dict: &SigDict) -> Result<VerifyResult> {
    let mut sig_file = tempfile::NamedTempFile::new()?;
    sig_file.write_all(sig_dict.sig.as_bytes())?;
    sig_file.flush()?;
    let verify = agent.verify_detached(sig_file.path(), sig_dict.data.as_bytes())?;
    sig_file.close()?;
    Ok(verify)
}

/// Imports one candidate public key into a fresh ephemeral keyring.
pub struct PubKeyValidator<A: CryptoAgent> {
    keyring: EphemeralKeyring<A>,
    valid: bool,
    error: Option<String>,
    key: Option<KeyInfo>,
}

impl<A: CryptoAgent> PubKeyValidator<A> {
    /// Run the import. `Err` only when the engine itself can't be driven.
    pub fn run(template: &A, candidate: &str) -> Result<Self> {
        let keyring = EphemeralKeyring::new(template)?;
        let mut validator = Self {
            keyring,
            valid: false,
            error: None,
            key: None,
        };

        let imported = validator.keyring.agent().import_keys(candidate)?;
        if imported.count() != 1 {
            validator.error = Some(format!(
                "expected exactly one public key, found {}",
                imported.count()
            ));
            tracing::debug!(count = imported.count(), "public key rejected");
            return Ok(validator);
        }

        let fingerprint = &imported.fingerprints[0];
        let key = validator
            .keyring
            .agent()
            .list_keys(false)?
            .into_iter()
            .find(|k| &k.fingerprint == fingerprint);
        match key {
            Some(key) => {
                validator.valid = true;
                validator.key = Some(key);
            }
            None => {
                validator.error = Some(format!("imported key {} not listed", fingerprint));
            }
        }
        Ok(validator)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn key(&self) -> Option<&KeyInfo> {
        self.key.as_ref()
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.key.as_ref().map(|k| k.fingerprint.as_str())
    }

    /// Agent bound to the ephemeral keyring holding the candidate key.
    pub fn agent(&self) -> &A {
        self.keyring.agent()
    }

    pub fn close(&mut self) -> Result<()> {
        self.keyring.close()
    }
}

/// Verifies a `{sig, data}` pair against an untrusted public key.
#[derive(Debug)]
pub struct DetachedSigCheck {
    valid: bool,
    error: Option<String>,
    key: Option<KeyInfo>,
    sig_dict: Option<SigDict>,
    verify: Option<VerifyResult>,
}

impl DetachedSigCheck {
    /// Run all three stages against an encoded sig dict.
    pub fn run<A: CryptoAgent>(template: &A, candidate: &str, encoded: &str) -> Result<Self> {
        Self::stages(template, candidate, || {
            SigDict::parse(encoded).map_err(|e| e.to_string())
        })
    }

    /// Run against an already-parsed sig dict; the structural stage is
    /// guaranteed by the type.
    pub fn check<A: CryptoAgent>(template: &A, candidate: &str, sig_dict: &SigDict) -> Result<Self> {
        Self::stages(template, candidate, || Ok(sig_dict.clone()))
    }

    fn stages<A, F>(template: &A, candidate: &str, structural: F) -> Result<Self>
    where
        A: CryptoAgent,
        F: FnOnce() -> std::result::Result<SigDict, String>,
    {
        let mut check = Self {
            valid: false,
            error: None,
            key: None,
            sig_dict: None,
            verify: None,
        };

        // 1. The claimed key must import as exactly one key.
        let mut pubkey = PubKeyValidator::run(template, candidate)?;
        if !pubkey.is_valid() {
            check.error = Some(format!(
                "public key invalid: {}",
                pubkey.error().unwrap_or("unknown error")
            ));
            return Ok(check);
        }
        check.key = pubkey.key().cloned();

        // 2. Exactly {sig, data}.
        let sig_dict = match structural() {
            Ok(sig_dict) => sig_dict,
            Err(e) => {
                check.error = Some(e);
                return Ok(check);
            }
        };

        // 3. Detached verify inside the ephemeral ring.
        let verify = verify_sig_dict(pubkey.agent(), &sig_dict)?;
        if let Err(e) = pubkey.close() {
            tracing::warn!(error = %e, "failed to remove ephemeral keyring");
        }

        if !verify.valid {
            check.error = Some(format!("signature check failed: {}", verify.status));
        } else if verify.fingerprint.as_deref() != pubkey.fingerprint() {
            check.error = Some("signature was made by a different key".to_string());
        } else {
            check.valid = true;
        }
        check.sig_dict = Some(sig_dict);
        check.verify = Some(verify);
        Ok(check)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn key(&self) -> Option<&KeyInfo> {
        self.key.as_ref()
    }

    pub fn sig_dict(&self) -> Option<&SigDict> {
        self.sig_dict.as_ref()
    }

    pub fn verify_result(&self) -> Option<&VerifyResult> {
        self.verify.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{gpg_available, GpgAgent, DEFAULT_GPG_BINARY};
    use crate::passphrase::SessionPassphrase;
    use tempfile::TempDir;

    #[test]
    fn test_sigdict_rejects_extra_keys() {
        let err = SigDict::parse(r#"{"sig":"s","data":"d","extra":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_sigdict_rejects_missing_keys() {
        assert!(SigDict::parse(r#"{"sig":"s"}"#).is_err());
        assert!(SigDict::parse(r#"{"data":"d"}"#).is_err());
        assert!(SigDict::parse("not json").is_err());
    }

    #[test]
    fn test_sigdict_keeps_data_bytes() {
        let original = SigDict::new("sig", "{\"b\": 1, \"a\": 2}");
        let parsed = SigDict::parse(&original.encode().unwrap()).unwrap();
        assert_eq!(parsed.data, "{\"b\": 1, \"a\": 2}");
    }

    fn signer() -> Option<(TempDir, GpgAgent, SessionPassphrase, String)> {
        if !gpg_available(DEFAULT_GPG_BINARY) {
            eprintln!("skipping test: gpg not available");
            return None;
        }
        let dir = TempDir::new().unwrap();
        let agent = GpgAgent::new(dir.path().join("ring"));
        agent.prepare_home().unwrap();
        let pass = SessionPassphrase::new("carolpass").unwrap();
        let fpr = agent
            .gen_key("Carol", "carol@parley.test", Some(&pass))
            .expect("key generation failed");
        let pubkey = agent.export_keys(&[&fpr], false, None).unwrap();
        Some((dir, agent, pass, pubkey))
    }

    #[test]
    fn test_malformed_key_leaves_primary_untouched() {
        let Some((_dir, agent, _pass, _pubkey)) = signer() else { return };
        let before = agent.list_keys(false).unwrap().len();

        let validator = PubKeyValidator::run(&agent, "-----BEGIN PGP PUBLIC KEY BLOCK-----\ngarbage").unwrap();
        assert!(!validator.is_valid());
        assert!(validator.error().is_some());

        assert_eq!(agent.list_keys(false).unwrap().len(), before);
    }

    #[test]
    fn test_valid_key_exposes_metadata() {
        let Some((_dir, agent, _pass, pubkey)) = signer() else { return };
        let validator = PubKeyValidator::run(&agent, &pubkey).unwrap();
        assert!(validator.is_valid(), "{:?}", validator.error());
        let key = validator.key().unwrap();
        assert_eq!(key.username(), Some("Carol <carol@parley.test>"));
        assert!(key.expires.is_none());
    }

    #[test]
    fn test_detached_check_accepts_and_rejects() {
        let Some((_dir, agent, pass, pubkey)) = signer() else { return };
        let data = r#"{"nonce":"abc"}"#;
        let signed = agent.sign(data, None, &pass, true).unwrap();
        assert!(signed.fingerprint.is_some());

        let good = SigDict::new(signed.data.clone(), data);
        let check = DetachedSigCheck::check(&agent, &pubkey, &good).unwrap();
        assert!(check.is_valid(), "{:?}", check.error());

        let forged = SigDict::new(signed.data, r#"{"nonce":"abd"}"#);
        let check = DetachedSigCheck::check(&agent, &pubkey, &forged).unwrap();
        assert!(!check.is_valid());
        assert!(check.error().unwrap().contains("signature check failed"));
    }

    #[test]
    fn test_detached_check_structural_stage() {
        let Some((_dir, agent, _pass, pubkey)) = signer() else { return };
        let check = DetachedSigCheck::run(&agent, &pubkey, r#"{"sig":"x"}"#).unwrap();
        assert!(!check.is_valid());
        assert!(check.error().unwrap().contains("malformed"));
    }

    /// Engine stand-in that accepts any one key and signature, and removes
    /// its own keyring on shutdown so the later directory cleanup fails.
    #[derive(Clone)]
    struct VanishingRing {
        dir: std::path::PathBuf,
    }

    const STUB_FPR: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    impl CryptoAgent for VanishingRing {
        fn keyring_dir(&self) -> &std::path::Path {
            &self.dir
        }

        fn rebind(&mut self, dir: std::path::PathBuf) {
            self.dir = dir;
        }

        fn shutdown(&self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }

        fn encrypt(&self, _: &str, _: &[&str]) -> Result<crate::EncryptResult> {
            unreachable!()
        }

        fn decrypt(&self, _: &str, _: &SessionPassphrase) -> Result<crate::DecryptResult> {
            unreachable!()
        }

        fn sign(
            &self,
            _: &str,
            _: Option<&str>,
            _: &SessionPassphrase,
            _: bool,
        ) -> Result<crate::SignResult> {
            unreachable!()
        }

        fn verify(&self, _: &str) -> Result<VerifyResult> {
            unreachable!()
        }

        fn verify_detached(&self, _: &std::path::Path, _: &[u8]) -> Result<VerifyResult> {
            Ok(VerifyResult {
                valid: true,
                fingerprint: Some(STUB_FPR.to_string()),
                ..VerifyResult::default()
            })
        }

        fn import_keys(&self, _: &str) -> Result<crate::ImportResult> {
            Ok(crate::ImportResult {
                fingerprints: vec![STUB_FPR.to_string()],
                stderr: String::new(),
            })
        }

        fn export_keys(
            &self,
            _: &[&str],
            _: bool,
            _: Option<&SessionPassphrase>,
        ) -> Result<String> {
            unreachable!()
        }

        fn list_keys(&self, _: bool) -> Result<Vec<KeyInfo>> {
            Ok(vec![KeyInfo {
                fingerprint: STUB_FPR.to_string(),
                key_id: STUB_FPR[24..].to_string(),
                algorithm: "22".to_string(),
                length: 255,
                created: "0".to_string(),
                expires: None,
                validity: "-".to_string(),
                uids: vec!["Dana <dana@parley.test>".to_string()],
                secret: false,
            }])
        }

        fn delete_keys(&self, _: &[&str], _: bool) -> Result<bool> {
            unreachable!()
        }

        fn gen_key(&self, _: &str, _: &str, _: Option<&SessionPassphrase>) -> Result<String> {
            unreachable!()
        }
    }

    #[test]
    fn test_cleanup_failure_keeps_verdict() {
        let template = VanishingRing {
            dir: std::path::PathBuf::from("/unused"),
        };
        let sig_dict = SigDict::new("sig", "data");
        let check = DetachedSigCheck::check(&template, "key", &sig_dict).unwrap();
        assert!(check.is_valid(), "{:?}", check.error());
        assert_eq!(check.key().unwrap().fingerprint, STUB_FPR);
    }
}
