//! CryptoAgent - one capability interface over an OpenPGP engine
//!
//! `GpgAgent` drives the system `gpg` binary against a single keyring
//! directory (`--homedir`). Every call is synchronous: it spawns the
//! engine, feeds stdin, and blocks until the process exits. Run these
//! off any latency-sensitive thread.
//!
//! Engine-reported failures (bad passphrase, unknown recipient, bad
//! signature) come back as data on the result structs. `Err` is reserved
//! for plumbing failures such as a missing binary.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::passphrase::SessionPassphrase;
use crate::status::{parse_colon_listing, StatusLog};
use crate::{CryptoError, Result};

/// Default engine binary.
pub const DEFAULT_GPG_BINARY: &str = "gpg";
/// Default engine control binary, used to stop daemons bound to a homedir.
pub const DEFAULT_GPGCONF_BINARY: &str = "gpgconf";

/// Agent configuration written into every homedir we prepare. The session
/// passphrase is the only unlock path: no caching, loopback pinentry.
const AGENT_CONF: &str = "allow-loopback-pinentry\ndefault-cache-ttl 0\nmax-cache-ttl 0\n";

/// Outcome of an encrypt call.
#[derive(Debug, Clone)]
pub struct EncryptResult {
    pub ok: bool,
    /// ASCII-armored ciphertext (empty when `ok` is false).
    pub ciphertext: String,
    pub status: String,
    pub stderr: String,
}

/// Outcome of a decrypt call.
pub struct DecryptResult {
    pub ok: bool,
    pub plaintext: Zeroizing<String>,
    pub status: String,
    pub stderr: String,
}

impl std::fmt::Debug for DecryptResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptResult")
            .field("ok", &self.ok)
            .field("plaintext", &format_args!("[{} bytes]", self.plaintext.len()))
            .field("status", &self.status)
            .finish()
    }
}

/// Outcome of a sign call. `fingerprint == None` means signing failed.
#[derive(Debug, Clone)]
pub struct SignResult {
    pub fingerprint: Option<String>,
    /// Armored signature (detached) or signed message.
    pub data: String,
    pub stderr: String,
}

/// Outcome of a verify or detached-verify call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifyResult {
    pub valid: bool,
    /// Primary key fingerprint of the signer.
    pub fingerprint: Option<String>,
    pub username: Option<String>,
    pub key_id: Option<String>,
    pub status: String,
    #[serde(skip)]
    pub stderr: String,
}

/// Outcome of a key import.
#[derive(Debug, Clone, Default)]
pub struct ImportResult {
    /// Fingerprints of every key the engine reported importing, deduplicated.
    pub fingerprints: Vec<String>,
    pub stderr: String,
}

impl ImportResult {
    pub fn count(&self) -> usize {
        self.fingerprints.len()
    }
}

/// Metadata of one key in a keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub key_id: String,
    /// OpenPGP public key algorithm id (1 = RSA, 22 = EdDSA, ...).
    pub algorithm: String,
    pub length: u32,
    /// Creation time, seconds since the epoch.
    pub created: String,
    /// Expiry, seconds since the epoch; `None` when the key never expires.
    pub expires: Option<String>,
    pub validity: String,
    pub uids: Vec<String>,
    pub secret: bool,
}

impl KeyInfo {
    /// First user id, which is what peers display as the contact name.
    pub fn username(&self) -> Option<&str> {
        self.uids.first().map(String::as_str)
    }
}

/// Capability interface over an OpenPGP engine bound to one keyring.
pub trait CryptoAgent: Clone + Send + Sync {
    fn keyring_dir(&self) -> &Path;

    /// Repoint this agent at another keyring directory.
    fn rebind(&mut self, dir: PathBuf);

    /// A copy of this agent bound to `dir`.
    fn rebound(&self, dir: PathBuf) -> Self {
        let mut agent = self.clone();
        agent.rebind(dir);
        agent
    }

    /// Create the keyring directory with private permissions.
    fn prepare_home(&self) -> Result<()> {
        Ok(())
    }

    /// Best-effort stop of any engine daemon bound to the keyring.
    fn shutdown(&self) {}

    fn encrypt(&self, plaintext: &str, recipients: &[&str]) -> Result<EncryptResult>;

    fn decrypt(&self, ciphertext: &str, passphrase: &SessionPassphrase) -> Result<DecryptResult>;

    fn sign(
        &self,
        message: &str,
        key_id: Option<&str>,
        passphrase: &SessionPassphrase,
        detach: bool,
    ) -> Result<SignResult>;

    fn verify(&self, signed: &str) -> Result<VerifyResult>;

    /// Verify a detached signature stored at `sig_path` over `data`.
    fn verify_detached(&self, sig_path: &Path, data: &[u8]) -> Result<VerifyResult>;

    fn import_keys(&self, armored: &str) -> Result<ImportResult>;

    fn export_keys(
        &self,
        key_ids: &[&str],
        secret: bool,
        passphrase: Option<&SessionPassphrase>,
    ) -> Result<String>;

    fn list_keys(&self, secret: bool) -> Result<Vec<KeyInfo>>;

    fn delete_keys(&self, fingerprints: &[&str], secret: bool) -> Result<bool>;

    /// Generate an Ed25519/Cv25519 identity; returns the new fingerprint.
    fn gen_key(
        &self,
        name_real: &str,
        name_email: &str,
        passphrase: Option<&SessionPassphrase>,
    ) -> Result<String>;
}

/// Raw output of one engine run.
struct GpgOutput {
    success: bool,
    stdout: Vec<u8>,
    log: StatusLog,
}

/// `gpg`-backed agent.
#[derive(Debug, Clone)]
pub struct GpgAgent {
    binary: String,
    gpgconf: String,
    homedir: PathBuf,
}

impl GpgAgent {
    pub fn new(homedir: impl Into<PathBuf>) -> Self {
        Self {
            binary: DEFAULT_GPG_BINARY.to_string(),
            gpgconf: DEFAULT_GPGCONF_BINARY.to_string(),
            homedir: homedir.into(),
        }
    }

    pub fn with_binaries(mut self, gpg: impl Into<String>, gpgconf: impl Into<String>) -> Self {
        self.binary = gpg.into();
        self.gpgconf = gpgconf.into();
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn run(
        &self,
        args: &[&str],
        input: &[u8],
        passphrase: Option<&SessionPassphrase>,
    ) -> Result<GpgOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--homedir")
            .arg(&self.homedir)
            .args(["--batch", "--no-tty", "--yes", "--status-fd", "2"]);
        if passphrase.is_some() {
            cmd.args(["--pinentry-mode", "loopback", "--passphrase-fd", "0"]);
        }
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::debug!(op = args.first().copied().unwrap_or(""), homedir = %self.homedir.display(), "gpg");

        let mut child = cmd.spawn().map_err(|source| CryptoError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;

        // With --passphrase-fd 0 the engine reads the first line of stdin
        // as the passphrase and the rest as data.
        let mut buffer = Zeroizing::new(Vec::with_capacity(input.len() + 64));
        if let Some(pass) = passphrase {
            buffer.extend_from_slice(&pass.stdin_line());
        }
        buffer.extend_from_slice(input);

        // Feed stdin from its own thread so a chatty engine can't deadlock
        // us on a full stdout pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "stdin pipe missing"))?;
        let writer = std::thread::spawn(move || stdin.write_all(&buffer));

        let output = child.wait_with_output()?;

        match writer.join() {
            Ok(Ok(())) => {}
            // The engine may legitimately stop reading early (e.g. garbage input).
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "stdin writer panicked",
                )
                .into())
            }
        }

        let log = StatusLog::parse(&String::from_utf8_lossy(&output.stderr));
        Ok(GpgOutput {
            success: output.status.success(),
            stdout: output.stdout,
            log,
        })
    }

    fn verify_result(out: GpgOutput) -> VerifyResult {
        let log = &out.log;
        let valid = out.success && log.has("VALIDSIG") && !log.has("BADSIG");
        // VALIDSIG args: fpr date ts expire version reserved pkalgo hashalgo class primary-fpr
        let fingerprint = log.first("VALIDSIG").and_then(|l| {
            l.args
                .get(9)
                .or_else(|| l.args.first())
                .map(|s| s.to_string())
        });
        let goodsig = log.first("GOODSIG");
        VerifyResult {
            valid,
            fingerprint,
            username: goodsig.and_then(|l| l.args.get(1).cloned()),
            key_id: goodsig.and_then(|l| l.args.first().cloned()),
            status: log.verify_status(),
            stderr: log.diagnostics.clone(),
        }
    }
}

impl CryptoAgent for GpgAgent {
    fn keyring_dir(&self) -> &Path {
        &self.homedir
    }

    fn rebind(&mut self, dir: PathBuf) {
        self.homedir = dir;
    }

    fn prepare_home(&self) -> Result<()> {
        std::fs::create_dir_all(&self.homedir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.homedir, std::fs::Permissions::from_mode(0o700))?;
        }
        let conf = self.homedir.join("gpg-agent.conf");
        if !conf.exists() {
            std::fs::write(conf, AGENT_CONF)?;
        }
        Ok(())
    }

    fn shutdown(&self) {
        let _ = Command::new(&self.gpgconf)
            .arg("--homedir")
            .arg(&self.homedir)
            .args(["--kill", "all"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    fn encrypt(&self, plaintext: &str, recipients: &[&str]) -> Result<EncryptResult> {
        if recipients.is_empty() {
            return Err(CryptoError::NoRecipients);
        }
        // Keys checked in an ephemeral ring carry no ownertrust.
        let mut args = vec!["--armor", "--trust-model", "always", "--encrypt"];
        for recipient in recipients {
            args.push("--recipient");
            args.push(*recipient);
        }

        let out = self.run(&args, plaintext.as_bytes(), None)?;
        let ok = out.success && out.log.has("END_ENCRYPTION");
        let ciphertext = if ok {
            String::from_utf8(out.stdout).map_err(|_| CryptoError::InvalidOutput)?
        } else {
            String::new()
        };
        Ok(EncryptResult {
            ok,
            ciphertext,
            status: out.log.encrypt_status(),
            stderr: out.log.diagnostics,
        })
    }

    fn decrypt(&self, ciphertext: &str, passphrase: &SessionPassphrase) -> Result<DecryptResult> {
        let out = self.run(&["--decrypt"], ciphertext.as_bytes(), Some(passphrase))?;
        let mut status = out.log.decrypt_status();
        let mut ok = out.success && out.log.has("DECRYPTION_OKAY");

        let stdout = Zeroizing::new(out.stdout);
        let plaintext = match std::str::from_utf8(&stdout) {
            Ok(text) if ok => Zeroizing::new(text.to_string()),
            Ok(_) => Zeroizing::new(String::new()),
            Err(_) => {
                ok = false;
                status = "decrypted data is not valid UTF-8".to_string();
                Zeroizing::new(String::new())
            }
        };

        Ok(DecryptResult {
            ok,
            plaintext,
            status,
            stderr: out.log.diagnostics,
        })
    }

    fn sign(
        &self,
        message: &str,
        key_id: Option<&str>,
        passphrase: &SessionPassphrase,
        detach: bool,
    ) -> Result<SignResult> {
        let mut args = vec!["--armor", if detach { "--detach-sign" } else { "--sign" }];
        if let Some(key) = key_id {
            args.push("--local-user");
            args.push(key);
        }

        let out = self.run(&args, message.as_bytes(), Some(passphrase))?;
        // SIG_CREATED type pkalgo hashalgo class timestamp fpr
        let fingerprint = if out.success {
            out.log
                .first("SIG_CREATED")
                .and_then(|l| l.args.get(5).cloned())
        } else {
            None
        };
        let data = if fingerprint.is_some() {
            String::from_utf8(out.stdout).map_err(|_| CryptoError::InvalidOutput)?
        } else {
            String::new()
        };
        Ok(SignResult {
            fingerprint,
            data,
            stderr: out.log.diagnostics,
        })
    }

    fn verify(&self, signed: &str) -> Result<VerifyResult> {
        let out = self.run(&["--verify"], signed.as_bytes(), None)?;
        Ok(Self::verify_result(out))
    }

    fn verify_detached(&self, sig_path: &Path, data: &[u8]) -> Result<VerifyResult> {
        let sig = sig_path.to_string_lossy();
        let out = self.run(&["--verify", sig.as_ref(), "-"], data, None)?;
        Ok(Self::verify_result(out))
    }

    fn import_keys(&self, armored: &str) -> Result<ImportResult> {
        let out = self.run(&["--import"], armored.as_bytes(), None)?;
        // IMPORT_OK reason fpr
        let mut fingerprints: Vec<String> = Vec::new();
        for line in out.log.all("IMPORT_OK") {
            if let Some(fpr) = line.args.get(1) {
                if !fingerprints.contains(fpr) {
                    fingerprints.push(fpr.clone());
                }
            }
        }
        Ok(ImportResult {
            fingerprints,
            stderr: out.log.diagnostics,
        })
    }

    fn export_keys(
        &self,
        key_ids: &[&str],
        secret: bool,
        passphrase: Option<&SessionPassphrase>,
    ) -> Result<String> {
        let mut args = vec!["--armor", if secret { "--export-secret-keys" } else { "--export" }];
        args.extend_from_slice(key_ids);
        let out = self.run(&args, &[], passphrase)?;
        if !out.success {
            return Ok(String::new());
        }
        String::from_utf8(out.stdout).map_err(|_| CryptoError::InvalidOutput)
    }

    fn list_keys(&self, secret: bool) -> Result<Vec<KeyInfo>> {
        let listing = if secret { "--list-secret-keys" } else { "--list-keys" };
        let out = self.run(
            &["--with-colons", "--fixed-list-mode", "--with-fingerprint", listing],
            &[],
            None,
        )?;
        let stdout = String::from_utf8(out.stdout).map_err(|_| CryptoError::InvalidOutput)?;
        Ok(parse_colon_listing(&stdout))
    }

    fn delete_keys(&self, fingerprints: &[&str], secret: bool) -> Result<bool> {
        if fingerprints.is_empty() {
            return Ok(true);
        }
        let mut args = vec![if secret {
            "--delete-secret-and-public-key"
        } else {
            "--delete-keys"
        }];
        args.extend_from_slice(fingerprints);
        let out = self.run(&args, &[], None)?;
        Ok(out.success)
    }

    fn gen_key(
        &self,
        name_real: &str,
        name_email: &str,
        passphrase: Option<&SessionPassphrase>,
    ) -> Result<String> {
        // One parameter per line: a line break in a value would add parameters.
        if name_real.chars().chain(name_email.chars()).any(char::is_control) {
            return Err(CryptoError::InvalidInput(
                "key owner name contains a control character",
            ));
        }

        let mut params = Zeroizing::new(String::new());
        params.push_str("Key-Type: EDDSA\nKey-Curve: ed25519\nKey-Usage: sign\n");
        params.push_str("Subkey-Type: ECDH\nSubkey-Curve: cv25519\nSubkey-Usage: encrypt\n");
        params.push_str(&format!(
            "Name-Real: {}\nName-Email: {}\nExpire-Date: 0\n",
            name_real, name_email
        ));
        match passphrase {
            Some(pass) => {
                params.push_str("Passphrase: ");
                params.push_str(pass.expose());
                params.push('\n');
            }
            None => params.push_str("%no-protection\n"),
        }
        params.push_str("%commit\n");

        // Binding the subkey unlocks the new primary key; with no cache the
        // agent asks for the passphrase again, answered from stdin.
        let out = self.run(&["--gen-key"], params.as_bytes(), passphrase)?;
        // KEY_CREATED type fpr
        match out.log.first("KEY_CREATED").and_then(|l| l.args.get(1)) {
            Some(fingerprint) if out.success => Ok(fingerprint.clone()),
            _ => Err(CryptoError::KeyGeneration(
                out.log
                    .diagnostics
                    .lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("no KEY_CREATED status")
                    .trim()
                    .to_string(),
            )),
        }
    }
}

/// Check if the engine binary is runnable.
pub fn gpg_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
