//! Parsing of the engine's machine-readable status channel.
//!
//! `gpg --status-fd 2` interleaves `[GNUPG:] KEYWORD args...` lines with its
//! human-readable diagnostics on stderr. We split the two apart so callers
//! can reason about keywords and still surface the diagnostics verbatim.

const STATUS_PREFIX: &str = "[GNUPG:] ";

/// One `[GNUPG:]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StatusLine {
    pub keyword: String,
    pub args: Vec<String>,
}

/// Stderr of one engine run, split into status lines and diagnostics.
#[derive(Debug, Default, Clone)]
pub(crate) struct StatusLog {
    pub lines: Vec<StatusLine>,
    pub diagnostics: String,
}

impl StatusLog {
    pub fn parse(stderr: &str) -> Self {
        let mut log = Self::default();
        for line in stderr.lines() {
            match line.strip_prefix(STATUS_PREFIX) {
                Some(rest) => {
                    let mut parts = rest.split(' ');
                    let keyword = parts.next().unwrap_or("").to_string();
                    if keyword.is_empty() {
                        continue;
                    }
                    // GOODSIG carries a user id with spaces; keep the tail intact.
                    let args = if keyword == "GOODSIG" || keyword == "BADSIG" {
                        let tail: Vec<&str> = parts.collect();
                        match tail.split_first() {
                            Some((key, rest)) if rest.is_empty() => vec![key.to_string()],
                            Some((key, rest)) => vec![key.to_string(), rest.join(" ")],
                            None => Vec::new(),
                        }
                    } else {
                        parts.filter(|p| !p.is_empty()).map(str::to_string).collect()
                    };
                    log.lines.push(StatusLine { keyword, args });
                }
                None => {
                    log.diagnostics.push_str(line);
                    log.diagnostics.push('\n');
                }
            }
        }
        log
    }

    pub fn has(&self, keyword: &str) -> bool {
        self.lines.iter().any(|l| l.keyword == keyword)
    }

    pub fn first(&self, keyword: &str) -> Option<&StatusLine> {
        self.lines.iter().find(|l| l.keyword == keyword)
    }

    pub fn all<'a>(&'a self, keyword: &'a str) -> impl Iterator<Item = &'a StatusLine> + 'a {
        self.lines.iter().filter(move |l| l.keyword == keyword)
    }

    /// Human-readable summary of a decrypt run, mirroring the wording
    /// users see from other gpg front-ends.
    pub fn decrypt_status(&self) -> String {
        if self.has("DECRYPTION_OKAY") {
            "decryption ok".to_string()
        } else if self.has("BAD_PASSPHRASE") {
            "bad passphrase".to_string()
        } else if self.has("MISSING_PASSPHRASE") {
            "need passphrase".to_string()
        } else if self.has("NO_SECKEY") {
            "no secret key".to_string()
        } else if self.has("NODATA") {
            "no data was provided".to_string()
        } else if self.has("DECRYPTION_FAILED") {
            "decryption failed".to_string()
        } else {
            "decryption incomplete".to_string()
        }
    }

    pub fn verify_status(&self) -> String {
        if self.has("BADSIG") {
            "signature bad".to_string()
        } else if self.has("NO_PUBKEY") {
            "no public key".to_string()
        } else if self.has("EXPKEYSIG") {
            "signing key has expired".to_string()
        } else if self.has("REVKEYSIG") {
            "signing key was revoked".to_string()
        } else if self.has("ERRSIG") {
            "signature error".to_string()
        } else if self.has("VALIDSIG") {
            "signature valid".to_string()
        } else if self.has("NODATA") {
            "signature expected but not found".to_string()
        } else {
            "no signature".to_string()
        }
    }

    pub fn encrypt_status(&self) -> String {
        if self.has("INV_RECP") {
            "invalid recipient".to_string()
        } else if self.has("END_ENCRYPTION") {
            "encryption ok".to_string()
        } else {
            "encryption failed".to_string()
        }
    }
}

/// Parse `--with-colons` key listings.
///
/// Field indexes follow `doc/DETAILS` in the GnuPG sources: 1 validity,
/// 2 key length, 3 algorithm, 4 key id, 5 creation, 6 expiry, 9 user id or
/// fingerprint.
pub(crate) fn parse_colon_listing(output: &str) -> Vec<crate::agent::KeyInfo> {
    let mut keys: Vec<crate::agent::KeyInfo> = Vec::new();
    // A fingerprint record belongs to the key record right above it; only
    // primary key fingerprints are kept.
    let mut expect_primary_fpr = false;

    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let field = |i: usize| fields.get(i).copied().unwrap_or("");
        match field(0) {
            "pub" | "sec" => {
                keys.push(crate::agent::KeyInfo {
                    fingerprint: String::new(),
                    key_id: field(4).to_string(),
                    algorithm: field(3).to_string(),
                    length: field(2).parse().unwrap_or(0),
                    created: field(5).to_string(),
                    expires: non_empty(field(6)),
                    validity: field(1).to_string(),
                    uids: Vec::new(),
                    secret: field(0) == "sec",
                });
                expect_primary_fpr = true;
            }
            "fpr" if expect_primary_fpr => {
                if let Some(key) = keys.last_mut() {
                    key.fingerprint = field(9).to_string();
                }
                expect_primary_fpr = false;
            }
            "uid" => {
                if let Some(key) = keys.last_mut() {
                    key.uids.push(unescape_field(field(9)));
                }
            }
            "sub" | "ssb" => expect_primary_fpr = false,
            _ => {}
        }
    }
    keys
}

/// Undo the C-style `\xNN` quoting gpg applies to colon-listing fields
/// (`:` itself arrives as `\x3a`). The decoded bytes are UTF-8.
fn unescape_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let escaped = bytes
                .get(i + 2..i + 4)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = escaped {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
