//! Agent public-key acceptance policies.

use crate::error::{TunnelError, TunnelResult};
use ssh_key::{AuthorizedKeys, HashAlg};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Decides whether an agent's public key is acceptable.
///
/// `fingerprint` is the OpenSSH SHA256 form, `SHA256:<base64>`.
pub trait KeyVerifier: Send + Sync {
    fn verify(&self, user: &str, fingerprint: &str) -> bool;

    /// Short label for startup logging.
    fn describe(&self) -> String;
}

/// Accepts every key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAnyKey;

impl KeyVerifier for AcceptAnyKey {
    fn verify(&self, user: &str, fingerprint: &str) -> bool {
        debug!(user, fingerprint, "accepting agent key without verification");
        true
    }

    fn describe(&self) -> String {
        "any key (unauthenticated)".into()
    }
}

/// Accepts only keys listed in an OpenSSH `authorized_keys` file.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeySet {
    fingerprints: HashSet<String>,
}

impl AuthorizedKeySet {
    pub fn load(path: &Path) -> TunnelResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::AuthorizedKeys(format!("{}: {e}", path.display()))
        })?;
        let set = Self::parse(&contents)?;
        info!(
            path = %path.display(),
            keys = set.len(),
            "loaded authorized keys"
        );
        Ok(set)
    }

    /// Parse `authorized_keys` contents. Blank lines and comments are skipped;
    /// any malformed entry fails the whole set.
    pub fn parse(contents: &str) -> TunnelResult<Self> {
        let mut fingerprints = HashSet::new();
        for (idx, entry) in AuthorizedKeys::new(contents).enumerate() {
            let entry = entry
                .map_err(|e| TunnelError::AuthorizedKeys(format!("entry {}: {e}", idx + 1)))?;
            fingerprints.insert(entry.public_key().fingerprint(HashAlg::Sha256).to_string());
        }
        Ok(Self { fingerprints })
    }

    pub fn from_fingerprints<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fingerprints: fingerprints.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl KeyVerifier for AuthorizedKeySet {
    fn verify(&self, _user: &str, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    fn describe(&self) -> String {
        format!("{} authorized key(s)", self.fingerprints.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const AGENT_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGODQ1JhCGVlpBbLMT5Mfe9B11iMGFauI4XTB1M0dVxY agent@test";
    const AGENT_FP: &str = "SHA256:XCVesp/V2MrSN0dvxaO+K2DBWd9x5hnRqonnm0EFXXE";
    const OTHER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIEt6r4TV/2/yb0Q6T0cqDtzVu1gcsDm6gcAxF23hdD+m other@test";
    const OTHER_FP: &str = "SHA256:XCDxcNIS5GHjY73U5qQvlIh+xkL5pkifVYtJI9OutMM";

    #[test]
    fn accept_any_accepts() {
        assert!(AcceptAnyKey.verify("server", OTHER_FP));
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let contents = format!("# agents\n\n{AGENT_KEY}\n");
        let set = AuthorizedKeySet::parse(&contents).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.verify("server", AGENT_FP));
        assert!(!set.verify("server", OTHER_FP));
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = AuthorizedKeySet::parse("ssh-ed25519 not-base64!!\n").unwrap_err();
        assert!(matches!(err, TunnelError::AuthorizedKeys(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{AGENT_KEY}").unwrap();
        writeln!(file, "{OTHER_KEY}").unwrap();

        let set = AuthorizedKeySet::load(file.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.verify("server", OTHER_FP));
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(AuthorizedKeySet::load(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn from_fingerprints_matches_exactly() {
        let set = AuthorizedKeySet::from_fingerprints([AGENT_FP]);
        assert!(set.verify("anyone", AGENT_FP));
        assert!(!set.verify("anyone", &AGENT_FP.to_lowercase()));
    }
}
