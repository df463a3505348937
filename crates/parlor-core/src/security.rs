use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Server-wide secret mixed into per-user login keys (redacted in Debug).
#[derive(Clone)]
pub struct AuthSecret(pub SecretString);

impl AuthSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(SecretString::from(secret.into()))
    }

    /// Key a client may present instead of a password.
    pub fn user_key(&self, passwd: &str) -> String {
        derive_user_key(self.0.expose_secret(), passwd)
    }

    pub fn is(&self, candidate: &str) -> bool {
        self.0.expose_secret() == candidate
    }

    /// Compare a presented key against the one derived from `passwd`.
    pub fn verify_key(&self, passwd: &str, presented: &str) -> bool {
        let expected = self.user_key(passwd);
        expected.len() == presented.len()
            && expected
                .bytes()
                .zip(presented.bytes())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl std::fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthSecret([REDACTED])")
    }
}

/// Upper-case hex SHA-256 of `secret` followed by `passwd`.
pub fn derive_user_key(secret: &str, passwd: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(passwd.as_bytes());
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_uppercase_hex_sha256() {
        // sha256("") with empty secret
        assert_eq!(
            derive_user_key("", ""),
            "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855"
        );
    }

    #[test]
    fn key_depends_on_secret_and_password() {
        let a = derive_user_key("s1", "pw");
        let b = derive_user_key("s2", "pw");
        let c = derive_user_key("s1", "pw2");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn key_is_concatenation() {
        assert_eq!(derive_user_key("ab", "c"), derive_user_key("a", "bc"));
    }

    #[test]
    fn verify_key_matches_derived() {
        let secret = AuthSecret::new("server-secret");
        let key = secret.user_key("hunter2");
        assert!(secret.verify_key("hunter2", &key));
        assert!(!secret.verify_key("hunter3", &key));
        assert!(!secret.verify_key("hunter2", &key[..10]));
    }

    #[test]
    fn is_compares_secret() {
        let secret = AuthSecret::new("abc");
        assert!(secret.is("abc"));
        assert!(!secret.is("abd"));
    }

    #[test]
    fn debug_redacts() {
        let secret = AuthSecret::new("server-secret");
        let debug = format!("{secret:?}");
        assert!(!debug.contains("server-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
