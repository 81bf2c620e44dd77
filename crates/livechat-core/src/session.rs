// Session code and admin secret for the single session a process hosts.

use rand::Rng;

/// Alphabet for session codes: uppercase letters and digits minus the
/// look-alikes I, O, 0 and 1.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Alphabet for admin secrets.
pub const SECRET_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

pub const CODE_LEN: usize = 6;
pub const SECRET_LEN: usize = 8;

/// The process-wide session. Created once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    code: String,
    admin_secret: String,
}

impl SessionRegistry {
    /// Generate a fresh session code and admin secret.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        Self {
            code: random_string(&mut rng, CODE_ALPHABET, CODE_LEN),
            admin_secret: random_string(&mut rng, SECRET_ALPHABET, SECRET_LEN),
        }
    }

    /// Build a registry from known values (configuration overrides, tests).
    pub fn with_credentials(code: impl Into<String>, admin_secret: impl Into<String>) -> Self {
        Self {
            code: code.into().trim().to_ascii_uppercase(),
            admin_secret: admin_secret.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn admin_secret(&self) -> &str {
        &self.admin_secret
    }

    /// Case-insensitive comparison of a submitted join code.
    pub fn validate_join(&self, code: &str) -> bool {
        code.trim().to_ascii_uppercase() == self.code
    }

    /// Exact comparison of a submitted admin password.
    pub fn validate_admin(&self, secret: &str) -> bool {
        secret == self.admin_secret
    }
}

/// True when `code` is a well-formed session code.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

/// True when `secret` is a well-formed admin secret.
pub fn is_valid_secret(secret: &str) -> bool {
    secret.len() == SECRET_LEN && secret.bytes().all(|b| SECRET_ALPHABET.contains(&b))
}

fn random_string(rng: &mut impl Rng, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}
