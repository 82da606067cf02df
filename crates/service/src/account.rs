//! Accounts and nonce issuance/validation (C4's non-HMAC half).
//!
//! The account list itself is an external collaborator (loaded from a
//! file, a database, whatever) — this module only defines the shape the
//! dispatcher needs and a simple in-memory store good enough to hold
//! whatever the binary crate parsed out of the account file.

use std::collections::HashMap;

use md5::{Digest, Md5};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Authorized,
    Refused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub realm: String,
    pub state: AccountState,
}

/// Looked up by `(username, realm)`; the core never creates accounts,
/// only reads them.
pub trait AccountStore {
    fn lookup(&self, username: &str, realm: &str) -> Option<&Account>;
}

/// An in-memory account table, e.g. populated from the `login:password:realm`
/// account file.
#[derive(Default)]
pub struct StaticAccountStore(HashMap<(String, String), Account>);

impl StaticAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, account: Account) {
        self.0
            .insert((account.username.clone(), account.realm.clone()), account);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AccountStore for StaticAccountStore {
    fn lookup(&self, username: &str, realm: &str) -> Option<&Account> {
        self.0.get(&(username.to_string(), realm.to_string()))
    }
}

/// Nonce lifetime, §4.3: the embedded deadline is `now + 3600s`.
pub const NONCE_LIFETIME_SECS: u64 = 3600;

/// A 48-byte nonce: 16 hex chars of `now + lifetime` (big-endian seconds
/// since epoch) followed by 32 hex chars of `MD5(hex_time ":" key)`.
///
/// # Test
///
/// ```
/// use turn_server_service::account::{generate_nonce, is_stale};
///
/// let nonce = generate_nonce(1_000_000, "server-secret");
/// assert_eq!(nonce.len(), 48);
/// assert!(!is_stale(&nonce, 1_000_000, "server-secret"));
/// assert!(is_stale(&nonce, 1_000_000, "different-secret"));
/// // a nonce whose embedded deadline has already passed is stale.
/// assert!(is_stale(&nonce, 1_000_000 + NONCE_LIFETIME_SECS + 1, "server-secret"));
/// ```
pub fn generate_nonce(now: u64, key: &str) -> String {
    let deadline = now + NONCE_LIFETIME_SECS;
    let hex_time = format!("{:016x}", deadline);
    let mac = mac_hex(&hex_time, key);

    format!("{hex_time}{mac}")
}

/// A nonce is stale if it is malformed, its MAC doesn't match the
/// server's key, or its embedded deadline has already passed.
pub fn is_stale(nonce: &str, now: u64, key: &str) -> bool {
    if nonce.len() != 48 || !nonce.is_ascii() {
        return true;
    }

    let (hex_time, hex_mac) = nonce.split_at(16);
    if mac_hex(hex_time, key) != hex_mac {
        return true;
    }

    match u64::from_str_radix(hex_time, 16) {
        Ok(deadline) => now > deadline,
        Err(_) => true,
    }
}

fn mac_hex(hex_time: &str, key: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(hex_time.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_username_and_realm() {
        let mut store = StaticAccountStore::new();
        store.insert(Account {
            username: "toto".into(),
            password: "password".into(),
            realm: "domain.org".into(),
            state: AccountState::Authorized,
        });

        assert!(store.lookup("toto", "domain.org").is_some());
        assert!(store.lookup("toto", "other.org").is_none());
        assert!(store.lookup("nobody", "domain.org").is_none());
    }
}
