//! Loads the `login:password:realm` account file into a
//! [`StaticAccountStore`].

use std::fs::read_to_string;
use std::path::Path;

use anyhow::Result;
use service::account::{Account, AccountState, StaticAccountStore};

/// Parse newline-separated `login:password:realm` records. Lines with
/// fewer than three colon-separated tokens are skipped, matching the
/// wire format's tolerance for trailing blank lines.
pub fn load(path: &Path) -> Result<StaticAccountStore> {
    let contents = read_to_string(path)?;
    let mut store = StaticAccountStore::new();

    for line in contents.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(username), Some(password), Some(realm)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };

        store.insert(Account {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
            state: AccountState::Authorized,
        });
    }

    Ok(store)
}
