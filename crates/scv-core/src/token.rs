//! Global token → lease resolution.
//!
//! Frame, checkpoint and stop requests carry only a token; this table is
//! how they find the target, stream and session they address. It has its
//! own lock so token traffic never contends with queue traffic.

use crate::stream::ActiveStream;
use crate::{CoreError, read, write};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// What a token authorizes.
#[derive(Debug, Clone)]
pub struct TokenEntry {
    pub target_id: String,
    pub stream_id: String,
    pub session: Arc<ActiveStream>,
}

#[derive(Debug, Default)]
pub struct TokenTable {
    entries: RwLock<HashMap<String, TokenEntry>>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, entry: TokenEntry) {
        write(&self.entries).insert(token.into(), entry);
    }

    /// Resolve a token. A concurrently removed token resolves to
    /// `NoActiveLease`, as does one whose session was already released.
    pub fn find(&self, token: &str) -> Result<TokenEntry, CoreError> {
        let entry = read(&self.entries)
            .get(token)
            .cloned()
            .ok_or(CoreError::NoActiveLease)?;
        if entry.session.is_released() {
            return Err(CoreError::NoActiveLease);
        }
        Ok(entry)
    }

    pub fn remove(&self, token: &str) -> Option<TokenEntry> {
        write(&self.entries).remove(token)
    }

    pub fn contains(&self, token: &str) -> bool {
        read(&self.entries).contains_key(token)
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: &str) -> TokenEntry {
        TokenEntry {
            target_id: "t-1".to_string(),
            stream_id: "s-1".to_string(),
            session: Arc::new(ActiveStream::new(token, "donor", "openmm")),
        }
    }

    #[test]
    fn find_resolves_inserted_token() {
        let table = TokenTable::new();
        table.insert("tok", entry("tok"));
        let found = table.find("tok").expect("token should resolve");
        assert_eq!(found.stream_id, "s-1");
        assert_eq!(found.session.token(), "tok");
    }

    #[test]
    fn removed_token_has_no_lease() {
        let table = TokenTable::new();
        table.insert("tok", entry("tok"));
        assert!(table.remove("tok").is_some());
        assert_eq!(table.find("tok").unwrap_err(), CoreError::NoActiveLease);
        assert!(table.is_empty());
    }

    #[test]
    fn released_session_has_no_lease_even_before_removal() {
        let table = TokenTable::new();
        let item = entry("tok");
        let session = item.session.clone();
        table.insert("tok", item);
        session.begin_release().expect("first release wins");
        assert!(table.contains("tok"));
        assert_eq!(table.find("tok").unwrap_err(), CoreError::NoActiveLease);
    }
}
