//! Credential resolution.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
    pub manager: bool,
}

pub trait Authenticator: Send + Sync {
    /// Resolve a transport credential, or `None` when it is unknown.
    fn authenticate(&self, credential: &str) -> Option<Principal>;
}

/// One configured user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCredential {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub manager: bool,
}

/// Fixed credential table, loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    by_token: HashMap<String, Principal>,
}

impl StaticAuthenticator {
    pub fn new(users: impl IntoIterator<Item = UserCredential>) -> Self {
        let by_token = users
            .into_iter()
            .map(|user| {
                (
                    user.token,
                    Principal {
                        user: user.id,
                        manager: user.manager,
                    },
                )
            })
            .collect();
        Self { by_token }
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credential: &str) -> Option<Principal> {
        self.by_token.get(credential).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_tokens_only() {
        let auth = StaticAuthenticator::new([
            UserCredential {
                id: "alice".to_string(),
                token: "tok-a".to_string(),
                manager: true,
            },
            UserCredential {
                id: "bob".to_string(),
                token: "tok-b".to_string(),
                manager: false,
            },
        ]);
        assert_eq!(
            auth.authenticate("tok-a"),
            Some(Principal {
                user: "alice".to_string(),
                manager: true
            })
        );
        assert!(!auth.authenticate("tok-b").expect("known").manager);
        assert_eq!(auth.authenticate("alice"), None);
    }
}
