// Caller authorization checks delegated to by every front end.
use std::collections::HashSet;

use crate::client::CallerIdentity;

pub trait AccessChecker: Send + Sync {
    fn is_allowed(&self, identity: &CallerIdentity) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessChecker for AllowAll {
    fn is_allowed(&self, _identity: &CallerIdentity) -> bool {
        true
    }
}

/// Allows a fixed set of user names, compared case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    users: HashSet<String>,
    allow_anonymous: bool,
}

impl AllowList {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            users: users
                .into_iter()
                .map(|user| user.as_ref().trim().to_lowercase())
                .filter(|user| !user.is_empty())
                .collect(),
            allow_anonymous: false,
        }
    }

    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl AccessChecker for AllowList {
    fn is_allowed(&self, identity: &CallerIdentity) -> bool {
        if !identity.is_authenticated() {
            return self.allow_anonymous;
        }
        self.users.contains(&identity.name().to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_case_insensitive() {
        let list = AllowList::new(["Alice", " bob ", ""]);
        assert_eq!(list.len(), 2);
        assert!(list.is_allowed(&CallerIdentity::user("ALICE")));
        assert!(list.is_allowed(&CallerIdentity::user("bob")));
        assert!(!list.is_allowed(&CallerIdentity::user("mallory")));
    }

    #[test]
    fn anonymous_needs_opt_in() {
        let peer = CallerIdentity::anonymous("quic/10.0.0.5:5000");
        assert!(!AllowList::new(["alice"]).is_allowed(&peer));
        assert!(AllowList::new(["alice"]).allow_anonymous(true).is_allowed(&peer));
        assert!(AllowAll.is_allowed(&peer));
    }
}
