use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;
use std::{fmt::Display, ops::Deref};

/// ULID-backed identifier used for indexing jobs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Eid(String);

impl Display for Eid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Eid {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Eid(s.to_string()))
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(fr: &str) -> Self {
        Eid(fr.to_string())
    }
}

impl From<String> for Eid {
    fn from(fr: String) -> Self {
        Eid(fr)
    }
}

impl Eid {
    #[inline]
    pub fn new() -> Eid {
        Eid(rusty_ulid::generate_ulid_string())
    }
}

impl Default for Eid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique_and_sortable() {
        let a = Eid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Eid::new();

        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
        assert!(a < b);
    }
}
