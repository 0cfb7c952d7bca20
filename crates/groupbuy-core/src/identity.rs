use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Derived key grouping every order row that belongs to one buyer.
///
/// Always produced by [`resolve`]. Values read back from storage are
/// re-derived on load, so a rename survives a reload through the stored
/// name and phone, not through the stored identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct PersonId(String);

impl PersonId {
    /// Wrap an identifier loaded from a persisted table.
    #[must_use]
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for PersonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip surrounding whitespace and every non-digit separator from a phone number.
///
/// The result is still a string: leading zeros are significant.
#[must_use]
pub fn normalize_phone(phone: &str) -> String {
    phone.trim().chars().filter(char::is_ascii_digit).collect()
}

#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.trim().to_string()
}

/// Derive the person identifier for a (name, phone) pair.
///
/// Every code path that creates or edits an order goes through this function;
/// a second normalization rule anywhere else would split one buyer into two.
#[must_use]
pub fn resolve(name: &str, phone: &str) -> PersonId {
    PersonId(format!("{}_{}", normalize_name(name), normalize_phone(phone)))
}
