//! Version tokens attached to every stored entry.
//!
//! Format: `<unix-millis>-<random suffix>`. The leading timestamp is only
//! there to make tokens readable in logs; tokens are compared for equality
//! and never ordered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Length of the random suffix in hex characters.
const SUFFIX_LEN: usize = 12;

/// Opaque per-write identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Mint a token for a locally originated write.
    pub fn fresh() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{millis}-{}", &random[..SUFFIX_LEN]))
    }

    /// Wrap a token received from elsewhere. Empty strings are not tokens.
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
