use std::fmt;

use serde::Deserialize;

/// All known cache names, one per call class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheName {
    Categories,
    Catalog,
    Listings,
    Content,
}

impl CacheName {
    pub const ALL: [CacheName; 4] = [
        Self::Categories,
        Self::Catalog,
        Self::Listings,
        Self::Content,
    ];
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Categories => "categories",
            Self::Catalog => "catalog",
            Self::Listings => "listings",
            Self::Content => "content",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
