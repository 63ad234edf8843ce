use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use super::CacheName;

/// The deduplication key of a scheduled call.
///
/// Two keys are equal when they belong to the same [`CacheName`] and their metadata hashes to the
/// same digest.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    name: CacheName,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.name)?;
        for b in &self.hash[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for a backend request.
    ///
    /// The method is normalized to upper case, the body contributes its sha-256 digest so large
    /// payloads do not end up in the metadata.
    pub fn for_request(name: CacheName, method: &str, url: &str, body: Option<&[u8]>) -> Self {
        let mut builder = Self::builder(name);
        builder.write_request(method, url, body);
        builder.build()
    }

    /// Create a [`CacheKeyBuilder`] that can be used to build a cache key consisting of all its
    /// contributing parts.
    pub fn builder(name: CacheName) -> CacheKeyBuilder {
        CacheKeyBuilder {
            name,
            metadata: String::new(),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The cache this key belongs to.
    pub fn cache_name(&self) -> CacheName {
        self.name
    }

    #[cfg(test)]
    pub fn for_testing(name: CacheName, key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            name,
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`], and is kept alongside the key to help
/// debugging.
pub struct CacheKeyBuilder {
    name: CacheName,
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the method, url and body digest of a request into the [`CacheKey`].
    pub fn write_request(&mut self, method: &str, url: &str, body: Option<&[u8]>) {
        self.metadata.push_str("method: ");
        self.metadata.push_str(&method.to_ascii_uppercase());
        self.metadata.push_str("\nurl: ");
        self.metadata.push_str(url);
        self.metadata.push('\n');

        if let Some(body) = body {
            self.metadata.push_str("body: ");
            for b in Sha256::digest(body) {
                // writing into a `String` never fails
                let _ = write!(self.metadata, "{b:02x}");
            }
            self.metadata.push('\n');
        }
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        CacheKey {
            name: self.name,
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_keys() {
        let key = CacheKey::for_request(
            CacheName::Listings,
            "post",
            "https://shop.example/api/listings",
            Some(br#"{"color":"red"}"#),
        );

        assert!(key.metadata().starts_with(
            "method: POST\nurl: https://shop.example/api/listings\nbody: "
        ));
        assert_eq!(key.cache_name(), CacheName::Listings);
        assert!(key.to_string().starts_with("listings/"));

        let same = CacheKey::for_request(
            CacheName::Listings,
            "POST",
            "https://shop.example/api/listings",
            Some(br#"{"color":"red"}"#),
        );
        assert_eq!(key, same);

        let other_body = CacheKey::for_request(
            CacheName::Listings,
            "POST",
            "https://shop.example/api/listings",
            Some(br#"{"color":"blue"}"#),
        );
        assert_ne!(key, other_body);
    }

    #[test]
    fn test_cache_name_is_part_of_key() {
        let a = CacheKey::for_request(CacheName::Catalog, "GET", "/products/1", None);
        let b = CacheKey::for_request(CacheName::Content, "GET", "/products/1", None);
        assert_eq!(a.metadata(), b.metadata());
        assert_ne!(a, b);
    }

    #[test]
    fn test_builder() {
        let mut builder = CacheKey::builder(CacheName::Categories);
        writeln!(builder, "tree: root").unwrap();
        writeln!(builder, "depth: 3").unwrap();
        let key = builder.build();

        assert_eq!(key.metadata(), "tree: root\ndepth: 3\n");
        assert_eq!(key, CacheKey::for_testing(CacheName::Categories, "tree: root\ndepth: 3\n"));
    }
}
