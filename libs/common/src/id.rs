use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = catalog_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that carry a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Realtime client connection.
    pub const CONNECTION: &str = "conn";
    /// Listener attempt, used to correlate log lines across one connect/run cycle.
    pub const LISTENER: &str = "lsn";
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl PrefixedId for Probe {
        const PREFIX: &'static str = prefix::CONNECTION;
    }

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid("conn");
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn uniqueness() {
        let a = prefixed_ulid("conn");
        let b = prefixed_ulid("conn");
        assert_ne!(a, b);
    }

    #[test]
    fn trait_uses_prefix() {
        assert!(Probe::generate().starts_with("conn_"));
    }
}
