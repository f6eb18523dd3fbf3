//! Destination keys.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Identifies one logical pool.
///
/// Two acquisitions share a pool only if both the address and the transport
/// fingerprint match. The fingerprint lets callers keep connections that were
/// opened with different transport settings (TLS, proxy, socket options)
/// apart even when they target the same address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    address: Arc<str>,
    fingerprint: u64,
}

impl DestinationKey {
    /// Create a key for an address with no transport fingerprint.
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self {
            address: address.into(),
            fingerprint: 0,
        }
    }

    /// Mix a transport configuration into the key.
    ///
    /// Settings that hash differently yield different keys, and therefore
    /// different pools.
    #[must_use]
    pub fn with_transport_config<C: Hash + ?Sized>(mut self, config: &C) -> Self {
        let mut hasher = DefaultHasher::new();
        self.fingerprint.hash(&mut hasher);
        config.hash(&mut hasher);
        self.fingerprint = hasher.finish();
        self
    }

    /// The destination address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The transport fingerprint, `0` when none was mixed in.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

impl fmt::Debug for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationKey")
            .field("address", &self.address)
            .field("fingerprint", &format_args!("{:#018x}", self.fingerprint))
            .finish()
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fingerprint == 0 {
            f.write_str(&self.address)
        } else {
            write!(f, "{}#{:016x}", self.address, self.fingerprint)
        }
    }
}

impl From<&str> for DestinationKey {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DestinationKey {
    fn from(address: String) -> Self {
        Self::new(address)
    }
}
