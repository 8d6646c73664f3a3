//! Request identities and counter key generation.

use std::fmt;

/// Namespace prepended to every counter key unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "limiter";

const SEPARATOR: char = ':';

/// Who a request is counted against.
///
/// A non-empty token always wins over the address: the address is not
/// consulted at all for token-bearing requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    /// Network address of the caller
    Address(String),
    /// Bearer token supplied by the caller
    Token(String),
}

impl Identity {
    /// Resolve the identity for a request.
    ///
    /// An empty address with no token still resolves to the (empty) address
    /// identity, so such requests share a single counter.
    pub fn resolve(address: &str, token: &str) -> Self {
        if token.is_empty() {
            Identity::Address(address.to_string())
        } else {
            Identity::Token(token.to_string())
        }
    }

    /// Resolve the identity, or `None` when both inputs are empty.
    pub fn resolve_non_empty(address: &str, token: &str) -> Option<Self> {
        if token.is_empty() && address.is_empty() {
            None
        } else {
            Some(Self::resolve(address, token))
        }
    }

    /// The class tag used in counter keys.
    pub fn class(&self) -> &'static str {
        match self {
            Identity::Address(_) => "ip",
            Identity::Token(_) => "token",
        }
    }

    /// The raw identity value.
    pub fn value(&self) -> &str {
        match self {
            Identity::Address(value) | Identity::Token(value) => value,
        }
    }
}

/// A key that uniquely identifies a counter in the store.
///
/// Rendered as `namespace:class:value`; two identities share a key only if
/// they share both class and exact value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey(String);

impl CounterKey {
    /// Build the key for an identity under a namespace.
    pub fn new(namespace: &str, identity: &Identity) -> Self {
        Self(format!(
            "{namespace}{SEPARATOR}{}{SEPARATOR}{}",
            identity.class(),
            identity.value()
        ))
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
