use std::fmt;

use x25519_dalek::{PublicKey, StaticSecret};

/// Represents an error in base64 key parsing.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct InvalidKey;

impl std::error::Error for InvalidKey {}

impl fmt::Display for InvalidKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid key format")
    }
}

/// An opaque 32-byte device key.
///
/// The tunnel driver makes no meaningful distinction between public and
/// private keys - any sequence of 32 bytes can be used as either - so this
/// type is shared by both. Be careful when handling `Key`s created from
/// external data.
#[derive(PartialEq, Eq, Clone, Hash)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// Generates and returns a new private key.
    pub fn generate_private() -> Self {
        use rand_core::{OsRng, RngCore};

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);

        // Apply key clamping.
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    /// Generates a public key for this private key.
    #[must_use]
    pub fn get_public(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        let public = PublicKey::from(&secret);

        Self(public.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Converts the key to a standardized base64 representation, as used by
    /// the `wg` utility and `wg-quick`.
    pub fn to_base64(&self) -> String {
        base64::encode(self.0)
    }

    /// Converts a base64 representation of the key to the raw bytes.
    pub fn from_base64(key: &str) -> Result<Self, InvalidKey> {
        let decoded = base64::decode(key).map_err(|_| InvalidKey)?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| InvalidKey)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Keys may be private material; never print the full bytes.
        write!(f, "Key({}...)", &self.to_base64()[..4])
    }
}

#[derive(Clone)]
pub struct KeyPair {
    pub private: Key,
    pub public: Key,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = Key::generate_private();
        let public = private.get_public();
        Self { private, public }
    }

    pub fn from_private(key: Key) -> Self {
        let public = key.get_public();
        Self {
            private: key,
            public,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let key = Key::generate_private();
        let parsed = Key::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key, parsed);
        assert_eq!(key.to_base64().len(), 44);
    }

    #[test]
    fn test_invalid_base64() {
        assert_eq!(Key::from_base64("!!!"), Err(InvalidKey));
        assert_eq!(Key::from_base64("dG9vLXNob3J0"), Err(InvalidKey));
    }

    #[test]
    fn test_private_key_clamping() {
        let key = Key::generate_private();
        assert_eq!(key.0[0] & 0b111, 0);
        assert_eq!(key.0[31] & 0b1000_0000, 0);
        assert_eq!(key.0[31] & 0b0100_0000, 0b0100_0000);
    }

    #[test]
    fn test_public_derivation_is_deterministic() {
        let pair = KeyPair::generate();
        assert_eq!(pair.private.get_public(), pair.public);
        assert_ne!(pair.private, pair.public);
    }
}
