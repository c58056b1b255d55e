/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cryptographic primitives.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use super::basic::{Digest, SignatureBytes};

// re-exports below.
pub use sha2::{Digest as Sha2Digest, Sha256 as CryptoHasher};

pub use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// A wrapper around [`SigningKey`] that implements a [convenience method](Self::sign) for
/// creating signatures over digests as well as a [getter](Self::public) for the public key.
#[derive(Clone)]
pub struct Keypair(pub(crate) SigningKey);

impl Keypair {
    pub fn new(signing_key: SigningKey) -> Keypair {
        Keypair(signing_key)
    }

    pub fn sign(&self, digest: &Digest) -> SignatureBytes {
        SignatureBytes::new(self.0.sign(&digest.bytes()).to_bytes())
    }

    pub fn public(&self) -> VerifyingKey {
        self.0.verifying_key()
    }
}

/// Signing callback: `digest → signature`.
pub type SignerFn = Arc<dyn Fn(&Digest) -> SignatureBytes + Send + Sync>;

/// A signature provider: the identity under which a node votes, paired with the
/// callable that produces its signatures. Block producers configure one provider per
/// producer key; a full node holds a single provider with a generated key and a
/// zeroed public key.
#[derive(Clone)]
pub struct SignatureProvider {
    public_key: VerifyingKey,
    signer: SignerFn,
}

impl SignatureProvider {
    pub fn new(public_key: VerifyingKey, signer: SignerFn) -> Self {
        Self { public_key, signer }
    }

    /// A provider whose public key matches the given signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let keypair = Keypair::new(signing_key);
        let public_key = keypair.public();
        Self {
            public_key,
            signer: Arc::new(move |digest| keypair.sign(digest)),
        }
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    pub fn sign(&self, digest: &Digest) -> SignatureBytes {
        (self.signer)(digest)
    }
}

impl Debug for SignatureProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignatureProvider({})",
            crate::logging::abbrev(self.public_key.as_bytes())
        )
    }
}

/// The all-zero public key, held by full nodes that never vote. It is a valid curve
/// point but corresponds to no configured producer, so it never appears in any
/// block's active producer set.
pub(crate) fn zeroed_public_key() -> VerifyingKey {
    VerifyingKey::from_bytes(&[0u8; 32]).expect("the zero point decompresses on ed25519")
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::*;

    #[test]
    fn provider_signature_verifies_against_its_public_key() {
        let provider = SignatureProvider::from_signing_key(SigningKey::generate(&mut OsRng));
        let digest = Digest::new([7u8; 32]);

        let signature = Signature::from_bytes(&provider.sign(&digest).bytes());
        assert!(provider
            .public_key()
            .verify(&digest.bytes(), &signature)
            .is_ok());
    }

    #[test]
    fn zeroed_public_key_is_constructible() {
        assert_eq!(zeroed_public_key().as_bytes(), &[0u8; 32]);
    }
}
