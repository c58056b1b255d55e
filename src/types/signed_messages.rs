/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Multi-signed messages.
//!
//! Every message on the wire is a [`Signed<T>`]: a payload plus a non-empty list of
//! [`SignatureEntry`]s. The signing target of a payload is its [`digest`](Payload::digest),
//! a SHA-256 over a one-byte domain tag followed by the payload's borsh bytes. The tag
//! keeps signatures over distinct message kinds from being replayable across kinds.
//!
//! Ed25519 offers no public-key recovery, so each signature entry carries its signer's
//! verifying key. [`public_keys`](Signed::public_keys) returns the claimed signer set;
//! [`verify`](Signed::verify) checks every entry against the payload digest.
//!
//! A message signed by n keys is equivalent to n messages each signed by one key.
//! [`split`](Signed::split) produces those per-signer singletons; the round state machine
//! validates and aggregates each independently while the multi-signed original is kept
//! for gossip.

use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{Digest, SignatureBytes};
use super::crypto_primitives::{
    CryptoHasher, Sha2Digest, Signature, SignatureProvider, Verifier, VerifyingKey,
};

/// A message body that can be signed: borsh-serializable, with a domain tag unique to
/// its kind.
pub trait Payload: BorshSerialize + Clone {
    const TAG: u8;

    /// The signing target: SHA-256 over the domain tag and the borsh bytes of the body.
    fn digest(&self) -> Digest {
        let mut hasher = CryptoHasher::new();
        hasher.update([Self::TAG]);
        hasher.update(borsh::to_vec(self).expect("serializing an in-memory payload cannot fail"));
        Digest::new(hasher.finalize().into())
    }
}

/// One signer's signature over a payload digest.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SignatureEntry {
    pub signer: VerifyingKey,
    pub signature: SignatureBytes,
}

impl SignatureEntry {
    /// Whether `signature` is a signature by `signer` over `digest`.
    pub fn is_valid(&self, digest: &Digest) -> bool {
        let signature = Signature::from_bytes(&self.signature.bytes());
        self.signer.verify(&digest.bytes(), &signature).is_ok()
    }
}

impl BorshSerialize for SignatureEntry {
    fn serialize<W: io::Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.signer.as_bytes())?;
        writer.write_all(&self.signature.bytes())
    }
}

impl BorshDeserialize for SignatureEntry {
    fn deserialize_reader<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let mut key_bytes = [0u8; 32];
        reader.read_exact(&mut key_bytes)?;
        let signer = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut sig_bytes = [0u8; 64];
        reader.read_exact(&mut sig_bytes)?;
        Ok(Self {
            signer,
            signature: SignatureBytes::new(sig_bytes),
        })
    }
}

/// A payload together with the signatures of one or more signers.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signed<T> {
    pub data: T,
    pub signatures: Vec<SignatureEntry>,
}

impl<T: Payload> Signed<T> {
    /// Sign `data` with each of the given providers.
    pub fn new(data: T, providers: &[SignatureProvider]) -> Self {
        let digest = data.digest();
        let signatures = providers
            .iter()
            .map(|provider| SignatureEntry {
                signer: *provider.public_key(),
                signature: provider.sign(&digest),
            })
            .collect();
        Self { data, signatures }
    }

    pub fn digest(&self) -> Digest {
        self.data.digest()
    }

    /// Hash over the payload *and* the signatures. This is the dedup-cache key: the same
    /// body signed by different keys must not collide.
    pub fn message_hash(&self) -> Digest {
        let mut hasher = CryptoHasher::new();
        hasher.update([T::TAG]);
        hasher.update(
            borsh::to_vec(&self.data).expect("serializing an in-memory payload cannot fail"),
        );
        for entry in &self.signatures {
            hasher.update(entry.signer.as_bytes());
            hasher.update(entry.signature.bytes());
        }
        Digest::new(hasher.finalize().into())
    }

    /// The claimed signer set, in signature order.
    pub fn public_keys(&self) -> Vec<VerifyingKey> {
        self.signatures.iter().map(|entry| entry.signer).collect()
    }

    /// Whether the signature list is non-empty and every entry verifies against the
    /// payload digest.
    pub fn verify(&self) -> bool {
        if self.signatures.is_empty() {
            return false;
        }
        let digest = self.digest();
        self.signatures.iter().all(|entry| entry.is_valid(&digest))
    }

    /// Per-signer singletons of this message.
    pub fn split(&self) -> impl Iterator<Item = Signed<T>> + '_ {
        self.signatures.iter().map(|entry| Signed {
            data: self.data.clone(),
            signatures: vec![*entry],
        })
    }
}

#[cfg(test)]
mod tests {
    use borsh::{BorshDeserialize, BorshSerialize};
    use rand_core::OsRng;

    use crate::types::crypto_primitives::SigningKey;

    use super::*;

    #[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
    struct Ping(u32);

    impl Payload for Ping {
        const TAG: u8 = 0xf0;
    }

    fn provider() -> SignatureProvider {
        SignatureProvider::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    #[test]
    fn multi_signed_message_verifies_and_splits() {
        let providers = [provider(), provider(), provider()];
        let msg = Signed::new(Ping(9), &providers);

        assert!(msg.verify());
        assert_eq!(msg.public_keys().len(), 3);

        let singles: Vec<_> = msg.split().collect();
        assert_eq!(singles.len(), 3);
        for (single, expected) in singles.iter().zip(providers.iter()) {
            assert!(single.verify());
            assert_eq!(&single.public_keys()[0], expected.public_key());
        }
    }

    #[test]
    fn empty_signature_list_does_not_verify() {
        let msg = Signed {
            data: Ping(1),
            signatures: vec![],
        };
        assert!(!msg.verify());
    }

    #[test]
    fn tampered_payload_does_not_verify() {
        let mut msg = Signed::new(Ping(1), &[provider()]);
        msg.data = Ping(2);
        assert!(!msg.verify());
    }

    #[test]
    fn message_hash_distinguishes_signers() {
        let ping = Ping(5);
        let a = Signed::new(ping.clone(), &[provider()]);
        let b = Signed::new(ping, &[provider()]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.message_hash(), b.message_hash());
    }

    #[test]
    fn signed_round_trips_through_borsh() {
        let msg = Signed::new(Ping(77), &[provider(), provider()]);
        let bytes = borsh::to_vec(&msg).unwrap();
        let decoded = Signed::<Ping>::try_from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.verify());
    }
}
