//! Linkable ring signatures over the Ristretto group.
//!
//! A signature proves that one member of the ring signed the message without revealing which.
//! Every signature carries a key image `I = x * Hp(P)`, which depends only on the signer's key:
//! two signatures with the same key image come from the same signer, which is how double votes
//! are caught without deanonymizing anyone.

use crate::*;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha512};
use std::collections::HashSet;

/// Public key of a ring member
pub type RingPublicKey = RistrettoPoint;

/// Safety net for hash-to-point. Each attempt succeeds with probability well above 1/8, so this
/// bound is never reached in practice.
pub const HASH_TO_POINT_ATTEMPTS: usize = 1024;

const HASH_TO_POINT_DOMAIN: &[u8] = b"ringballot/hash-to-point/v1";
const CHALLENGE_DOMAIN: &[u8] = b"ringballot/ring-challenge/v1";

/// A voter's ring key pair
#[derive(Clone)]
pub struct RingKeyPair {
    secret: Scalar,
    public: RingPublicKey,
}

impl RingKeyPair {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(Scalar::random(rng))
    }

    pub fn from_secret(secret: Scalar) -> Self {
        RingKeyPair {
            secret,
            public: RistrettoPoint::mul_base(&secret),
        }
    }

    pub fn public_key(&self) -> RingPublicKey {
        self.public
    }

    /// `x * Hp(P)`. Deterministic for a given key pair.
    pub fn key_image(&self) -> Result<RistrettoPoint> {
        Ok(self.secret * hash_to_point(&self.public)?)
    }
}

/// Hash a public key onto the curve by rejection sampling.
///
/// We hash `(domain, P, counter)` with SHA-512, read the first 32 bytes as a candidate encoding
/// and keep the first one that decodes to a non-identity point. There is no fallback point.
pub fn hash_to_point(public_key: &RingPublicKey) -> Result<RistrettoPoint> {
    let compressed = public_key.compress();
    for counter in 0..HASH_TO_POINT_ATTEMPTS {
        let digest = Sha512::new()
            .chain_update(HASH_TO_POINT_DOMAIN)
            .chain_update(compressed.as_bytes())
            .chain_update((counter as u32).to_le_bytes())
            .finalize();

        let mut candidate = [0u8; 32];
        candidate.copy_from_slice(&digest[..32]);
        candidate[31] &= 0x7f;

        if let Some(point) = CompressedRistretto(candidate).decompress() {
            if point != RistrettoPoint::identity() {
                return Ok(point);
            }
        }
    }
    Err(CryptoFailure::HashToCurveExhausted(HASH_TO_POINT_ATTEMPTS).into())
}

/// A linkable ring signature, as persisted inside a ballot
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RingSignature {
    #[serde(with = "scalar_hex_seq")]
    pub challenges: Vec<Scalar>,

    #[serde(with = "scalar_hex_seq")]
    pub responses: Vec<Scalar>,

    #[serde(with = "RistrettoHex")]
    pub key_image: RistrettoPoint,

    #[serde(with = "ristretto_hex_seq")]
    pub public_keys: Vec<RingPublicKey>,
}

impl RingSignature {
    /// Two signatures are linked when they were produced by the same private key
    pub fn is_linked(&self, other: &RingSignature) -> bool {
        self.key_image == other.key_image
    }

    pub fn key_image_bytes(&self) -> [u8; 32] {
        self.key_image.compress().to_bytes()
    }
}

// Hashes everything that is fixed for the whole ring; each link only appends (L, R).
fn challenge_prefix(message: &[u8], ring: &[RingPublicKey], key_image: &RistrettoPoint) -> Sha512 {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_DOMAIN);
    hasher.update((ring.len() as u64).to_le_bytes());
    for member in ring {
        hasher.update(member.compress().as_bytes());
    }
    hasher.update(key_image.compress().as_bytes());
    hasher.update((message.len() as u64).to_le_bytes());
    hasher.update(message);
    hasher
}

fn challenge(prefix: &Sha512, l: &RistrettoPoint, r: &RistrettoPoint) -> Scalar {
    let hasher = prefix
        .clone()
        .chain_update(l.compress().as_bytes())
        .chain_update(r.compress().as_bytes());
    Scalar::from_hash(hasher)
}

fn check_ring(ring: &[RingPublicKey]) -> Result<(), ValidationError> {
    if ring.len() < 2 {
        return Err(ValidationError::RingTooSmall(ring.len()));
    }
    let mut seen = HashSet::with_capacity(ring.len());
    for member in ring {
        if !seen.insert(member.compress().to_bytes()) {
            return Err(ValidationError::MalformedKey(
                "duplicate ring member".to_owned(),
            ));
        }
    }
    Ok(())
}

/// Sign `message` as a member of `ring`.
///
/// The signature is verified before it is returned; one that does not close is an error.
pub fn sign<R: Rng + CryptoRng>(
    rng: &mut R,
    message: &[u8],
    signer: &RingKeyPair,
    ring: &[RingPublicKey],
) -> Result<RingSignature> {
    check_ring(ring)?;
    let n = ring.len();
    let s = ring
        .iter()
        .position(|member| *member == signer.public)
        .ok_or(ValidationError::SignerNotInRing)?;

    let hashed: Vec<RistrettoPoint> = ring.iter().map(hash_to_point).collect::<Result<_>>()?;
    let key_image = signer.secret * hashed[s];
    let prefix = challenge_prefix(message, ring, &key_image);

    let mut challenges = vec![Scalar::ZERO; n];
    let mut responses = vec![Scalar::ZERO; n];

    let alpha = Scalar::random(rng);
    let l_s = RistrettoPoint::mul_base(&alpha);
    let r_s = alpha * hashed[s];
    challenges[(s + 1) % n] = challenge(&prefix, &l_s, &r_s);

    let mut i = (s + 1) % n;
    while i != s {
        responses[i] = Scalar::random(rng);
        let l_i = RistrettoPoint::mul_base(&responses[i]) + challenges[i] * ring[i];
        let r_i = responses[i] * hashed[i] + challenges[i] * key_image;
        challenges[(i + 1) % n] = challenge(&prefix, &l_i, &r_i);
        i = (i + 1) % n;
    }

    // Close the ring
    responses[s] = alpha - challenges[s] * signer.secret;

    let signature = RingSignature {
        challenges,
        responses,
        key_image,
        public_keys: ring.to_vec(),
    };

    if !verify_links(message, &signature, &hashed) {
        return Err(CryptoFailure::RingNotClosed.into());
    }

    Ok(signature)
}

/// Verify a ring signature over `message`
pub fn verify(message: &[u8], signature: &RingSignature) -> bool {
    let n = signature.public_keys.len();
    if check_ring(&signature.public_keys).is_err()
        || signature.challenges.len() != n
        || signature.responses.len() != n
        || signature.key_image == RistrettoPoint::identity()
    {
        return false;
    }

    let hashed: Vec<RistrettoPoint> = match signature
        .public_keys
        .iter()
        .map(hash_to_point)
        .collect::<Result<_>>()
    {
        Ok(hashed) => hashed,
        Err(_) => return false,
    };

    verify_links(message, signature, &hashed)
}

// Recompute every (L_i, R_i) and check that each one hashes to the next published challenge.
fn verify_links(message: &[u8], signature: &RingSignature, hashed: &[RistrettoPoint]) -> bool {
    let ring = &signature.public_keys;
    let n = ring.len();
    let prefix = challenge_prefix(message, ring, &signature.key_image);

    for i in 0..n {
        let c_i = signature.challenges[i];
        let r_i = signature.responses[i];
        let l = RistrettoPoint::mul_base(&r_i) + c_i * ring[i];
        let r = r_i * hashed[i] + c_i * signature.key_image;
        if challenge(&prefix, &l, &r) != signature.challenges[(i + 1) % n] {
            return false;
        }
    }
    true
}
