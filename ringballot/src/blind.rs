//! RSA blind signatures.
//!
//! A voter blinds the hash of their ballot commitment with a random factor `r`, the election
//! authority signs the blinded value without learning the commitment, and the voter unblinds the
//! result into an ordinary RSA signature over `H(commitment)`. The authority tracks *who* it
//! signed for (one signature per voter per election), never *what* it signed.

use crate::*;
use log::{info, warn};
use num_bigint_dig::{BigUint, ModInverse};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// How many random draws we allow when looking for a blinding factor coprime to `n`
pub const BLINDING_ATTEMPTS: usize = 64;

/// Smallest RSA modulus we accept from an authority
pub const MIN_MODULUS_BITS: usize = 512;

/// The election authority's public RSA key
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthorityPublicKey {
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    #[serde(with = "BigUintHex")]
    pub e: BigUint,
}

impl AuthorityPublicKey {
    /// Build a public key, rejecting malformed parameters
    pub fn new(n: BigUint, e: BigUint) -> Result<Self, ValidationError> {
        let key = AuthorityPublicKey { n, e };
        key.validate()?;
        Ok(key)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.n.bits() < MIN_MODULUS_BITS {
            return Err(ValidationError::MalformedKey(format!(
                "modulus has {} bits, need at least {}",
                self.n.bits(),
                MIN_MODULUS_BITS
            )));
        }
        if self.n.is_even() {
            return Err(ValidationError::MalformedKey("modulus is even".to_owned()));
        }
        if self.e.is_even() || self.e <= BigUint::one() || self.e >= self.n {
            return Err(ValidationError::MalformedKey(
                "public exponent out of range".to_owned(),
            ));
        }
        RsaPublicKey::new(self.n.clone(), self.e.clone())
            .map_err(|e| ValidationError::MalformedKey(e.to_string()))?;
        Ok(())
    }

    /// Full-domain hash of `message` into `Z_n`.
    ///
    /// SHA-256 is run in counter mode until we have 128 bits more than the modulus, then reduced.
    pub fn hash_message(&self, message: &[u8]) -> BigUint {
        let wanted = (self.n.bits() + 128 + 7) / 8;
        let mut expanded = Vec::with_capacity(wanted + 32);
        let mut counter: u32 = 0;
        while expanded.len() < wanted {
            let mut hasher = Sha256::new();
            hasher.update(b"ringballot/blind-fdh");
            hasher.update(counter.to_be_bytes());
            hasher.update(message);
            expanded.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        expanded.truncate(wanted);
        BigUint::from_bytes_be(&expanded) % &self.n
    }
}

/// The authority's RSA key pair. The private exponent never leaves this struct.
#[derive(Clone)]
pub struct AuthorityKeyPair {
    public: AuthorityPublicKey,
    d: BigUint,
}

impl AuthorityKeyPair {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(rng, bits)
            .map_err(|e| CryptoFailure::RsaKeyGeneration(e.to_string()))?;
        let public = AuthorityPublicKey::new(private.n().clone(), private.e().clone())?;
        Ok(AuthorityKeyPair {
            public,
            d: private.d().clone(),
        })
    }

    pub fn public_key(&self) -> &AuthorityPublicKey {
        &self.public
    }
}

/// Pick a random blinding factor `r` coprime to `n`, returning `(r, r^-1 mod n)`.
pub fn generate_blinding_factor<R: Rng + CryptoRng>(
    rng: &mut R,
    public_key: &AuthorityPublicKey,
) -> Result<(BigUint, BigUint)> {
    public_key.validate()?;
    let r = random_coprime(rng, &public_key.n, BLINDING_ATTEMPTS)?;
    let r_inverse = r
        .clone()
        .mod_inverse(&public_key.n)
        .and_then(|inverse| inverse.to_biguint())
        .ok_or(CryptoFailure::NotInvertible)?;
    Ok((r, r_inverse))
}

/// `H(message) * r^e mod n`
pub fn blind(message: &[u8], r: &BigUint, public_key: &AuthorityPublicKey) -> BigUint {
    let hashed = public_key.hash_message(message);
    (hashed * r.modpow(&public_key.e, &public_key.n)) % &public_key.n
}

/// `blinded^d mod n`. The signer never sees the message behind `blinded`.
pub fn sign(blinded: &BigUint, keypair: &AuthorityKeyPair) -> Result<BigUint, ValidationError> {
    if blinded.is_zero() || blinded >= &keypair.public.n {
        return Err(ValidationError::MalformedBallot(
            "blinded value outside Z_n".to_owned(),
        ));
    }
    Ok(blinded.modpow(&keypair.d, &keypair.public.n))
}

/// `blind_signature * r^-1 mod n`
pub fn unblind(
    blind_signature: &BigUint,
    r_inverse: &BigUint,
    public_key: &AuthorityPublicKey,
) -> BigUint {
    (blind_signature * r_inverse) % &public_key.n
}

/// Check `signature^e mod n == H(message) mod n`
pub fn verify(message: &[u8], signature: &BigUint, public_key: &AuthorityPublicKey) -> bool {
    if public_key.validate().is_err() || signature >= &public_key.n {
        return false;
    }
    signature.modpow(&public_key.e, &public_key.n) == public_key.hash_message(message)
}

/// Voter-local state for one blind-signature exchange. Never persisted or sent anywhere except
/// the `blinded_hash`.
pub struct BlindSignatureSession {
    message: Vec<u8>,
    r: BigUint,
    r_inverse: BigUint,
    pub blinded_hash: BigUint,
    issued_signature: Option<BigUint>,
    expires_at: u64,
}

impl BlindSignatureSession {
    /// Blind `message` for `public_key`. The session is usable for `ttl_millis`.
    pub fn start<R: Rng + CryptoRng>(
        rng: &mut R,
        message: &[u8],
        public_key: &AuthorityPublicKey,
        clock: &dyn Clock,
        ttl_millis: u64,
    ) -> Result<Self> {
        let (r, r_inverse) = generate_blinding_factor(rng, public_key)?;
        let blinded_hash = blind(message, &r, public_key);
        Ok(BlindSignatureSession {
            message: message.to_vec(),
            r,
            r_inverse,
            blinded_hash,
            issued_signature: None,
            expires_at: clock.now_millis().saturating_add(ttl_millis),
        })
    }

    /// Unblind the authority's answer and check it against our message.
    pub fn finish(
        &mut self,
        blind_signature: &BigUint,
        public_key: &AuthorityPublicKey,
        clock: &dyn Clock,
    ) -> Result<BigUint> {
        if clock.now_millis() > self.expires_at {
            return Err(Error::SessionExpired);
        }
        let signature = unblind(blind_signature, &self.r_inverse, public_key);
        if !verify(&self.message, &signature, public_key) {
            return Err(ValidationError::BlindSignatureInvalid.into());
        }
        self.issued_signature = Some(signature.clone());
        Ok(signature)
    }

    pub fn blinding_factor(&self) -> &BigUint {
        &self.r
    }

    pub fn issued_signature(&self) -> Option<&BigUint> {
        self.issued_signature.as_ref()
    }
}

/// The authority side of blind authorization.
pub struct BlindAuthorizer {
    keypair: AuthorityKeyPair,
    registry: Arc<dyn VoterRegistry>,
    issued: Mutex<HashSet<(Uuid, Uuid)>>,
}

impl BlindAuthorizer {
    pub fn new(keypair: AuthorityKeyPair, registry: Arc<dyn VoterRegistry>) -> Self {
        BlindAuthorizer {
            keypair,
            registry,
            issued: Mutex::new(HashSet::new()),
        }
    }

    pub fn public_key(&self) -> &AuthorityPublicKey {
        self.keypair.public_key()
    }

    /// Sign `blinded_hash` on behalf of `voter`, at most once per election.
    pub fn request_authorization(
        &self,
        election: Uuid,
        voter: Uuid,
        blinded_hash: &BigUint,
    ) -> Result<BigUint> {
        if !self.registry.is_eligible(election, voter) {
            warn!("authorization refused: voter {} not eligible for {}", voter, election);
            return Err(Error::NotEligible(voter));
        }

        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        if issued.contains(&(election, voter)) {
            warn!("authorization refused: voter {} already authorized for {}", voter, election);
            return Err(Error::DuplicateAuthorization { election, voter });
        }

        let signature = sign(blinded_hash, &self.keypair)?;
        issued.insert((election, voter));
        info!("issued blind authorization for election {}", election);

        Ok(signature)
    }
}
