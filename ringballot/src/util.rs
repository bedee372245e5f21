use crate::{CryptoFailure, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use num_bigint_dig::{BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};
use sha2::{Digest, Sha256};

/// Miller-Rabin rounds used for every primality test in the crate
pub const PRIMALITY_ROUNDS: usize = 32;

/// Generate an ed25519 keypair for a ledger authority
pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
    let mut csprng = rand::rngs::OsRng {};
    let secret = SigningKey::generate(&mut csprng);
    let public = secret.verifying_key();
    (secret, public)
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Draw a value in `[1, n)` that is coprime to `n`, giving up after `attempts` draws.
pub fn random_coprime<R: Rng + CryptoRng>(
    rng: &mut R,
    n: &BigUint,
    attempts: usize,
) -> Result<BigUint> {
    for _ in 0..attempts {
        let candidate = rng.gen_biguint_below(n);
        if candidate.is_zero() {
            continue;
        }
        if candidate.gcd(n).is_one() {
            return Ok(candidate);
        }
    }
    Err(CryptoFailure::CoprimeSearchExhausted(attempts).into())
}

/// Search for a random prime of exactly `bits` bits.
///
/// Candidates have their two top bits set (so the product of two of them has exactly `2 * bits`
/// bits) and the low bit set. The search gives up after `attempts` candidates.
pub fn random_prime<R: Rng + CryptoRng>(
    rng: &mut R,
    bits: usize,
    attempts: usize,
) -> Result<BigUint> {
    debug_assert!(bits >= 8);
    let top = (BigUint::one() << (bits - 1)) | (BigUint::one() << (bits - 2));
    for _ in 0..attempts {
        let candidate = rng.gen_biguint(bits) | &top | BigUint::one();
        if num_bigint_dig::prime::probably_prime(&candidate, PRIMALITY_ROUNDS) {
            return Ok(candidate);
        }
    }
    Err(CryptoFailure::PrimeSearchExhausted(attempts).into())
}

pub fn factorial(n: usize) -> BigUint {
    (1..=n).fold(BigUint::one(), |acc, i| acc * BigUint::from(i as u64))
}
