//! Threshold Paillier decryption with a trusted dealer.
//!
//! The dealer shares the decryption exponent `d = lambda * mu`, which satisfies `d = 0 mod lambda`
//! and `d = 1 mod n`, with Shamir's scheme over the integers modulo `n * lambda`. Each authority
//! raises the aggregate ciphertext to its share; any `t` partial decryptions are combined by
//! Lagrange interpolation in the exponent, scaled by `Δ = parties!` so every coefficient is an
//! integer. Neither `lambda` nor `mu` is needed once the shares are dealt.

use crate::*;
use log::{debug, warn};
use num_bigint_dig::{BigInt, BigUint, ModInverse, RandBigInt, Sign};
use num_traits::{One, Signed, Zero};
use rand::{CryptoRng, Rng};
use std::collections::BTreeMap;

/// Upper bound on share holders, keeps `parties!` reasonable
pub const MAX_PARTIES: usize = 64;

/// One authority's share of the decryption exponent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyShare {
    /// Evaluation point, starting at 1
    pub index: usize,

    #[serde(with = "BigUintHex")]
    pub value: BigUint,

    /// Paillier modulus of the key this share belongs to
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    pub threshold: usize,
    pub parties: usize,
}

impl KeyShare {
    pub fn check_key(&self, public_key: &PaillierPublicKey) -> Result<(), ValidationError> {
        if self.n != public_key.n {
            return Err(ValidationError::ForeignKeyShare(self.index));
        }
        Ok(())
    }
}

/// `c^share mod n^2`, one authority's contribution to a decryption
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartialDecryption {
    pub index: usize,

    #[serde(with = "BigUintHex")]
    pub value: BigUint,
}

fn check_threshold(threshold: usize, parties: usize) -> Result<(), ValidationError> {
    if threshold == 0 || threshold > parties || parties > MAX_PARTIES {
        return Err(ValidationError::InvalidThreshold { threshold, parties });
    }
    Ok(())
}

/// Split the private key into `parties` shares, any `threshold` of which can decrypt.
pub fn generate_key_shares<R: Rng + CryptoRng>(
    rng: &mut R,
    private_key: &PaillierPrivateKey,
    parties: usize,
    threshold: usize,
) -> Result<Vec<KeyShare>> {
    check_threshold(threshold, parties)?;

    let n = &private_key.public_key().n;
    let modulus = n * &private_key.lambda;
    let secret = (&private_key.lambda * &private_key.mu) % &modulus;

    // f(x) = secret + a_1 x + ... + a_(t-1) x^(t-1)
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(secret);
    for _ in 1..threshold {
        coefficients.push(rng.gen_biguint_below(&modulus));
    }

    let shares = (1..=parties)
        .map(|index| {
            let x = BigUint::from(index as u64);
            // Horner evaluation
            let value = coefficients
                .iter()
                .rev()
                .fold(BigUint::zero(), |acc, a| (acc * &x + a) % &modulus);
            KeyShare {
                index,
                value,
                n: n.clone(),
                threshold,
                parties,
            }
        })
        .collect();

    Ok(shares)
}

/// `c^share mod n^2`
pub fn create_partial_decryption(
    ciphertext: &Ciphertext,
    share: &KeyShare,
) -> Result<PartialDecryption, ValidationError> {
    let public_key = PaillierPublicKey::new(share.n.clone());
    if !public_key.contains(ciphertext) {
        return Err(ValidationError::CiphertextOutOfRange(share.index));
    }
    Ok(PartialDecryption {
        index: share.index,
        value: ciphertext.0.modpow(&share.value, &public_key.n_squared),
    })
}

/// Combine partial decryptions of one ciphertext into its plaintext.
///
/// Malformed partials (bad index, out of range) and repeated indices are ignored; if fewer
/// than `threshold` distinct valid partials remain this fails with `ThresholdInsufficient`.
pub fn combine_partial_decryptions(
    partials: &[PartialDecryption],
    public_key: &PaillierPublicKey,
    threshold: usize,
    parties: usize,
) -> Result<BigUint> {
    check_threshold(threshold, parties)?;

    let mut usable: BTreeMap<usize, &PartialDecryption> = BTreeMap::new();
    for partial in partials {
        if partial.index == 0 || partial.index > parties {
            warn!("ignoring partial decryption with index {}", partial.index);
            continue;
        }
        if !public_key.contains(&Ciphertext(partial.value.clone())) {
            warn!("ignoring out-of-range partial decryption {}", partial.index);
            continue;
        }
        if usable.insert(partial.index, partial).is_some() {
            warn!("ignoring repeated partial decryption {}", partial.index);
        }
    }

    if usable.len() < threshold {
        return Err(Error::ThresholdInsufficient {
            needed: threshold,
            found: usable.len(),
        });
    }

    let chosen: Vec<PartialDecryption> = usable
        .into_iter()
        .take(threshold)
        .map(|(_, p)| p.clone())
        .collect();
    debug!(
        "combining partial decryptions {:?}",
        chosen.iter().map(|p| p.index).collect::<Vec<_>>()
    );

    interpolate(&chosen, public_key, parties)
}

// Lagrange interpolation at zero in the exponent, over exactly the given partials.
fn interpolate(
    partials: &[PartialDecryption],
    public_key: &PaillierPublicKey,
    parties: usize,
) -> Result<BigUint> {
    let n_squared = &public_key.n_squared;
    let delta = factorial(parties);

    let mut combined = BigUint::one();
    for partial in partials {
        let i = partial.index as i64;
        let mut numerator = BigInt::from_biguint(Sign::Plus, delta.clone());
        let mut denominator = BigInt::one();
        for other in partials {
            let j = other.index as i64;
            if j == i {
                continue;
            }
            numerator *= BigInt::from(j);
            denominator *= BigInt::from(j - i);
        }
        // Exact: Δ makes every Lagrange coefficient integral
        let coefficient = numerator / denominator;

        let base = if coefficient.is_negative() {
            partial
                .value
                .clone()
                .mod_inverse(n_squared)
                .and_then(|inverse| inverse.to_biguint())
                .ok_or(CryptoFailure::NotInvertible)?
        } else {
            partial.value.clone()
        };
        let exponent = coefficient
            .abs()
            .to_biguint()
            .ok_or(CryptoFailure::NotInvertible)?;

        combined = (combined * base.modpow(&exponent, n_squared)) % n_squared;
    }

    // combined = c^(Δ d) = 1 + Δ m n  (mod n^2)
    let l = (combined - 1u32) / &public_key.n;
    let delta_inverse = delta
        .mod_inverse(&public_key.n)
        .and_then(|inverse| inverse.to_biguint())
        .ok_or(CryptoFailure::NotInvertible)?;
    Ok((l * delta_inverse) % &public_key.n)
}
