//! Paillier encryption: additively homomorphic, so encrypted ballots can be summed without ever
//! being decrypted one by one.

use crate::*;
use log::warn;
use num_bigint_dig::{BigUint, ModInverse, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, Rng};

/// Candidate primes drawn per bit of prime size before giving up
pub const PRIME_ATTEMPTS_PER_BIT: usize = 64;

/// Key pairs generated (and discarded for failing validation) before giving up
pub const KEYGEN_ATTEMPTS: usize = 8;

/// Draws allowed when looking for encryption randomness coprime to `n`
pub const ENCRYPTION_ATTEMPTS: usize = 64;

/// Smallest modulus accepted in production mode
pub const MIN_PRODUCTION_BITS: usize = 256;

/// A Paillier ciphertext, an element of `Z*_(n^2)`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ciphertext(#[serde(with = "BigUintHex")] pub BigUint);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PaillierPublicKey {
    #[serde(with = "BigUintHex")]
    pub n: BigUint,

    #[serde(with = "BigUintHex")]
    pub g: BigUint,

    #[serde(with = "BigUintHex")]
    pub n_squared: BigUint,
}

impl PaillierPublicKey {
    pub fn new(n: BigUint) -> Self {
        PaillierPublicKey {
            g: &n + 1u32,
            n_squared: &n * &n,
            n,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.n.is_even() || self.n <= BigUint::one() {
            return Err(ValidationError::MalformedKey(
                "paillier modulus must be odd".to_owned(),
            ));
        }
        if self.g != &self.n + 1u32 || self.n_squared != &self.n * &self.n {
            return Err(ValidationError::MalformedKey(
                "paillier public key is inconsistent".to_owned(),
            ));
        }
        Ok(())
    }

    /// Whether `c` is a well-formed ciphertext for this key
    pub fn contains(&self, c: &Ciphertext) -> bool {
        !c.0.is_zero() && c.0 < self.n_squared && c.0.gcd(&self.n).is_one()
    }

    // L(x) = (x - 1) / n
    fn l(&self, x: &BigUint) -> BigUint {
        (x - 1u32) / &self.n
    }
}

/// The private half. `lambda` is only ever handed to the threshold dealer.
#[derive(Clone)]
pub struct PaillierPrivateKey {
    pub(crate) lambda: BigUint,
    pub(crate) mu: BigUint,
    public: PaillierPublicKey,
}

impl PaillierPrivateKey {
    pub fn public_key(&self) -> &PaillierPublicKey {
        &self.public
    }
}

pub struct PaillierKeyPair {
    pub public: PaillierPublicKey,
    pub private: PaillierPrivateKey,
}

/// Generate a Paillier key pair with a modulus of `bits` bits.
///
/// Primes are searched with a fixed attempt limit and every pair is checked by decrypting an
/// encryption of a random test value before it is accepted. In `InsecureTestMode` a fixed,
/// publicly known pair of Mersenne primes is used instead.
pub fn generate_keypair<R: Rng + CryptoRng>(
    rng: &mut R,
    bits: usize,
    mode: SecurityMode,
) -> Result<PaillierKeyPair> {
    if mode == SecurityMode::InsecureTestMode {
        warn!("INSECURE TEST MODE: using hard-coded Paillier primes, never use this for a real election");
        let p = (BigUint::one() << 127usize) - 1u32;
        let q = (BigUint::one() << 107usize) - 1u32;
        let keypair = keypair_from_primes(&p, &q)?;
        validate_keypair(rng, &keypair)?;
        return Ok(keypair);
    }

    if bits < MIN_PRODUCTION_BITS || bits % 2 != 0 {
        return Err(ValidationError::MalformedKey(format!(
            "paillier modulus size {} must be even and at least {}",
            bits, MIN_PRODUCTION_BITS
        ))
        .into());
    }

    let prime_bits = bits / 2;
    let prime_attempts = PRIME_ATTEMPTS_PER_BIT * prime_bits;
    for attempt in 0..KEYGEN_ATTEMPTS {
        let p = random_prime(rng, prime_bits, prime_attempts)?;
        let q = random_prime(rng, prime_bits, prime_attempts)?;
        if p == q {
            continue;
        }

        let keypair = match keypair_from_primes(&p, &q) {
            Ok(keypair) => keypair,
            Err(_) => continue,
        };

        match validate_keypair(rng, &keypair) {
            Ok(()) => return Ok(keypair),
            Err(e) => warn!("discarding paillier key pair {}: {}", attempt, e),
        }
    }

    Err(CryptoFailure::KeyValidationFailed(KEYGEN_ATTEMPTS).into())
}

fn keypair_from_primes(p: &BigUint, q: &BigUint) -> Result<PaillierKeyPair> {
    let n = p * q;
    let phi = (p - 1u32) * (q - 1u32);
    if !n.gcd(&phi).is_one() {
        return Err(CryptoFailure::NotInvertible.into());
    }

    let public = PaillierPublicKey::new(n);
    let lambda = (p - 1u32).lcm(&(q - 1u32));
    let u = public.g.modpow(&lambda, &public.n_squared);
    let mu = public
        .l(&u)
        .mod_inverse(&public.n)
        .and_then(|inverse| inverse.to_biguint())
        .ok_or(CryptoFailure::NotInvertible)?;

    Ok(PaillierKeyPair {
        private: PaillierPrivateKey {
            lambda,
            mu,
            public: public.clone(),
        },
        public,
    })
}

fn validate_keypair<R: Rng + CryptoRng>(rng: &mut R, keypair: &PaillierKeyPair) -> Result<()> {
    let test_value = rng.gen_biguint_below(&keypair.public.n);
    let c = encrypt(rng, &test_value, &keypair.public)?;
    if decrypt(&c, &keypair.private)? != test_value {
        return Err(CryptoFailure::KeyValidationFailed(1).into());
    }
    Ok(())
}

/// `g^m * r^n mod n^2` with fresh randomness `r`
pub fn encrypt<R: Rng + CryptoRng>(
    rng: &mut R,
    m: &BigUint,
    public_key: &PaillierPublicKey,
) -> Result<Ciphertext> {
    if m >= &public_key.n {
        return Err(ValidationError::PlaintextOutOfRange.into());
    }
    let r = random_coprime(rng, &public_key.n, ENCRYPTION_ATTEMPTS)?;

    // g = n + 1, so g^m = 1 + m*n mod n^2
    let gm = (BigUint::one() + m * &public_key.n) % &public_key.n_squared;
    let rn = r.modpow(&public_key.n, &public_key.n_squared);
    Ok(Ciphertext((gm * rn) % &public_key.n_squared))
}

/// `L(c^lambda mod n^2) * mu mod n`
pub fn decrypt(c: &Ciphertext, private_key: &PaillierPrivateKey) -> Result<BigUint, ValidationError> {
    let public = &private_key.public;
    if !public.contains(c) {
        return Err(ValidationError::CiphertextOutOfRange(0));
    }
    let u = c.0.modpow(&private_key.lambda, &public.n_squared);
    Ok((public.l(&u) * &private_key.mu) % &public.n)
}

/// Homomorphic addition: `Dec(c1 * c2) = m1 + m2 mod n`
pub fn add_encrypted(c1: &Ciphertext, c2: &Ciphertext, public_key: &PaillierPublicKey) -> Ciphertext {
    Ciphertext((&c1.0 * &c2.0) % &public_key.n_squared)
}

/// Homomorphic scaling: `Dec(c^k) = k * m mod n`
pub fn scalar_mul(c: &Ciphertext, k: &BigUint, public_key: &PaillierPublicKey) -> Ciphertext {
    Ciphertext(c.0.modpow(k, &public_key.n_squared))
}

/// The neutral element for `add_encrypted`, a deterministic encryption of zero
pub fn encrypted_zero() -> Ciphertext {
    Ciphertext(BigUint::one())
}

/// Re-randomize a ciphertext without changing its plaintext
pub fn rerandomize<R: Rng + CryptoRng>(
    rng: &mut R,
    c: &Ciphertext,
    public_key: &PaillierPublicKey,
) -> Result<Ciphertext> {
    let r = random_coprime(rng, &public_key.n, ENCRYPTION_ATTEMPTS)?;
    let rn = r.modpow(&public_key.n, &public_key.n_squared);
    Ok(Ciphertext((&c.0 * rn) % &public_key.n_squared))
}
