// Hex encodings for the big integers, curve points and signatures we persist.
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, VerifyingKey};
use num_bigint_dig::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::convert::TryInto;
use std::marker::PhantomData;

pub use hex_buffer_serde::Hex;

// a single-purpose type for use in `#[serde(with)]`
pub enum BigUintHex {}

impl Hex<BigUint> for BigUintHex {
    type Error = String;

    fn create_bytes(value: &BigUint) -> Cow<[u8]> {
        Cow::from(value.to_bytes_be())
    }

    fn from_bytes(bytes: &[u8]) -> Result<BigUint, String> {
        Ok(BigUint::from_bytes_be(bytes))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum RistrettoHex {}

impl Hex<RistrettoPoint> for RistrettoHex {
    type Error = String;

    fn create_bytes(point: &RistrettoPoint) -> Cow<[u8]> {
        Cow::from(point.compress().to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<RistrettoPoint, String> {
        CompressedRistretto::from_slice(bytes)
            .map_err(|e| format!("{}", e))?
            .decompress()
            .ok_or_else(|| "invalid ristretto point".to_owned())
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum ScalarHex {}

impl Hex<Scalar> for ScalarHex {
    type Error = String;

    fn create_bytes(scalar: &Scalar) -> Cow<[u8]> {
        Cow::from(scalar.to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Scalar, String> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "scalar must be 32 bytes".to_owned())?;
        Option::from(Scalar::from_canonical_bytes(bytes))
            .ok_or_else(|| "non-canonical scalar".to_owned())
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum VerifyingKeyHex {}

impl Hex<VerifyingKey> for VerifyingKeyHex {
    type Error = String;

    fn create_bytes(public_key: &VerifyingKey) -> Cow<[u8]> {
        public_key.as_bytes()[..].into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<VerifyingKey, String> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "public key must be 32 bytes".to_owned())?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| format!("{}", e))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum SignatureHex {}

impl Hex<Signature> for SignatureHex {
    type Error = String;

    fn create_bytes(sig: &Signature) -> Cow<[u8]> {
        Cow::from(sig.to_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Signature, String> {
        Signature::from_slice(bytes).map_err(|e| format!("{}", e))
    }
}

// a single-purpose type for use in `#[serde(with)]`
pub enum Hash32Hex {}

impl Hex<[u8; 32]> for Hash32Hex {
    type Error = String;

    fn create_bytes(hash: &[u8; 32]) -> Cow<[u8]> {
        hash[..].into()
    }

    fn from_bytes(bytes: &[u8]) -> Result<[u8; 32], String> {
        bytes
            .try_into()
            .map_err(|_| "expected 32 bytes".to_owned())
    }
}

// Lets a `Hex` impl encode the elements of a `Vec` or the inside of an `Option`.
struct HexRef<'a, H, T>(&'a T, PhantomData<H>);

impl<H: Hex<T>, T> Serialize for HexRef<'_, H, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        H::serialize(self.0, serializer)
    }
}

struct HexOwned<H, T>(T, PhantomData<H>);

impl<'de, H: Hex<T>, T> Deserialize<'de> for HexOwned<H, T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        H::deserialize(deserializer).map(|value| HexOwned(value, PhantomData))
    }
}

fn serialize_seq<H: Hex<T>, T, S: Serializer>(
    values: &[T],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|v| HexRef::<H, T>(v, PhantomData)))
}

fn deserialize_seq<'de, H: Hex<T>, T, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<T>, D::Error> {
    let values = Vec::<HexOwned<H, T>>::deserialize(deserializer)?;
    Ok(values.into_iter().map(|v| v.0).collect())
}

/// `#[serde(with)]` for `Vec<Scalar>`
pub mod scalar_hex_seq {
    use super::*;

    pub fn serialize<S: Serializer>(values: &[Scalar], serializer: S) -> Result<S::Ok, S::Error> {
        serialize_seq::<ScalarHex, _, _>(values, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Scalar>, D::Error> {
        deserialize_seq::<ScalarHex, _, _>(deserializer)
    }
}

/// `#[serde(with)]` for `Vec<RistrettoPoint>`
pub mod ristretto_hex_seq {
    use super::*;

    pub fn serialize<S: Serializer>(
        values: &[RistrettoPoint],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serialize_seq::<RistrettoHex, _, _>(values, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<RistrettoPoint>, D::Error> {
        deserialize_seq::<RistrettoHex, _, _>(deserializer)
    }
}

/// `#[serde(with)]` for `Option<Signature>`
pub mod signature_hex_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Signature>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(sig) => serializer.serialize_some(&HexRef::<SignatureHex, _>(sig, PhantomData)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Signature>, D::Error> {
        let value = Option::<HexOwned<SignatureHex, Signature>>::deserialize(deserializer)?;
        Ok(value.map(|v| v.0))
    }
}
