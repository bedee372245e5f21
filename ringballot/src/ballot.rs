use crate::*;
use num_bigint_dig::BigUint;
use std::collections::HashSet;
use uuid::Uuid;

const COMMITMENT_DOMAIN: &[u8] = b"ringballot-commitment-v1";
const RING_MESSAGE_DOMAIN: &[u8] = b"ringballot-ring-message-v1";

/// A submitted ballot: encrypted choices, the authority's (unblinded) signature over their
/// commitment, and a ring signature by one of the registered voters.
///
/// Immutable once it is embedded in a block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub election: Uuid,

    /// One Paillier ciphertext per candidate, each encrypting 0 or 1
    pub candidate_vector: Vec<Ciphertext>,

    #[serde(with = "Hash32Hex")]
    pub voter_commitment: [u8; 32],

    /// RSA signature over `voter_commitment` issued blindly by the authority
    #[serde(with = "BigUintHex")]
    pub blind_signature_proof: BigUint,

    pub ring_signature: RingSignature,

    /// Milliseconds since the unix epoch
    pub submitted_at: u64,
}

impl Ballot {
    pub fn key_image(&self) -> [u8; 32] {
        self.ring_signature.key_image_bytes()
    }

    pub fn key_image_hex(&self) -> String {
        hex::encode(self.key_image())
    }

    /// The bytes the ring signature is computed over
    pub fn ring_message(&self) -> [u8; 32] {
        ring_message(
            self.election,
            &self.voter_commitment,
            &self.blind_signature_proof,
            self.submitted_at,
        )
    }

    /// Check everything about this ballot that does not depend on ledger state or time:
    /// shape, ciphertext ranges, commitment, authority signature, ring membership and ring
    /// signature.
    pub fn verify(&self, params: &ElectionParameters) -> Result<(), ValidationError> {
        if self.election != params.metadata.id {
            return Err(ValidationError::MalformedBallot(format!(
                "ballot is for election {}, expected {}",
                self.election, params.metadata.id
            )));
        }

        let expected = params.metadata.candidates;
        if self.candidate_vector.len() != expected {
            return Err(ValidationError::CandidateCountMismatch {
                expected,
                found: self.candidate_vector.len(),
            });
        }

        for (i, c) in self.candidate_vector.iter().enumerate() {
            if !params.paillier.contains(c) {
                return Err(ValidationError::CiphertextOutOfRange(i));
            }
        }

        if commitment(self.election, &self.candidate_vector) != self.voter_commitment {
            return Err(ValidationError::CommitmentMismatch);
        }

        if !blind::verify(
            &self.voter_commitment,
            &self.blind_signature_proof,
            &params.authority,
        ) {
            return Err(ValidationError::BlindSignatureInvalid);
        }

        if !same_ring(&self.ring_signature.public_keys, &params.voters) {
            return Err(ValidationError::RingMismatch);
        }

        if !ring::verify(&self.ring_message(), &self.ring_signature) {
            return Err(ValidationError::RingSignatureInvalid);
        }

        Ok(())
    }

    /// Reject ballots older than `max_age_ms`, or stamped more than `max_skew_ms` in the future.
    pub fn check_freshness(
        &self,
        now: u64,
        max_age_ms: u64,
        max_skew_ms: u64,
    ) -> Result<(), ValidationError> {
        let too_old = now.saturating_sub(self.submitted_at) > max_age_ms;
        let too_new = self.submitted_at > now.saturating_add(max_skew_ms);
        if too_old || too_new {
            return Err(ValidationError::StaleBallot {
                submitted_at: self.submitted_at,
                now,
            });
        }
        Ok(())
    }
}

/// `SHA-256(domain, election, c_1 .. c_k)`, what the authority blind-signs
pub fn commitment(election: Uuid, candidate_vector: &[Ciphertext]) -> [u8; 32] {
    let encoded: Vec<Vec<u8>> = candidate_vector.iter().map(|c| c.0.to_bytes_be()).collect();
    let mut parts: Vec<&[u8]> = vec![COMMITMENT_DOMAIN, &election.as_bytes()[..]];
    parts.extend(encoded.iter().map(|e| e.as_slice()));
    sha256(&parts)
}

/// The message a voter ring-signs. The commitment already binds the candidate vector.
pub fn ring_message(
    election: Uuid,
    voter_commitment: &[u8; 32],
    blind_signature_proof: &BigUint,
    submitted_at: u64,
) -> [u8; 32] {
    sha256(&[
        RING_MESSAGE_DOMAIN,
        &election.as_bytes()[..],
        &voter_commitment[..],
        &blind_signature_proof.to_bytes_be()[..],
        &submitted_at.to_be_bytes()[..],
    ])
}

// Ring order is up to the voter, membership is not.
fn same_ring(ring: &[RingPublicKey], registered: &[RingPublicKey]) -> bool {
    if ring.len() != registered.len() {
        return false;
    }
    let registered: HashSet<[u8; 32]> = registered.iter().map(|p| p.compress().to_bytes()).collect();
    let ring: HashSet<[u8; 32]> = ring.iter().map(|p| p.compress().to_bytes()).collect();
    ring.len() == registered.len() && ring == registered
}
