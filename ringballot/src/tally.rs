use crate::*;
use num_bigint_dig::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use uuid::Uuid;

/// Positional encoding of per-candidate counts into a single Paillier plaintext.
///
/// Every candidate owns a block of `width` decimal digits, wide enough for `max_votes`, so a
/// candidate's count can never carry into its neighbour's block. Candidate `j` is worth
/// `10^(width * j)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteEncoding {
    candidates: usize,
    max_votes: u64,
    width: usize,
}

impl VoteEncoding {
    /// Fails with `EncodingOverflow` when the largest packed value would not fit below `n`.
    pub fn new(
        candidates: usize,
        max_votes: u64,
        public_key: &PaillierPublicKey,
    ) -> Result<Self, ValidationError> {
        if candidates == 0 {
            return Err(ValidationError::CandidateOutOfRange {
                candidate: 0,
                candidates,
            });
        }

        let width = decimal_digits(max_votes);
        let bound = ten_pow(width * candidates);
        if bound >= public_key.n {
            return Err(ValidationError::EncodingOverflow {
                candidates,
                max_votes,
            });
        }

        Ok(VoteEncoding {
            candidates,
            max_votes,
            width,
        })
    }

    pub fn candidates(&self) -> usize {
        self.candidates
    }

    pub fn max_votes(&self) -> u64 {
        self.max_votes
    }

    /// Digits per candidate block
    pub fn width(&self) -> usize {
        self.width
    }

    /// Weight of `candidate`'s block
    pub fn weight(&self, candidate: usize) -> Result<BigUint, ValidationError> {
        self.check_candidate(candidate)?;
        Ok(ten_pow(self.width * candidate))
    }

    /// The packed plaintext of a single vote for `candidate`
    pub fn encode_vote(&self, candidate: usize) -> Result<BigUint, ValidationError> {
        self.weight(candidate)
    }

    /// Split a packed plaintext back into per-candidate counts
    pub fn decode(&self, packed: &BigUint) -> Result<Vec<u64>, ValidationError> {
        let base = ten_pow(self.width);
        if packed >= &ten_pow(self.width * self.candidates) {
            return Err(ValidationError::EncodingOverflow {
                candidates: self.candidates,
                max_votes: self.max_votes,
            });
        }

        let mut rest = packed.clone();
        let mut counts = Vec::with_capacity(self.candidates);
        for _ in 0..self.candidates {
            let block = &rest % &base;
            let count = block.to_u64().ok_or(ValidationError::EncodingOverflow {
                candidates: self.candidates,
                max_votes: self.max_votes,
            })?;
            counts.push(count);
            rest /= &base;
        }
        Ok(counts)
    }

    fn check_candidate(&self, candidate: usize) -> Result<(), ValidationError> {
        if candidate >= self.candidates {
            return Err(ValidationError::CandidateOutOfRange {
                candidate,
                candidates: self.candidates,
            });
        }
        Ok(())
    }
}

fn decimal_digits(mut value: u64) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn ten_pow(exponent: usize) -> BigUint {
    num_traits::pow(BigUint::from(10u32), exponent)
}

/// The 0/1 plaintexts a voter encrypts, one per candidate.
pub fn indicator_vector(candidate: usize, candidates: usize) -> Result<Vec<BigUint>, ValidationError> {
    if candidate >= candidates {
        return Err(ValidationError::CandidateOutOfRange {
            candidate,
            candidates,
        });
    }
    Ok((0..candidates)
        .map(|j| {
            if j == candidate {
                BigUint::one()
            } else {
                BigUint::zero()
            }
        })
        .collect())
}

/// Per-candidate encrypted running totals for one election.
///
/// Only ever updated by homomorphic addition. Individual ballots are never decrypted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EncryptedTally {
    pub election: Uuid,
    pub totals: Vec<Ciphertext>,
    pub ballots_counted: u64,
}

impl EncryptedTally {
    pub fn new(election: Uuid, candidates: usize) -> Self {
        EncryptedTally {
            election,
            totals: vec![paillier::encrypted_zero(); candidates],
            ballots_counted: 0,
        }
    }

    /// Fold one ballot's candidate vector into the totals.
    pub fn add_ballot(
        &mut self,
        ballot: &Ballot,
        public_key: &PaillierPublicKey,
    ) -> Result<(), ValidationError> {
        if ballot.election != self.election {
            return Err(ValidationError::MalformedBallot(format!(
                "ballot for election {} counted in {}",
                ballot.election, self.election
            )));
        }
        if ballot.candidate_vector.len() != self.totals.len() {
            return Err(ValidationError::CandidateCountMismatch {
                expected: self.totals.len(),
                found: ballot.candidate_vector.len(),
            });
        }
        for (i, c) in ballot.candidate_vector.iter().enumerate() {
            if !public_key.contains(c) {
                return Err(ValidationError::CiphertextOutOfRange(i));
            }
        }

        for (total, c) in self.totals.iter_mut().zip(&ballot.candidate_vector) {
            *total = paillier::add_encrypted(total, c, public_key);
        }
        self.ballots_counted += 1;
        Ok(())
    }

    /// Tally every ballot of a finalized chain
    pub fn from_blocks(
        election: Uuid,
        candidates: usize,
        blocks: &[Block],
        public_key: &PaillierPublicKey,
    ) -> Result<Self, ValidationError> {
        let mut tally = EncryptedTally::new(election, candidates);
        for ballot in blocks.iter().flat_map(|b| b.ballots.iter()) {
            tally.add_ballot(ballot, public_key)?;
        }
        Ok(tally)
    }

    /// Combine the per-candidate totals into one ciphertext of the packed counts, so a single
    /// threshold decryption round yields every count.
    pub fn pack(
        &self,
        encoding: &VoteEncoding,
        public_key: &PaillierPublicKey,
    ) -> Result<Ciphertext, ValidationError> {
        if self.totals.len() != encoding.candidates() {
            return Err(ValidationError::CandidateCountMismatch {
                expected: encoding.candidates(),
                found: self.totals.len(),
            });
        }
        if self.ballots_counted > encoding.max_votes() {
            return Err(ValidationError::EncodingOverflow {
                candidates: encoding.candidates(),
                max_votes: encoding.max_votes(),
            });
        }

        let mut packed = paillier::encrypted_zero();
        for (candidate, total) in self.totals.iter().enumerate() {
            let weighted = paillier::scalar_mul(total, &encoding.weight(candidate)?, public_key);
            packed = paillier::add_encrypted(&packed, &weighted, public_key);
        }
        Ok(packed)
    }
}

/// The decrypted outcome of an election
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FinalTally {
    pub election: Uuid,
    pub counts: Vec<u64>,
    pub ballots_counted: u64,
}
