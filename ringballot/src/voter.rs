//! Voter-side ballot construction.
//!
//! Casting takes two steps because the authority sits in the middle: `prepare_ballot` encrypts
//! the choice, commits to it and blinds the commitment; once the authority has signed the
//! blinded value, `PreparedBallot::finish` unblinds it and ring-signs the result.

use crate::*;
use curve25519_dalek::ristretto::RistrettoPoint;
use num_bigint_dig::BigUint;
use rand::{CryptoRng, Rng};
use uuid::Uuid;

/// How long a voter waits for the authority before the blinding session is abandoned
pub const SESSION_TTL_MS: u64 = 10 * 60 * 1000;

pub struct Voter {
    pub id: Uuid,
    keypair: RingKeyPair,
}

impl Voter {
    pub fn new<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Voter {
            id: Uuid::new_v4(),
            keypair: RingKeyPair::generate(rng),
        }
    }

    pub fn from_keypair(id: Uuid, keypair: RingKeyPair) -> Self {
        Voter { id, keypair }
    }

    pub fn public_key(&self) -> RingPublicKey {
        self.keypair.public_key()
    }

    /// The key image every ballot from this voter will carry
    pub fn key_image(&self) -> Result<RistrettoPoint> {
        self.keypair.key_image()
    }

    /// Encrypt a vote for `candidate` and blind its commitment for the authority.
    pub fn prepare_ballot<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        params: &ElectionParameters,
        candidate: usize,
        clock: &dyn Clock,
    ) -> Result<PreparedBallot> {
        let election = params.metadata.id;
        let candidate_vector = indicator_vector(candidate, params.metadata.candidates)?
            .iter()
            .map(|m| paillier::encrypt(rng, m, &params.paillier))
            .collect::<Result<Vec<Ciphertext>>>()?;

        let voter_commitment = commitment(election, &candidate_vector);
        let session = BlindSignatureSession::start(
            rng,
            &voter_commitment,
            &params.authority,
            clock,
            SESSION_TTL_MS,
        )?;

        Ok(PreparedBallot {
            election,
            candidate_vector,
            voter_commitment,
            session,
        })
    }

    /// Prepare, get authorized through `authorize`, and finish in one go.
    pub fn cast_ballot<R, F>(
        &self,
        rng: &mut R,
        params: &ElectionParameters,
        candidate: usize,
        clock: &dyn Clock,
        authorize: F,
    ) -> Result<Ballot>
    where
        R: Rng + CryptoRng,
        F: FnOnce(Uuid, &BigUint) -> Result<BigUint>,
    {
        let prepared = self.prepare_ballot(rng, params, candidate, clock)?;
        let blind_signature = authorize(self.id, prepared.blinded_hash())?;
        prepared.finish(rng, &blind_signature, self, params, clock)
    }
}

/// A ballot waiting for the authority's blind signature
pub struct PreparedBallot {
    election: Uuid,
    candidate_vector: Vec<Ciphertext>,
    voter_commitment: [u8; 32],
    session: BlindSignatureSession,
}

impl PreparedBallot {
    /// The only thing the authority gets to see
    pub fn blinded_hash(&self) -> &BigUint {
        &self.session.blinded_hash
    }

    /// Unblind and check the authority's signature, then ring-sign the ballot among all
    /// registered voters.
    pub fn finish<R: Rng + CryptoRng>(
        mut self,
        rng: &mut R,
        blind_signature: &BigUint,
        voter: &Voter,
        params: &ElectionParameters,
        clock: &dyn Clock,
    ) -> Result<Ballot> {
        let blind_signature_proof = self.session.finish(blind_signature, &params.authority, clock)?;
        let submitted_at = clock.now_millis();

        let message = ring_message(
            self.election,
            &self.voter_commitment,
            &blind_signature_proof,
            submitted_at,
        );
        let ring_signature = ring::sign(rng, &message, &voter.keypair, &params.voters)?;

        Ok(Ballot {
            election: self.election,
            candidate_vector: self.candidate_vector,
            voter_commitment: self.voter_commitment,
            blind_signature_proof,
            ring_signature,
            submitted_at,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::Fixture;
    use std::sync::Arc;

    #[test]
    fn test_cast_through_authorizer() {
        let mut fixture = Fixture::new(3, 3);
        let authorizer = BlindAuthorizer::new(fixture.authority_keypair(), Arc::new(fixture.registry.clone()));
        let election = fixture.params.metadata.id;
        let clock = fixture.clock.clone();
        let params = fixture.params.clone();

        let (rng, voters) = fixture.rng_and_voters();
        let ballot = voters[1]
            .cast_ballot(rng, &params, 2, &clock, |voter, blinded| {
                authorizer.request_authorization(election, voter, blinded)
            })
            .unwrap();
        ballot.verify(&params).unwrap();
        assert_eq!(ballot.key_image(), voters[1].key_image().unwrap().compress().to_bytes());

        // The authority signs each voter once
        let again = voters[1].cast_ballot(rng, &params, 0, &clock, |voter, blinded| {
            authorizer.request_authorization(election, voter, blinded)
        });
        assert!(matches!(again, Err(Error::DuplicateAuthorization { .. })));
    }

    #[test]
    fn test_expired_session() {
        let mut fixture = Fixture::new(2, 3);
        let keypair = fixture.authority_keypair();
        let clock = fixture.clock.clone();
        let params = fixture.params.clone();

        let (rng, voters) = fixture.rng_and_voters();
        let prepared = voters[0].prepare_ballot(rng, &params, 1, &clock).unwrap();
        let blind_signature = blind::sign(prepared.blinded_hash(), &keypair).unwrap();

        clock.advance(SESSION_TTL_MS + 1);
        assert!(matches!(
            prepared.finish(rng, &blind_signature, &voters[0], &params, &clock),
            Err(Error::SessionExpired)
        ));
    }

    #[test]
    fn test_wrong_authority_signature() {
        let mut fixture = Fixture::new(2, 3);
        let clock = fixture.clock.clone();
        let params = fixture.params.clone();

        let (rng, voters) = fixture.rng_and_voters();
        let prepared = voters[2].prepare_ballot(rng, &params, 0, &clock).unwrap();
        let bogus = prepared.blinded_hash() + 1u32;
        assert!(matches!(
            prepared.finish(rng, &bogus, &voters[2], &params, &clock),
            Err(Error::Validation(ValidationError::BlindSignatureInvalid))
        ));
    }

    #[test]
    fn test_invalid_candidate() {
        let mut fixture = Fixture::new(2, 3);
        let clock = fixture.clock.clone();
        let params = fixture.params.clone();

        let (rng, voters) = fixture.rng_and_voters();
        assert!(matches!(
            voters[0].prepare_ballot(rng, &params, 2, &clock),
            Err(Error::Validation(ValidationError::CandidateOutOfRange { .. }))
        ));
    }
}
