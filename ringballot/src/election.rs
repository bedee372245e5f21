use crate::*;
use ed25519_dalek::VerifyingKey;
use indexmap::IndexMap;
use log::{info, warn};
use num_bigint_dig::BigUint;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Who may vote. Supplied by the surrounding system.
pub trait VoterRegistry: Send + Sync {
    /// Every registered voter's ring public key; the anonymity set for ring signing
    fn public_keys(&self, election: Uuid) -> Vec<RingPublicKey>;

    /// Whether `voter` may receive a blind authorization for `election`
    fn is_eligible(&self, election: Uuid, voter: Uuid) -> bool;
}

/// A fixed voter roll for a single election
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    election: Uuid,
    voters: IndexMap<Uuid, RingPublicKey>,
}

impl StaticRegistry {
    pub fn new(election: Uuid) -> Self {
        StaticRegistry {
            election,
            voters: IndexMap::new(),
        }
    }

    pub fn register(&mut self, voter: Uuid, public_key: RingPublicKey) {
        self.voters.insert(voter, public_key);
    }

    pub fn len(&self) -> usize {
        self.voters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voters.is_empty()
    }
}

impl VoterRegistry for StaticRegistry {
    fn public_keys(&self, election: Uuid) -> Vec<RingPublicKey> {
        if election != self.election {
            return vec![];
        }
        self.voters.values().cloned().collect()
    }

    fn is_eligible(&self, election: Uuid, voter: Uuid) -> bool {
        election == self.election && self.voters.contains_key(&voter)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ElectionMetadata {
    pub id: Uuid,
    pub candidates: usize,

    /// Upper bound on votes any one candidate can receive, sizes the tally encoding
    pub max_votes: u64,
}

/// Everything public about an election that a node needs to validate ballots and blocks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ElectionParameters {
    pub metadata: ElectionMetadata,
    pub paillier: PaillierPublicKey,
    pub authority: AuthorityPublicKey,

    /// The anonymity set
    #[serde(with = "ristretto_hex_seq")]
    pub voters: Vec<RingPublicKey>,

    /// Key that signs every block after genesis
    #[serde(with = "VerifyingKeyHex")]
    pub block_signer: VerifyingKey,
}

impl ElectionParameters {
    pub fn new(
        metadata: ElectionMetadata,
        paillier: PaillierPublicKey,
        authority: AuthorityPublicKey,
        registry: &dyn VoterRegistry,
        block_signer: VerifyingKey,
    ) -> Result<Self, ValidationError> {
        let params = ElectionParameters {
            voters: registry.public_keys(metadata.id),
            metadata,
            paillier,
            authority,
            block_signer,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.paillier.validate()?;
        self.authority.validate()?;
        if self.voters.len() < 2 {
            return Err(ValidationError::RingTooSmall(self.voters.len()));
        }
        if self.metadata.max_votes < self.voters.len() as u64 {
            return Err(ValidationError::EncodingOverflow {
                candidates: self.metadata.candidates,
                max_votes: self.metadata.max_votes,
            });
        }
        self.encoding()?;
        Ok(())
    }

    pub fn encoding(&self) -> Result<VoteEncoding, ValidationError> {
        VoteEncoding::new(
            self.metadata.candidates,
            self.metadata.max_votes,
            &self.paillier,
        )
    }
}

// Frozen once voting closes; partial decryptions are computed against `packed`.
struct ClosedTally {
    tally: EncryptedTally,
    packed: Ciphertext,
}

/// The operations the rest of the system calls: authorization, ballot submission, the
/// finalized chain, and the threshold-decrypted tally.
pub struct ElectionService {
    params: Arc<ElectionParameters>,
    authorizer: BlindAuthorizer,
    mixnet: Arc<Mixnet>,
    node: Arc<AuthorityNode>,
    clock: Arc<dyn Clock>,
    threshold: usize,
    parties: usize,
    closed: Mutex<Option<ClosedTally>>,

    // Keyed by tally authority
    partials: Mutex<IndexMap<String, PartialDecryption>>,
}

impl ElectionService {
    pub fn new(
        authorizer: BlindAuthorizer,
        mixnet: Arc<Mixnet>,
        node: Arc<AuthorityNode>,
        clock: Arc<dyn Clock>,
        threshold: usize,
        parties: usize,
    ) -> Result<Self> {
        if threshold == 0 || threshold > parties {
            return Err(ValidationError::InvalidThreshold { threshold, parties }.into());
        }
        let params = Arc::new(node.params().clone());
        if authorizer.public_key() != &params.authority {
            return Err(ValidationError::MalformedKey(
                "authorizer key does not match the election's authority key".to_owned(),
            )
            .into());
        }

        Ok(ElectionService {
            params,
            authorizer,
            mixnet,
            node,
            clock,
            threshold,
            parties,
            closed: Mutex::new(None),
            partials: Mutex::new(IndexMap::new()),
        })
    }

    pub fn params(&self) -> &ElectionParameters {
        &self.params
    }

    pub fn election_id(&self) -> Uuid {
        self.params.metadata.id
    }

    fn is_closed(&self) -> bool {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn check_election(&self, election: Uuid) -> Result<()> {
        if election != self.election_id() {
            return Err(Error::UnknownElection(election));
        }
        Ok(())
    }

    /// Blind-sign a voter's blinded commitment hash, once per voter
    pub fn request_authorization(&self, voter: Uuid, blinded_hash: &BigUint) -> Result<BigUint> {
        if self.is_closed() {
            return Err(Error::VotingClosed(self.election_id()));
        }
        self.authorizer
            .request_authorization(self.election_id(), voter, blinded_hash)
    }

    /// Validate a ballot and hand it to the mixnet. The drain cycle checks it again against
    /// the chain as it stands then.
    pub fn submit_ballot(&self, ballot: Ballot) -> Result<()> {
        // Held until the ballot is buffered, so closing cannot slip in between
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if closed.is_some() {
            return Err(Error::VotingClosed(self.election_id()));
        }

        ballot.verify(&self.params)?;
        let config = self.node.config();
        ballot.check_freshness(
            self.clock.now_millis(),
            config.max_ballot_age_ms,
            config.max_clock_skew_ms,
        )?;

        let key_image = ballot.key_image();
        if self.node.contains_key_image(&key_image) || self.mixnet.contains_key_image(&key_image) {
            warn!("refused ballot {}: key image already seen", ballot.key_image_hex());
            return Err(Error::DuplicateVote(ballot.key_image_hex()));
        }

        let key_image = ballot.key_image_hex();
        if !self.mixnet.add_entry(ballot) {
            return Err(Error::DuplicateVote(key_image));
        }
        drop(closed);
        Ok(())
    }

    pub fn get_finalized_ballots(&self, election: Uuid) -> Result<Vec<Block>> {
        self.check_election(election)?;
        Ok(self.node.blocks())
    }

    /// The per-candidate encrypted totals over the chain as it stands now
    pub fn encrypted_tally(&self) -> Result<EncryptedTally> {
        Ok(EncryptedTally::from_blocks(
            self.election_id(),
            self.params.metadata.candidates,
            &self.node.blocks(),
            &self.params.paillier,
        )?)
    }

    /// Stop accepting ballots and freeze the tally. Returns the packed ciphertext every tally
    /// authority must partially decrypt. Calling it again returns the same ciphertext.
    ///
    /// Ballots still waiting in the mixnet are released and committed in one last block
    /// before the tally is taken; the node refuses every drain after that.
    pub fn close_voting(&self) -> Result<Ciphertext> {
        let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(closed) = closed.as_ref() {
            return Ok(closed.packed.clone());
        }

        let report = self.node.close()?;
        if !report.rejected.is_empty() {
            warn!(
                "final drain for {} rejected {} ballots",
                self.election_id(),
                report.rejected.len()
            );
        }

        let tally = self.encrypted_tally()?;
        let packed = tally.pack(&self.params.encoding()?, &self.params.paillier)?;
        info!(
            "voting closed for {} with {} ballots",
            self.election_id(),
            tally.ballots_counted
        );
        *closed = Some(ClosedTally {
            tally,
            packed: packed.clone(),
        });
        Ok(packed)
    }

    /// The ciphertext to partially decrypt, once voting is closed
    pub fn tally_ciphertext(&self) -> Result<Ciphertext> {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|closed| closed.packed.clone())
            .ok_or(Error::TallyNotClosed(self.election_id()))
    }

    /// Record one tally authority's partial decryption of the closed tally. A later submission
    /// from the same authority replaces its earlier one.
    pub fn submit_partial_decryption(
        &self,
        authority: &str,
        partial: PartialDecryption,
    ) -> Result<()> {
        if !self.is_closed() {
            return Err(Error::TallyNotClosed(self.election_id()));
        }
        if partial.index == 0 || partial.index > self.parties {
            return Err(ValidationError::ForeignKeyShare(partial.index).into());
        }
        if !self.params.paillier.contains(&Ciphertext(partial.value.clone())) {
            return Err(ValidationError::CiphertextOutOfRange(partial.index).into());
        }

        let mut partials = self.partials.lock().unwrap_or_else(PoisonError::into_inner);
        let taken = partials
            .iter()
            .any(|(other, p)| other != authority && p.index == partial.index);
        if taken {
            return Err(ValidationError::DuplicateShareIndex(partial.index).into());
        }

        info!(
            "partial decryption {} received from {}",
            partial.index, authority
        );
        partials.insert(authority.to_owned(), partial);
        Ok(())
    }

    /// Combine the partial decryptions received so far into per-candidate counts.
    pub fn get_final_tally(&self, election: Uuid) -> Result<FinalTally> {
        self.check_election(election)?;

        let ballots_counted = {
            let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            let closed = closed.as_ref().ok_or(Error::TallyNotClosed(election))?;
            closed.tally.ballots_counted
        };

        let partials: Vec<PartialDecryption> = self
            .partials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let plaintext = combine_partial_decryptions(
            &partials,
            &self.params.paillier,
            self.threshold,
            self.parties,
        )?;
        // Bad shares decrypt to garbage, which almost never fits the encoding
        let counts = self.params.encoding()?.decode(&plaintext)?;

        info!("final tally for {}: {:?}", election, counts);
        Ok(FinalTally {
            election,
            counts,
            ballots_counted,
        })
    }
}
