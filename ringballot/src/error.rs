use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("ringballot: {0}")]
    Validation(#[from] ValidationError),

    #[error("ringballot: voter {voter} already received an authorization for election {election}")]
    DuplicateAuthorization { election: Uuid, voter: Uuid },

    #[error("ringballot: double vote detected, key image {0} already recorded")]
    DuplicateVote(String),

    #[error("ringballot: cryptographic failure: {0}")]
    CryptoFailure(#[from] CryptoFailure),

    #[error("ringballot: unresolved chain fork at height {height}: competing tips {tips:?}")]
    ConsensusConflict { height: usize, tips: Vec<String> },

    #[error("ringballot: not enough decryption shares: need {needed}, found {found}")]
    ThresholdInsufficient { needed: usize, found: usize },

    #[error("ringballot: this node does not hold authority status")]
    NotAuthority,

    #[error("ringballot: blind signature session expired")]
    SessionExpired,

    #[error("ringballot: unknown election {0}")]
    UnknownElection(Uuid),

    #[error("ringballot: voter {0} is not eligible for authorization")]
    NotEligible(Uuid),

    #[error("ringballot: voting is closed for election {0}")]
    VotingClosed(Uuid),

    #[error("ringballot: the tally for election {0} has not been closed yet")]
    TallyNotClosed(Uuid),

    #[error("ringballot: JSON error: {0}")]
    JSON(#[from] serde_json::Error),

    #[error("ringballot: CBOR error: {0}")]
    CBOR(#[from] serde_cbor::Error),
}

/// Failures of the number-theoretic and curve machinery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoFailure {
    #[error("ring signature failed to close during self-verification")]
    RingNotClosed,

    #[error("prime search exhausted after {0} attempts")]
    PrimeSearchExhausted(usize),

    #[error("coprime search exhausted after {0} attempts")]
    CoprimeSearchExhausted(usize),

    #[error("hash-to-curve exhausted after {0} attempts")]
    HashToCurveExhausted(usize),

    #[error("generated key pair failed validation after {0} attempts")]
    KeyValidationFailed(usize),

    #[error("RSA key generation failed: {0}")]
    RsaKeyGeneration(String),

    #[error("value has no inverse modulo the key modulus")]
    NotInvertible,
}

/// Structural and signature validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("validation: malformed key: {0}")]
    MalformedKey(String),

    #[error("validation: malformed ballot: {0}")]
    MalformedBallot(String),

    #[error("validation: candidate vector has {found} entries, election has {expected} candidates")]
    CandidateCountMismatch { expected: usize, found: usize },

    #[error("validation: plaintext is outside Z_n")]
    PlaintextOutOfRange,

    #[error("validation: ciphertext {0} is outside Z*_(n^2)")]
    CiphertextOutOfRange(usize),

    #[error("validation: voter commitment does not match the ballot contents")]
    CommitmentMismatch,

    #[error("validation: blind signature proof failed to verify")]
    BlindSignatureInvalid,

    #[error("validation: ring signature failed to verify")]
    RingSignatureInvalid,

    #[error("validation: ring does not match the registered voter set")]
    RingMismatch,

    #[error("validation: ring has {0} members, at least 2 are required")]
    RingTooSmall(usize),

    #[error("validation: signer is not a member of the ring")]
    SignerNotInRing,

    #[error("validation: ballot submitted at {submitted_at} is stale or future-dated (now {now})")]
    StaleBallot { submitted_at: u64, now: u64 },

    #[error("validation: block {0} hash mismatch")]
    BlockHashMismatch(u64),

    #[error("validation: block {0} does not link to its predecessor")]
    BlockLinkMismatch(u64),

    #[error("validation: block {0} has an invalid authority signature")]
    BlockSignatureInvalid(u64),

    #[error("validation: block {0} contains a key image already present in the chain")]
    BlockDuplicateKeyImage(u64),

    #[error("validation: chain has no genesis block")]
    MissingGenesis,

    #[error("validation: invalid threshold {threshold} for {parties} parties")]
    InvalidThreshold { threshold: usize, parties: usize },

    #[error("validation: key share {0} does not belong to this key")]
    ForeignKeyShare(usize),

    #[error("validation: duplicate key share index {0}")]
    DuplicateShareIndex(usize),

    #[error("validation: vote encoding for {candidates} candidates and {max_votes} votes does not fit the plaintext space")]
    EncodingOverflow { candidates: usize, max_votes: u64 },

    #[error("validation: candidate {candidate} out of range for {candidates} candidates")]
    CandidateOutOfRange { candidate: usize, candidates: usize },
}
