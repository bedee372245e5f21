use crate::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use std::collections::BTreeSet;
use uuid::Uuid;

const GENESIS_DOMAIN: &[u8] = b"ringballot-genesis-v1";

/// A block of ballots. Never mutated after it is appended.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u64,

    #[serde(with = "Hash32Hex")]
    pub previous_hash: [u8; 32],

    pub timestamp: u64,

    pub ballots: Vec<Ballot>,

    #[serde(with = "Hash32Hex")]
    pub hash: [u8; 32],

    /// The authority's signature over `hash`. Absent only on the genesis block.
    #[serde(with = "signature_hex_opt")]
    pub signature: Option<Signature>,
}

// What the block hash covers
#[derive(Serialize)]
struct BlockHeader<'a> {
    index: u64,
    previous_hash: &'a [u8; 32],
    timestamp: u64,
    ballots: &'a [Ballot],
}

impl Block {
    /// The deterministic first block of an election's chain, identical on every node
    pub fn genesis(election: Uuid) -> Result<Self> {
        let previous_hash = sha256(&[GENESIS_DOMAIN, &election.as_bytes()[..]]);
        let hash = Block::compute_hash(0, &previous_hash, 0, &[])?;
        Ok(Block {
            index: 0,
            previous_hash,
            timestamp: 0,
            ballots: vec![],
            hash,
            signature: None,
        })
    }

    /// SHA-256 over the canonical CBOR encoding of the header and ballots
    pub fn compute_hash(
        index: u64,
        previous_hash: &[u8; 32],
        timestamp: u64,
        ballots: &[Ballot],
    ) -> Result<[u8; 32]> {
        let header = BlockHeader {
            index,
            previous_hash,
            timestamp,
            ballots,
        };
        let encoded = serde_cbor::to_vec(&header)?;
        Ok(sha256(&[&encoded[..]]))
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    // Hash and signature only; linkage and ballots are checked by the ledger.
    fn check_integrity(&self, signer: &ed25519_dalek::VerifyingKey) -> Result<(), ValidationError> {
        let computed =
            Block::compute_hash(self.index, &self.previous_hash, self.timestamp, &self.ballots)
                .map_err(|_| ValidationError::BlockHashMismatch(self.index))?;
        if computed != self.hash {
            return Err(ValidationError::BlockHashMismatch(self.index));
        }

        match &self.signature {
            Some(signature) => signer
                .verify(&self.hash, signature)
                .map_err(|_| ValidationError::BlockSignatureInvalid(self.index)),
            None => Err(ValidationError::BlockSignatureInvalid(self.index)),
        }
    }
}

/// An election's hash chain plus the set of every key image it contains.
#[derive(Debug, Clone)]
pub struct Ledger {
    election: Uuid,
    blocks: Vec<Block>,
    key_images: BTreeSet<[u8; 32]>,
}

impl Ledger {
    /// A chain holding only the genesis block
    pub fn new(election: Uuid) -> Result<Self> {
        Ok(Ledger {
            election,
            blocks: vec![Block::genesis(election)?],
            key_images: BTreeSet::new(),
        })
    }

    /// Validate a complete chain from scratch: genesis, every hash, link and authority
    /// signature, every ballot, and key-image uniqueness across the whole chain.
    pub fn from_blocks(blocks: Vec<Block>, params: &ElectionParameters) -> Result<Self> {
        let election = params.metadata.id;
        let genesis = Block::genesis(election)?;
        match blocks.first() {
            Some(first) if *first == genesis => {}
            _ => return Err(ValidationError::MissingGenesis.into()),
        }

        let mut ledger = Ledger {
            election,
            blocks: vec![genesis],
            key_images: BTreeSet::new(),
        };
        for block in blocks.into_iter().skip(1) {
            for ballot in block.ballots.iter() {
                ballot.verify(params)?;
            }
            ledger.append(block, params)?;
        }
        Ok(ledger)
    }

    pub fn election(&self) -> Uuid {
        self.election
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn tip(&self) -> &Block {
        // Never empty: construction always starts from genesis
        &self.blocks[self.blocks.len() - 1]
    }

    /// Number of blocks, genesis included
    pub fn height(&self) -> usize {
        self.blocks.len()
    }

    pub fn ballot_count(&self) -> usize {
        self.key_images.len()
    }

    pub fn contains_key_image(&self, key_image: &[u8; 32]) -> bool {
        self.key_images.contains(key_image)
    }

    /// Assemble and sign the block that would follow the current tip. Nothing is appended.
    pub fn next_block(
        &self,
        ballots: Vec<Ballot>,
        timestamp: u64,
        signing_key: &SigningKey,
    ) -> Result<Block> {
        let tip = self.tip();
        let index = tip.index + 1;
        let hash = Block::compute_hash(index, &tip.hash, timestamp, &ballots)?;
        Ok(Block {
            index,
            previous_hash: tip.hash,
            timestamp,
            ballots,
            hash,
            signature: Some(signing_key.sign(&hash)),
        })
    }

    /// Append a fully assembled block. Either the whole block is accepted or the ledger is
    /// left untouched. Ballot signatures are the caller's responsibility.
    pub fn append(&mut self, block: Block, params: &ElectionParameters) -> Result<(), ValidationError> {
        let tip = self.tip();
        if block.index != tip.index + 1 || block.previous_hash != tip.hash {
            return Err(ValidationError::BlockLinkMismatch(block.index));
        }
        block.check_integrity(&params.block_signer)?;

        let mut added = BTreeSet::new();
        for ballot in block.ballots.iter() {
            let key_image = ballot.key_image();
            if self.key_images.contains(&key_image) || !added.insert(key_image) {
                return Err(ValidationError::BlockDuplicateKeyImage(block.index));
            }
        }

        self.key_images.extend(added);
        self.blocks.push(block);
        Ok(())
    }

    /// Every ballot in the chain, in chain order
    pub fn ballots(&self) -> impl Iterator<Item = &Ballot> {
        self.blocks.iter().flat_map(|b| b.ballots.iter())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.blocks)?)
    }

    /// Parse and fully validate an exported chain
    pub fn from_json(json: &str, params: &ElectionParameters) -> Result<Self> {
        let blocks: Vec<Block> = serde_json::from_str(json)?;
        Ledger::from_blocks(blocks, params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::Fixture;

    fn chain(fixture: &mut Fixture) -> Ledger {
        let mut ledger = Ledger::new(fixture.params.metadata.id).unwrap();
        let first = vec![fixture.cast(0, 0), fixture.cast(1, 1)];
        let block = ledger.next_block(first, 1_000, &fixture.block_key).unwrap();
        ledger.append(block, &fixture.params).unwrap();
        let second = vec![fixture.cast(2, 1)];
        let block = ledger.next_block(second, 2_000, &fixture.block_key).unwrap();
        ledger.append(block, &fixture.params).unwrap();
        ledger
    }

    #[test]
    fn test_chain_links() {
        let mut fixture = Fixture::new(2, 4);
        let ledger = chain(&mut fixture);
        assert_eq!(ledger.height(), 3);
        assert_eq!(ledger.ballot_count(), 3);

        for pair in ledger.blocks().windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }

        let rebuilt = Ledger::from_blocks(ledger.blocks().to_vec(), &fixture.params).unwrap();
        assert_eq!(rebuilt.blocks(), ledger.blocks());
        assert_eq!(rebuilt.ballot_count(), 3);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let election = Uuid::new_v4();
        assert_eq!(Block::genesis(election).unwrap(), Block::genesis(election).unwrap());
        assert_ne!(
            Block::genesis(election).unwrap().hash,
            Block::genesis(Uuid::new_v4()).unwrap().hash
        );
    }

    #[test]
    fn test_duplicate_key_image_rejected() {
        let mut fixture = Fixture::new(2, 4);
        let mut ledger = chain(&mut fixture);
        let height = ledger.height();

        // Voter 1 already voted in block 1
        let block = ledger
            .next_block(vec![fixture.cast(3, 0), fixture.cast(1, 0)], 3_000, &fixture.block_key)
            .unwrap();
        assert_eq!(
            ledger.append(block, &fixture.params),
            Err(ValidationError::BlockDuplicateKeyImage(3))
        );
        assert_eq!(ledger.height(), height);
        assert!(!ledger.contains_key_image(&fixture.cast(3, 0).key_image()));

        // Twice within one block
        let block = ledger
            .next_block(vec![fixture.cast(3, 0), fixture.cast(3, 1)], 3_000, &fixture.block_key)
            .unwrap();
        assert!(ledger.append(block, &fixture.params).is_err());
    }

    #[test]
    fn test_tampered_chain_rejected() {
        let mut fixture = Fixture::new(2, 4);
        let ledger = chain(&mut fixture);

        let mut blocks = ledger.blocks().to_vec();
        blocks[1].timestamp += 1;
        assert!(matches!(
            Ledger::from_blocks(blocks, &fixture.params),
            Err(Error::Validation(ValidationError::BlockHashMismatch(1)))
        ));

        let mut blocks = ledger.blocks().to_vec();
        blocks.remove(1);
        assert!(matches!(
            Ledger::from_blocks(blocks, &fixture.params),
            Err(Error::Validation(ValidationError::BlockLinkMismatch(2)))
        ));

        let blocks = ledger.blocks()[1..].to_vec();
        assert!(matches!(
            Ledger::from_blocks(blocks, &fixture.params),
            Err(Error::Validation(ValidationError::MissingGenesis))
        ));

        // Re-signed by someone other than the authority
        let (imposter, _) = generate_keypair();
        let mut forged = Ledger::new(fixture.params.metadata.id).unwrap();
        let block = forged.next_block(vec![fixture.cast(0, 1)], 1_000, &imposter).unwrap();
        assert_eq!(
            forged.append(block, &fixture.params),
            Err(ValidationError::BlockSignatureInvalid(1))
        );
    }

    #[test]
    fn test_json_export() {
        let mut fixture = Fixture::new(2, 4);
        let ledger = chain(&mut fixture);
        let json = ledger.to_json().unwrap();
        let imported = Ledger::from_json(&json, &fixture.params).unwrap();
        assert_eq!(imported.blocks(), ledger.blocks());
        assert_eq!(imported.tip().hash_hex(), ledger.tip().hash_hex());
    }
}
