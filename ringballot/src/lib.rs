#[macro_use]
extern crate serde;

mod authority;
mod ballot;
pub mod blind;
mod clock;
mod config;
mod election;
mod error;
mod ledger;
mod mixnet;
pub mod paillier;
pub mod ring;
mod serde_hex;
mod tally;
mod threshold;
mod util;
mod voter;

pub use authority::*;
pub use ballot::*;
pub use blind::{AuthorityKeyPair, AuthorityPublicKey, BlindAuthorizer, BlindSignatureSession};
pub use clock::*;
pub use config::*;
pub use election::*;
pub use error::*;
pub use ledger::*;
pub use mixnet::*;
pub use paillier::{Ciphertext, PaillierKeyPair, PaillierPrivateKey, PaillierPublicKey};
pub use ring::{RingKeyPair, RingPublicKey, RingSignature};
pub use serde_hex::*;
pub use tally::*;
pub use threshold::*;
pub use util::*;
pub use voter::*;
