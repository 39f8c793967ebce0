//! Wallet adapters (C7): two interchangeable signing backends behind one
//! capability trait.
//!
//! Grounded on the teacher's `src/signer.rs`/`src/keys.rs` key-material
//! handling and `src/bitcoin.rs` signing flow, generalized to the
//! two-backend interface spec §4.7 requires.

pub mod naive;
pub mod roast_wallet;

use bitcoin::Block;

use crate::errors::WalletError;
use crate::frost::SigningCommitment;
use crate::messages::Message;

/// A single signer's aggregated-signature contribution, returned by the
/// naïve wallet for the blockchain adapter to combine via PSBT.
pub struct BlockSignature {
    pub signer_id: u32,
    pub signature: Vec<u8>,
}

/// The signing capability every wallet backend exposes to the FBFT state
/// machine and replica driver.
pub trait Wallet {
    /// Signs `msg.sign_payload()` and returns the raw signature bytes.
    fn append_signature(&self, msg: &Message) -> Result<Vec<u8>, WalletError>;

    /// Verifies `msg.signature` against the sender's declared identity key.
    fn verify_signature(&self, msg: &Message) -> bool;

    /// Composes an already-collected aggregate/threshold signature into
    /// `block`'s signet solution and returns the signed block.
    fn finalize_block(&self, block: Block, aux: &[u8], shares: &[BlockSignature]) -> Result<Block, WalletError>;

    /// The presignature commitment carried in this replica's next COMMIT
    /// message, if this backend runs ROAST (§3: COMMIT's `pre_signature`
    /// field seeds the coordinator's ready pool). The naïve backend has
    /// none.
    fn pre_signature_commitment(&mut self) -> Option<SigningCommitment> {
        None
    }

    /// The raw bytes this replica contributes as COMMIT's `pre_signature`
    /// field for `block`: a serialized [`SigningCommitment`] for a
    /// threshold backend, or (for the naïve backend) this replica's own
    /// per-block signature. The FBFT state machine treats this as opaque
    /// bytes; only the signing-session driver interprets it.
    fn commit_payload(&mut self, block: &Block) -> Vec<u8> {
        let _ = block;
        self.pre_signature_commitment().map(|c| serde_json::to_vec(&c).unwrap_or_default()).unwrap_or_default()
    }
}

/// Threshold (FROST/ROAST) signing capability, exposed only by
/// [`roast_wallet::RoastWallet`].
pub trait ThresholdWallet: Wallet {
    /// Produces this replica's fresh presignature commitment for the next
    /// ROAST session. The matching private nonce is held internally and
    /// consumed exactly once by [`Self::get_signature_share`].
    fn get_pre_signature_share(&mut self) -> SigningCommitment;

    /// Produces this replica's round-2 signature share over
    /// `(block_hash, pre_sig, signers)`. Consumes the nonce that matches
    /// `pre_sig`'s entry for this replica; a second call against the same
    /// presignature is a hard error ([`WalletError::NonceMissing`]).
    fn get_signature_share(
        &mut self,
        signers: &std::collections::BTreeSet<u16>,
        pre_sig: &[SigningCommitment],
        msg: &[u8],
    ) -> Result<crate::crypto::Scalar, WalletError>;
}
