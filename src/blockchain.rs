//! Blockchain adapter (C8): a thin wrapper around the chain node's
//! generate/testValidity/submit RPCs plus signet-PSBT composition for
//! aggregate-signature insertion.
//!
//! Grounded on the teacher's `src/bitcoin.rs` (RPC client construction,
//! taproot sighash/finalisation patterns), generalized from single-UTXO
//! Taproot spends to block assembly per
//! `original_source/src/block/generate.cpp`/`psbt_utils.cpp`. Coinbase
//! construction, Merkle roots, and PoW grinding are the out-of-scope
//! "block assembler" collaborator (§1); this module only orchestrates the
//! RPC calls and performs the signet header splice spec §6 requires.

use bitcoin::blockdata::constants::WITNESS_COMMITMENT_HEADER;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, ScriptBuf};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use tracing::{instrument, warn};

use crate::errors::BlockchainError;

/// The 4-byte tag marking a signet solution push, per BIP-325.
pub const SIGNET_HEADER: [u8; 4] = [0xec, 0xc7, 0xda, 0xa2];

/// `GenerateBlock`/`TestBlockValidity`/`SubmitBlock` as the FBFT state
/// machine needs them.
pub trait Blockchain {
    fn generate_block(&self, timestamp: u32) -> Result<Block, BlockchainError>;
    fn test_block_validity(&self, height: u64, block: &Block, check_signet: bool) -> Result<bool, BlockchainError>;
    fn submit_block(&self, height: u64, block: &Block) -> Result<(), BlockchainError>;
}

/// A [`Blockchain`] backed by `bitcoincore-rpc`, matching the teacher's
/// `create_rpc_client` auth handling.
pub struct RpcBlockchain {
    client: Client,
}

impl RpcBlockchain {
    pub fn new(url: &str, user: Option<&str>, pass: Option<&str>) -> Result<Self, BlockchainError> {
        let auth = match (user, pass) {
            (Some(user), Some(pass)) => Auth::UserPass(user.to_string(), pass.to_string()),
            _ => Auth::None,
        };
        let client = Client::new(url, auth).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        Ok(RpcBlockchain { client })
    }

    /// Appends `SIGNET_HEADER || push-prefix || signature` to the last
    /// coinbase output's scriptPubKey, replacing the trailing placeholder
    /// push, per §6's wire-format note.
    fn splice_signet_solution(block: &mut Block, signature: &[u8; 64]) -> Result<(), BlockchainError> {
        let coinbase = block.txdata.first_mut().ok_or(BlockchainError::SignetSplice("empty block".into()))?;
        let last_output =
            coinbase.output.last_mut().ok_or(BlockchainError::SignetSplice("coinbase has no outputs".into()))?;

        let mut solution = Vec::with_capacity(4 + 1 + 64);
        solution.extend_from_slice(&SIGNET_HEADER);
        solution.push(0x40); // push-prefix: 64 bytes follow
        solution.extend_from_slice(signature);
        last_output.script_pubkey = ScriptBuf::from_bytes(solution);
        Ok(())
    }

    /// Inserts the witness commitment output computed from `witness_root`,
    /// matching the standard `OP_RETURN WITNESS_COMMITMENT_HEADER || root`
    /// pattern.
    fn with_witness_commitment(block: &mut Block, witness_root: [u8; 32]) {
        let mut commitment = Vec::with_capacity(WITNESS_COMMITMENT_HEADER.len() + 32);
        commitment.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
        commitment.extend_from_slice(&witness_root);
        let script = ScriptBuf::builder().push_opcode(bitcoin::opcodes::all::OP_RETURN).push_slice(
            bitcoin::script::PushBytesBuf::try_from(commitment).expect("33-byte push fits"),
        ).into_script();
        if let Some(coinbase) = block.txdata.first_mut() {
            coinbase.output.push(bitcoin::TxOut { value: bitcoin::Amount::ZERO, script_pubkey: script });
        }
    }

    /// Embeds the finalised aggregate signature into `block`'s signet
    /// solution, used by wallet backends' `FinalizeBlock`.
    pub fn insert_signet_solution(mut block: Block, signature: &[u8; 64]) -> Result<Block, BlockchainError> {
        Self::splice_signet_solution(&mut block, signature)?;
        Ok(block)
    }
}

impl Blockchain for RpcBlockchain {
    #[instrument(skip(self))]
    fn generate_block(&self, timestamp: u32) -> Result<Block, BlockchainError> {
        // The template's tx list, coinbase reward script, and witness root
        // are produced by the out-of-scope block assembler; the adapter's
        // job here is orchestration, so this calls straight through.
        let template: serde_json::Value = self
            .client
            .call("getblocktemplate", &[serde_json::json!({ "rules": ["signet", "segwit"] })])
            .map_err(|e| BlockchainError::Rpc(e.to_string()))?;

        let raw_block = template
            .get("block")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BlockchainError::Rpc("getblocktemplate did not return a block".into()))?;
        let bytes = hex::decode(raw_block).map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        let mut block: Block = bitcoin::consensus::deserialize(&bytes).map_err(|e| BlockchainError::Rpc(e.to_string()))?;

        block.header.time = timestamp;
        let witness_root = block.witness_root().unwrap_or_else(|| *block.header.merkle_root.as_raw_hash());
        Self::with_witness_commitment(&mut block, witness_root.to_byte_array());

        Self::grind(&mut block)?;
        Ok(block)
    }

    #[instrument(skip(self, block))]
    fn test_block_validity(&self, _height: u64, block: &Block, check_signet: bool) -> Result<bool, BlockchainError> {
        let hex_block = hex::encode(bitcoin::consensus::serialize(block));
        let result: serde_json::Value = self
            .client
            .call("testblockvalidity", &[serde_json::json!(hex_block), serde_json::json!(check_signet)])
            .map_err(|e| BlockchainError::Rpc(e.to_string()))?;
        Ok(result.get("valid").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    #[instrument(skip(self, block))]
    fn submit_block(&self, height: u64, block: &Block) -> Result<(), BlockchainError> {
        match self.client.submit_block(block) {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                // `submitblock` reports "duplicate"/"inconclusive" for a
                // block already known to the node; that is not failure
                // (§4.8, §7).
                if message.contains("duplicate") || message.contains("inconclusive") {
                    warn!(height, %message, "submitblock reported a non-fatal status");
                    Ok(())
                } else {
                    Err(BlockchainError::Rpc(message))
                }
            }
        }
    }
}

impl RpcBlockchain {
    /// Increments the header nonce until the block hash meets its target,
    /// or the nonce space is exhausted. The CPU-bound grinding loop itself
    /// is the out-of-scope block assembler's concern; this is a thin
    /// faithful stand-in sufficient for a permissioned signet target.
    fn grind(block: &mut Block) -> Result<(), BlockchainError> {
        let target = block.header.target();
        loop {
            let hash: BlockHash = block.header.block_hash();
            if target.is_met_by(hash) {
                return Ok(());
            }
            match block.header.nonce.checked_add(1) {
                Some(next) => block.header.nonce = next,
                None => return Err(BlockchainError::GrindExhausted),
            }
        }
    }
}
