//! Exhaustive error kinds (§7). Every error produced inside the replica is
//! contained here; none of these propagate past the replica boundary —
//! callers in `replica` and `fbft` turn them into a dropped message, a
//! protocol transition, or a log line.

use thiserror::Error;

/// Errors from the curve-primitive layer (C1).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    #[error("scalar is not a canonical field element")]
    ScalarOverflow,
    #[error("scalar has no multiplicative inverse (is zero)")]
    ScalarNotInvertible,
    #[error("failed to decode curve point")]
    PointDecode,
}

/// Errors from the FROST signer (C2).
#[derive(Error, Debug)]
pub enum FrostError {
    #[error("duplicate participant index in signer set")]
    DuplicateIndex,
    #[error("commitment list and response list have different sizes")]
    MismatchedCommitmentsAndResponses,
    #[error("invalid signature share from signer {signer}")]
    InvalidSignerResponse { signer: u16 },
    #[error("no commitment on file for signer {signer}")]
    UnknownSigner { signer: u16 },
    #[error("signing requested without a live nonce")]
    NonceMissing,
    #[error("duplicate share indices make the Lagrange denominator zero")]
    DuplicateShares,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors surfaced while verifying or encoding a wire message (C4).
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("wire codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Errors from the blockchain adapter (C8).
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("chain-node RPC failed: {0}")]
    Rpc(String),
    #[error("block failed testblockvalidity")]
    BlockInvalid,
    #[error("signet header/solution splice failed: {0}")]
    SignetSplice(String),
    #[error("PoW grinding exhausted the nonce space")]
    GrindExhausted,
}

/// Errors from a wallet adapter (C7).
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("signing requested without a live nonce")]
    NonceMissing,
    #[error(transparent)]
    Frost(#[from] FrostError),
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
    #[error("request referenced by a message is unknown locally")]
    RequestMissing,
    #[error("naive wallet backend cannot finalize a signet solution locally; combining per-replica signatures is a PSBT concern owned by the out-of-scope blockchain adapter")]
    NaiveFinalizeUnsupported,
}

/// Errors from the peer transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport send error: {0}")]
    Send(String),
    #[error("transport broadcast error: {0}")]
    Broadcast(String),
    #[error("transport receive error: {0}")]
    Receive(String),
}

/// Errors from the persistent fact store (C9).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Errors raised while loading `miner.conf.json` / `bitcoin.conf`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the FBFT state machine (C5) and replica driver (C6).
#[derive(Error, Debug)]
pub enum FbftError {
    #[error("PRE-PREPARE references an unknown request")]
    RequestMissing,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("block failed testblockvalidity")]
    BlockInvalid,
    #[error("signing requested without a live nonce")]
    NonceMissing,
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Blockchain(#[from] BlockchainError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Message(#[from] MessageError),
}
