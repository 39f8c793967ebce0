//! External configuration (§6): `<datadir>/miner.conf.json` and the chain
//! node's `bitcoin.conf`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};

use crate::crypto::Point;
use crate::errors::ConfigError;

/// One entry of the cluster's replica set, as listed in `miner.conf.json`.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FbftReplicaSetEntry {
    pub id: u32,
    pub host: String,
    pub port: u16,
    pub p2pkh: String,
    /// A 33-byte compressed key or a 32-byte BIP-340 x-only key, both
    /// hex-encoded; [`FbftReplicaSetEntry::public_key`] normalises either
    /// to a [`Point`].
    #[serde_as(as = "Hex")]
    pub pubkey: Vec<u8>,
}

impl FbftReplicaSetEntry {
    pub fn public_key(&self) -> Result<Point, ConfigError> {
        match self.pubkey.len() {
            33 => Point::deserialize_compressed(&self.pubkey)
                .map_err(|_| ConfigError::Invalid(format!("replica {} has an invalid pubkey", self.id))),
            32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&self.pubkey);
                Point::deserialize_xonly(&bytes)
                    .map_err(|_| ConfigError::Invalid(format!("replica {} has an invalid x-only pubkey", self.id)))
            }
            _ => Err(ConfigError::Invalid(format!("replica {} pubkey must be 33 or 32 bytes", self.id))),
        }
    }
}

/// `<datadir>/miner.conf.json`.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MinerConfig {
    pub id: u32,
    #[serde_as(as = "Hex")]
    pub genesis_block_hash: Vec<u8>,
    pub genesis_block_timestamp: u32,
    pub target_block_time: f64,
    #[serde(default)]
    pub sniffer_dish_connection_string: Option<String>,
    pub fbft_replica_set: Vec<FbftReplicaSetEntry>,
}

impl MinerConfig {
    pub async fn load(datadir: &Path) -> Result<Self, ConfigError> {
        let path = datadir.join("miner.conf.json");
        let bytes = tokio::fs::read_to_string(&path).await?;
        let config: MinerConfig = serde_json::from_str(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fbft_replica_set.is_empty() {
            return Err(ConfigError::Invalid("fbft_replica_set must not be empty".into()));
        }
        if !self.fbft_replica_set.iter().any(|r| r.id == self.id) {
            return Err(ConfigError::Invalid(format!("own id {} not present in fbft_replica_set", self.id)));
        }
        if self.target_block_time <= 0.0 {
            return Err(ConfigError::Invalid("target_block_time must be positive".into()));
        }
        Ok(())
    }

    pub fn n(&self) -> u32 {
        self.fbft_replica_set.len() as u32
    }
}

/// The subset of `bitcoin.conf` the replica needs: RPC credentials, the
/// signet challenge (whose embedded group public key is the FROST group
/// key), and the ZMQ new-block publisher endpoint.
#[derive(Clone, Debug)]
pub struct ChainNodeConfig {
    pub rpc_port: u16,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub signet_challenge: Vec<u8>,
    pub zmq_pub_itcoinblock: String,
}

impl ChainNodeConfig {
    pub async fn load(datadir: &Path) -> Result<Self, ConfigError> {
        let path = datadir.join("bitcoin.conf");
        let text = tokio::fs::read_to_string(&path).await?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut fields: HashMap<String, String> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        let rpc_port = fields
            .get("rpcport")
            .ok_or_else(|| ConfigError::Invalid("bitcoin.conf missing rpcport".into()))?
            .parse()
            .map_err(|_| ConfigError::Invalid("rpcport is not a valid port".into()))?;

        let signet_challenge_hex = fields
            .get("signetchallenge")
            .ok_or_else(|| ConfigError::Invalid("bitcoin.conf missing signetchallenge".into()))?;
        let signet_challenge =
            hex::decode(signet_challenge_hex).map_err(|e| ConfigError::Invalid(format!("invalid signetchallenge: {e}")))?;

        let zmq_pub_itcoinblock = fields
            .get("zmqpubitcoinblock")
            .ok_or_else(|| ConfigError::Invalid("bitcoin.conf missing zmqpubitcoinblock".into()))?
            .clone();

        Ok(ChainNodeConfig {
            rpc_port,
            rpc_user: fields.get("rpcuser").cloned(),
            rpc_password: fields.get("rpcpassword").cloned(),
            signet_challenge,
            zmq_pub_itcoinblock,
        })
    }

    /// The group public key embedded in the signet challenge: the 33-byte
    /// compressed key with the leading `5120` (a 32-byte-push opcode
    /// prefix) stripped, per §6.
    pub fn group_public_key(&self) -> Result<Point, ConfigError> {
        let bytes = &self.signet_challenge;
        if bytes.len() == 34 && bytes[0] == 0x51 && bytes[1] == 0x20 {
            let mut xonly = [0u8; 32];
            xonly.copy_from_slice(&bytes[2..]);
            Point::deserialize_xonly(&xonly).map_err(|_| ConfigError::Invalid("invalid signet challenge key".into()))
        } else {
            Err(ConfigError::Invalid("signetchallenge is not a single-key P2TR-style script".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_conf_style_key_value_lines() {
        let text = "rpcport=38332\nrpcuser=user\nrpcpassword=pass\nsignetchallenge=5120\
                     0000000000000000000000000000000000000000000000000000000000000001\nzmqpubitcoinblock=tcp://127.0.0.1:29000\n";
        let cfg = ChainNodeConfig::parse(text).unwrap();
        assert_eq!(cfg.rpc_port, 38332);
        assert_eq!(cfg.rpc_user.as_deref(), Some("user"));
        assert_eq!(cfg.zmq_pub_itcoinblock, "tcp://127.0.0.1:29000");
    }

    #[test]
    fn rejects_missing_rpcport() {
        assert!(ChainNodeConfig::parse("signetchallenge=5120aa\n").is_err());
    }
}
