//! Byzantine-fault-tolerant block-production engine for a permissioned
//! signet-flavoured Bitcoin chain (§1): FBFT ordering plus ROAST/FROST
//! threshold Schnorr signing, tied together by the replica driver.
//!
//! Module layout follows the component table in §2: [`crypto`]/[`frost`]
//! are the cryptographic core (C1/C2), [`roast`] drives signing sessions
//! (C3), [`messages`] is the wire model (C4), [`fbft`] is the ordering
//! state machine (C5), [`replica`] is the cycle loop (C6), [`wallet`] holds
//! the two signing backends (C7), [`blockchain`] is the chain-node adapter
//! (C8), and [`store`] is the durable fact log (C9).

pub mod blockchain;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod fbft;
pub mod frost;
pub mod messages;
pub mod replica;
pub mod roast;
pub mod store;
pub mod transport;
pub mod wallet;
pub mod zmq_listener;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bitcoincore_rpc::{Auth, Client, RpcApi};

use crate::blockchain::RpcBlockchain;
use crate::config::{ChainNodeConfig, MinerConfig};
use crate::crypto::Point;
use crate::fbft::{ReplicaParams, RoastDriver};
use crate::frost::keys::{generate_with_dealer, Keypair};
use crate::replica::Replica;
use crate::roast::{NaiveSigningDriver, ThresholdRoastDriver};
use crate::store::FactStore;
use crate::transport::Transport;
use crate::wallet::naive::NaiveWallet;
use crate::wallet::roast_wallet::{MessageIdentity, RoastWallet};

/// Runs a trusted-dealer FROST key generation and writes one keypair file
/// per participant into `output_dir`, named `frost-key-<index>.json`, plus
/// `frost-group.json` holding the group public key — the pre-provisioning
/// step §1's "Explicit non-goals" assumes happened out of band before a
/// cluster starts.
pub async fn generate_keys(threshold: u16, total: u16, output_dir: &Path) -> Result<()> {
    let mut rng = rand::rngs::OsRng;
    let kg = generate_with_dealer(threshold, total, &mut rng);

    tokio::fs::create_dir_all(output_dir).await.context("creating key output directory")?;
    for (index, keypair) in &kg.shares {
        let path = output_dir.join(format!("frost-key-{index}.json"));
        let bytes = serde_json::to_vec_pretty(keypair).context("serializing keypair")?;
        tokio::fs::write(&path, bytes).await.context("writing keypair file")?;
    }
    let group_path = output_dir.join("frost-group.json");
    let group_bytes =
        serde_json::to_vec_pretty(&hex::encode(kg.group_public.serialize_compressed())).context("serializing group key")?;
    tokio::fs::write(&group_path, group_bytes).await.context("writing group key file")?;

    Ok(())
}

/// A message-signing identity backed by the chain node's wallet RPCs
/// (`signmessage`/`verifymessage`), matching [`wallet::naive::NaiveWallet`]'s
/// approach: FBFT message authentication is independent of the FROST group
/// key used for the signet solution itself (§3 "Keypair lifecycle").
struct RpcIdentity {
    client: Client,
    own_id: u32,
    own_address: bitcoin::Address,
    peer_addresses: BTreeMap<u32, bitcoin::Address>,
}

impl RpcIdentity {
    fn address_for(&self, sender_id: u32) -> Option<&bitcoin::Address> {
        if sender_id == self.own_id {
            Some(&self.own_address)
        } else {
            self.peer_addresses.get(&sender_id)
        }
    }
}

impl MessageIdentity for RpcIdentity {
    fn sign(&self, digest_hex: &str) -> Vec<u8> {
        use base64::Engine;
        let address_str = self.own_address.to_string();
        let base64_sig: Result<String, _> =
            self.client.call("signmessage", &[serde_json::json!(address_str), serde_json::json!(digest_hex)]);
        base64_sig.ok().and_then(|sig| base64::engine::general_purpose::STANDARD.decode(sig).ok()).unwrap_or_default()
    }

    fn verify(&self, sender_id: u32, digest_hex: &str, signature: &[u8]) -> bool {
        use base64::Engine;
        let Some(address) = self.address_for(sender_id) else {
            return false;
        };
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature);
        self.client
            .call::<bool>("verifymessage", &[serde_json::json!(address.to_string()), serde_json::json!(sig_b64), serde_json::json!(digest_hex)])
            .unwrap_or(false)
    }
}

/// Everything needed to run one replica, assembled from the on-disk
/// configuration at `datadir` (§6).
pub struct ReplicaSetup {
    pub replica: Replica,
}

fn rpc_client(chain_conf: &ChainNodeConfig) -> Result<(Client, String)> {
    let rpc_url = format!("http://127.0.0.1:{}", chain_conf.rpc_port);
    let auth = match (&chain_conf.rpc_user, &chain_conf.rpc_password) {
        (Some(u), Some(p)) => Auth::UserPass(u.clone(), p.clone()),
        _ => Auth::None,
    };
    let client = Client::new(&rpc_url, auth).context("connecting to chain node")?;
    Ok((client, rpc_url))
}

fn replica_params(conf: &MinerConfig) -> ReplicaParams {
    ReplicaParams {
        id: conf.id,
        n: conf.n(),
        genesis_block_timestamp: conf.genesis_block_timestamp,
        target_block_time: conf.target_block_time,
    }
}

fn p2pkh_addresses(conf: &MinerConfig) -> Result<(bitcoin::Address, BTreeMap<u32, bitcoin::Address>)> {
    let own_entry =
        conf.fbft_replica_set.iter().find(|r| r.id == conf.id).context("own replica id missing from fbft_replica_set")?;
    let own_address = own_entry.p2pkh.parse::<bitcoin::Address<_>>().context("parsing own p2pkh address")?.assume_checked();
    let peer_addresses: BTreeMap<u32, bitcoin::Address> = conf
        .fbft_replica_set
        .iter()
        .filter(|r| r.id != conf.id)
        .map(|r| Ok((r.id, r.p2pkh.parse::<bitcoin::Address<_>>()?.assume_checked())))
        .collect::<Result<_, bitcoin::address::ParseError>>()
        .context("parsing peer p2pkh addresses")?;
    Ok((own_address, peer_addresses))
}

/// Loads `<datadir>/miner.conf.json` and `<datadir>/bitcoin.conf`, connects
/// to the local chain node, and wires a [`Replica`] with the threshold
/// (ROAST/FROST) wallet backend — the cluster's actual signet-acceptance
/// path (§4.7). `reset` clears the durable fact log before resuming.
pub async fn setup_replica(datadir: &Path, reset: bool, rng_seed: u64) -> Result<ReplicaSetup> {
    let miner_conf = MinerConfig::load(datadir).await.context("loading miner.conf.json")?;
    let chain_conf = ChainNodeConfig::load(datadir).await.context("loading bitcoin.conf")?;
    let (client, rpc_url) = rpc_client(&chain_conf)?;
    let (own_address, peer_addresses) = p2pkh_addresses(&miner_conf)?;

    let signer_index = miner_conf
        .fbft_replica_set
        .iter()
        .position(|r| r.id == miner_conf.id)
        .map(|i| i as u16 + 1)
        .context("own replica id missing from fbft_replica_set")?;
    let key_path = datadir.join(format!("frost-key-{signer_index}.json"));
    let keypair: Keypair = {
        let bytes = tokio::fs::read(&key_path).await.context("reading FROST keypair")?;
        serde_json::from_slice(&bytes).context("parsing FROST keypair")?
    };

    let group_public = chain_conf.group_public_key().context("deriving group key from signet challenge")?;
    let signer_public_keys: BTreeMap<u16, Point> = miner_conf
        .fbft_replica_set
        .iter()
        .enumerate()
        .map(|(i, r)| Ok(((i as u16) + 1, r.public_key()?)))
        .collect::<Result<_, crate::errors::ConfigError>>()
        .context("decoding replica public keys")?;

    let identity = RpcIdentity { client, own_id: miner_conf.id, own_address, peer_addresses };
    let shared_wallet = Arc::new(Mutex::new(RoastWallet::new(keypair, group_public, signer_public_keys.clone(), identity)));

    let quorum = (2 * ((miner_conf.n() - 1) / 3) + 1) as usize;
    let roast_driver: Box<dyn RoastDriver + Send> =
        Box::new(ThresholdRoastDriver::new(quorum, shared_wallet.clone(), miner_conf.id, group_public, signer_public_keys));

    let blockchain = Box::new(RpcBlockchain::new(&rpc_url, chain_conf.rpc_user.as_deref(), chain_conf.rpc_password.as_deref())?);
    let transport = Box::new(NoopTransport);
    let store = FactStore::open(datadir, reset).await.context("opening fact store")?;

    let mut replica =
        Replica::new(replica_params(&miner_conf), Box::new(shared_wallet), blockchain, transport, roast_driver, store, rng_seed);
    replica.resync().await.context("resyncing from durable fact log")?;

    Ok(ReplicaSetup { replica })
}

/// Loads the FBFT replica running the naïve per-replica signing backend
/// instead of threshold FROST — a message-authentication-only fallback
/// (§4.7) that still requires a [`wallet::roast_wallet::RoastWallet`]
/// elsewhere in the cluster to produce the actual signet solution.
pub async fn setup_naive_replica(datadir: &Path, reset: bool, rng_seed: u64) -> Result<ReplicaSetup> {
    let miner_conf = MinerConfig::load(datadir).await.context("loading miner.conf.json")?;
    let chain_conf = ChainNodeConfig::load(datadir).await.context("loading bitcoin.conf")?;
    let (client, rpc_url) = rpc_client(&chain_conf)?;
    let (own_address, peer_addresses) = p2pkh_addresses(&miner_conf)?;

    let wallet = Box::new(NaiveWallet::new(client, miner_conf.id, own_address, peer_addresses));
    let quorum = (2 * ((miner_conf.n() - 1) / 3) + 1) as usize;
    let roast_driver: Box<dyn RoastDriver + Send> = Box::new(NaiveSigningDriver::new(quorum));
    let blockchain = Box::new(RpcBlockchain::new(&rpc_url, chain_conf.rpc_user.as_deref(), chain_conf.rpc_password.as_deref())?);
    let transport = Box::new(NoopTransport);
    let store = FactStore::open(datadir, reset).await.context("opening fact store")?;

    let mut replica = Replica::new(replica_params(&miner_conf), wallet, blockchain, transport, roast_driver, store, rng_seed);
    replica.resync().await.context("resyncing from durable fact log")?;
    Ok(ReplicaSetup { replica })
}

/// Placeholder the real deployment replaces with the pub/sub peer
/// transport (§1 "network transport" is an out-of-scope external
/// collaborator; [`crate::transport::InMemoryTransport`] is the in-process
/// stand-in this crate's tests drive instead).
struct NoopTransport;

#[async_trait::async_trait]
impl Transport for NoopTransport {
    async fn send(&self, _receiver: u32, _msg: crate::messages::Message) -> Result<(), crate::errors::TransportError> {
        Ok(())
    }
    async fn broadcast(&self, _msg: crate::messages::Message) -> Result<(), crate::errors::TransportError> {
        Ok(())
    }
    async fn receive(&self, _own_id: u32) -> Result<Option<crate::messages::Message>, crate::errors::TransportError> {
        Ok(None)
    }
}
