//! P2PKH address derivation

use crate::{MAINNET_LAUNCH_HEIGHT, TESTNET_LAUNCH_HEIGHT};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Network selecting the P2PKH version byte
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn p2pkh_version(self) -> u8 {
        match self {
            Network::Mainnet => 0x00,
            Network::Testnet => 0x6f,
        }
    }

    /// Height of the protocol's launch block on this network
    pub fn launch_height(self) -> u64 {
        match self {
            Network::Mainnet => MAINNET_LAUNCH_HEIGHT,
            Network::Testnet => TESTNET_LAUNCH_HEIGHT,
        }
    }
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Legacy base58check address for a public key
pub fn p2pkh_address(pubkey: &[u8], network: Network) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(network.p2pkh_version());
    payload.extend_from_slice(&hash160(pubkey));
    bs58::encode(payload).with_check().into_string()
}
