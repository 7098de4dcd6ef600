//! Chain parameters and address decoding.
//!
//! The pool mines Bitcoin-derived chains whose addresses differ only in
//! their base58 version bytes. Segwit (bech32) addresses are accepted when a
//! Bitcoin network is configured.

use std::str::FromStr;

use bitcoin::base58;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, PubkeyHash, ScriptBuf, ScriptHash};
use serde::Deserialize;
use thiserror::Error;

/// Reasons an address string cannot become an output script.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0:?} is not valid base58check")]
    Base58(String),

    #[error("address {address:?} has {len} payload bytes, expected 21")]
    Length { address: String, len: usize },

    #[error("address {address:?} has unknown version byte {version:#04x}")]
    UnknownVersion { address: String, version: u8 },

    #[error("address {0:?} is not valid for the configured network")]
    WrongNetwork(String),
}

/// Parameters that vary between chains.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChainParams {
    /// Base58 version byte of pay-to-pubkey-hash addresses
    pub pubkey_address_prefix: u8,

    /// Base58 version byte of pay-to-script-hash addresses
    pub script_address_prefix: u8,

    /// Bitcoin network used to decode bech32 addresses, if any
    #[serde(default, deserialize_with = "deserialize_network")]
    pub network: Option<Network>,

    /// Whether masternode payee amounts are already included in
    /// `coinbasevalue` and must be subtracted from the pool's share.
    #[serde(default)]
    pub masternode_payments_in_coinbase_value: bool,
}

impl ChainParams {
    /// Bitcoin mainnet parameters.
    pub fn bitcoin() -> Self {
        Self {
            pubkey_address_prefix: 0x00,
            script_address_prefix: 0x05,
            network: Some(Network::Bitcoin),
            masternode_payments_in_coinbase_value: false,
        }
    }

    /// Bitcoin regtest parameters.
    pub fn regtest() -> Self {
        Self {
            pubkey_address_prefix: 0x6f,
            script_address_prefix: 0xc4,
            network: Some(Network::Regtest),
            masternode_payments_in_coinbase_value: false,
        }
    }

    /// Turn an address into the script that pays it.
    ///
    /// Fails closed: anything that is not recognizably one of this chain's
    /// address kinds is an error, never a best-effort script.
    pub fn address_to_script(&self, address: &str) -> Result<ScriptBuf, AddressError> {
        match base58::decode_check(address) {
            Ok(payload) => self.base58_script(address, &payload),
            Err(_) => self.segwit_script(address),
        }
    }

    fn base58_script(&self, address: &str, payload: &[u8]) -> Result<ScriptBuf, AddressError> {
        if payload.len() != 21 {
            return Err(AddressError::Length {
                address: address.to_string(),
                len: payload.len(),
            });
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);

        match payload[0] {
            v if v == self.pubkey_address_prefix => {
                Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
            }
            v if v == self.script_address_prefix => {
                Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
            }
            version => Err(AddressError::UnknownVersion {
                address: address.to_string(),
                version,
            }),
        }
    }

    fn segwit_script(&self, address: &str) -> Result<ScriptBuf, AddressError> {
        let network = self
            .network
            .ok_or_else(|| AddressError::Base58(address.to_string()))?;
        let unchecked =
            Address::from_str(address).map_err(|_| AddressError::Base58(address.to_string()))?;
        let checked = unchecked
            .require_network(network)
            .map_err(|_| AddressError::WrongNetwork(address.to_string()))?;
        Ok(checked.script_pubkey())
    }
}

fn deserialize_network<'de, D>(deserializer: D) -> Result<Option<Network>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let name: Option<String> = Option::deserialize(deserializer)?;
    name.map(|n| Network::from_str(&n).map_err(serde::de::Error::custom))
        .transpose()
}

/// Build a base58check address from a version byte and hash, for tests.
#[cfg(test)]
pub(crate) fn test_address(version: u8, hash_byte: u8) -> String {
    let mut payload = vec![version];
    payload.extend_from_slice(&[hash_byte; 20]);
    base58::encode_check(&payload)
}
