//! Block template as returned by the node's `getblocktemplate`.
//!
//! Only the fields the pool reads are modelled; everything else in the
//! node's reply is ignored by serde.

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,

    /// Display-order (big-endian) hex
    pub previousblockhash: String,

    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,

    #[serde(default)]
    pub coinbaseaux: CoinbaseAux,

    /// Total value available to coinbase outputs, in satoshis
    pub coinbasevalue: u64,

    /// Big-endian hex target; preferred over `bits` when present
    #[serde(default)]
    pub target: Option<String>,

    pub curtime: u32,

    /// Compact target as 8 hex digits
    pub bits: String,

    pub height: u32,

    #[serde(default)]
    pub default_witness_commitment: Option<String>,

    /// Special-transaction payload appended to the coinbase
    #[serde(default)]
    pub coinbase_payload: Option<String>,

    #[serde(default)]
    pub masternode: Option<Payees>,

    #[serde(default)]
    pub znode: Option<Payees>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    /// Raw transaction hex
    pub data: String,

    #[serde(default)]
    pub txid: Option<String>,

    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: String,
}

/// Masternode-style payees: some nodes send one object, others a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Payees {
    One(Payee),
    Many(Vec<Payee>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Payee {
    pub payee: String,

    /// Output script hex, when the node provides it directly
    #[serde(default)]
    pub script: Option<String>,

    pub amount: u64,
}

impl Payees {
    pub fn iter(&self) -> std::slice::Iter<'_, Payee> {
        match self {
            Payees::One(payee) => std::slice::from_ref(payee).iter(),
            Payees::Many(list) => list.iter(),
        }
    }
}

impl BlockTemplate {
    /// Parse from the `result` of a getblocktemplate call.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Template(e.to_string()))
    }

    /// Compact target bits as an integer.
    pub fn bits_u32(&self) -> Result<u32> {
        u32::from_str_radix(&self.bits, 16)
            .map_err(|e| Error::Template(format!("bits {:?}: {}", self.bits, e)))
    }

    /// Previous block hash in internal (little-endian) byte order.
    pub fn prev_hash_le(&self) -> Result<[u8; 32]> {
        let mut bytes = decode_hash(&self.previousblockhash)
            .ok_or_else(|| Error::Template(format!("previousblockhash {:?}", self.previousblockhash)))?;
        bytes.reverse();
        Ok(bytes)
    }

    /// Non-coinbase transaction hashes in internal byte order.
    ///
    /// Uses `txid` where given, falling back to `hash`.
    pub fn tx_hashes_le(&self) -> Result<Vec<[u8; 32]>> {
        self.transactions
            .iter()
            .map(|tx| {
                let id = tx
                    .txid
                    .as_deref()
                    .or(tx.hash.as_deref())
                    .ok_or_else(|| Error::Template("transaction without txid".into()))?;
                let mut bytes = decode_hash(id)
                    .ok_or_else(|| Error::Template(format!("transaction id {:?}", id)))?;
                bytes.reverse();
                Ok(bytes)
            })
            .collect()
    }

    /// Concatenated raw bytes of every non-coinbase transaction.
    pub fn tx_data(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for tx in &self.transactions {
            let bytes = hex::decode(&tx.data)
                .map_err(|e| Error::Template(format!("transaction data: {}", e)))?;
            data.extend_from_slice(&bytes);
        }
        Ok(data)
    }

    /// All masternode/znode payees, in template order.
    pub fn payees(&self) -> impl Iterator<Item = &Payee> {
        self.masternode
            .iter()
            .chain(self.znode.iter())
            .flat_map(|payees| payees.iter())
    }
}

fn decode_hash(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}


#[cfg(test)]
mod tests {
    use super::test_data::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_template() {
        let template = regtest(1000, PREV_HASH, 3);
        assert_eq!(template.height, 1000);
        assert_eq!(template.bits_u32().unwrap(), 0x207fffff);
        assert_eq!(template.transactions.len(), 3);
        assert!(template.target.is_none());
    }

    #[test]
    fn test_prev_hash_is_reversed() {
        let template = regtest(1, PREV_HASH, 0);
        let le = template.prev_hash_le().unwrap();
        assert_eq!(le[0], 0xfd);
        assert_eq!(le[31], 0x00);
    }

    #[test]
    fn test_tx_hashes_prefer_txid() {
        let template = BlockTemplate::from_json(json!({
            "version": 1,
            "previousblockhash": PREV_HASH,
            "transactions": [
                { "data": "00", "txid": format!("{:064x}", 1), "hash": format!("{:064x}", 2) },
                { "data": "01", "hash": format!("{:064x}", 3) },
            ],
            "coinbasevalue": 1,
            "curtime": 1,
            "bits": "207fffff",
            "height": 1,
        }))
        .unwrap();

        let hashes = template.tx_hashes_le().unwrap();
        assert_eq!(hashes[0][0], 1);
        assert_eq!(hashes[1][0], 3);
        assert_eq!(template.tx_data().unwrap(), vec![0x00, 0x01]);
    }

    #[test]
    fn test_payees_single_and_list() {
        let template = BlockTemplate::from_json(json!({
            "version": 1,
            "previousblockhash": PREV_HASH,
            "coinbasevalue": 1,
            "curtime": 1,
            "bits": "207fffff",
            "height": 1,
            "znode": { "payee": "a", "amount": 5 },
            "masternode": [
                { "payee": "b", "amount": 6 },
                { "payee": "c", "script": "51", "amount": 7 },
            ],
        }))
        .unwrap();

        let amounts: Vec<u64> = template.payees().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![6, 7, 5]);
    }

    #[test]
    fn test_bad_hex_is_template_error() {
        let mut template = regtest(1, PREV_HASH, 0);
        template.previousblockhash = "xyz".into();
        assert!(matches!(template.prev_hash_le(), Err(Error::Template(_))));
    }
}
