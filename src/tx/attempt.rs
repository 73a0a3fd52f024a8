//! Signing keys and attempt construction

use super::gas::GasPrice;
use crate::error::{TxmError, TxmResult};
use crate::state::{NewAttempt, Transaction};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Local wallets indexed by address
pub struct KeyStore {
    wallets: HashMap<Address, LocalWallet>,
}

impl KeyStore {
    /// Load hex private keys, with or without a `0x` prefix
    pub fn from_hex_keys<S: AsRef<str>>(keys: &[S], chain_id: u64) -> TxmResult<Self> {
        let mut wallets = HashMap::new();
        for key in keys {
            let key = key.as_ref().trim();
            let bytes = ::hex::decode(key.trim_start_matches("0x"))
                .map_err(|e| TxmError::Wallet(format!("Private key is not hex: {}", e)))?;
            let wallet = LocalWallet::from_bytes(&bytes)
                .map_err(|e| TxmError::Wallet(format!("Invalid private key: {}", e)))?
                .with_chain_id(chain_id);
            info!(address = ?wallet.address(), "Loaded signing key");
            wallets.insert(wallet.address(), wallet);
        }
        if wallets.is_empty() {
            return Err(TxmError::Wallet("no signing keys configured".to_string()));
        }
        Ok(Self { wallets })
    }

    /// Load comma-separated keys from an environment variable
    pub fn from_env(var: &str, chain_id: u64) -> TxmResult<Self> {
        let raw = std::env::var(var).map_err(|_| {
            TxmError::Wallet(format!("No wallet configured. Set {} to hex private keys", var))
        })?;
        let keys: Vec<&str> = raw.split(',').filter(|k| !k.trim().is_empty()).collect();
        Self::from_hex_keys(&keys, chain_id)
    }

    /// Addresses in ascending order
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.wallets.keys().copied().collect();
        addresses.sort();
        addresses
    }

    pub fn contains(&self, address: Address) -> bool {
        self.wallets.contains_key(&address)
    }

    /// Sign with the wallet of `from`, returning the raw bytes and their hash
    pub fn sign(&self, from: Address, tx: &TypedTransaction) -> TxmResult<(Bytes, H256)> {
        let wallet = self.wallets.get(&from).ok_or(TxmError::KeyNotFound {
            address: format!("{:?}", from),
        })?;
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| TxmError::Wallet(format!("Failed to sign transaction: {}", e)))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok((raw, hash))
    }
}

/// What a signed attempt encodes
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub nonce: i64,
    pub gas_price: GasPrice,
    pub gas_limit: u64,
}

/// Builds and signs attempts for one chain
pub struct AttemptBuilder {
    keys: Arc<KeyStore>,
    chain_id: u64,
}

impl AttemptBuilder {
    pub fn new(keys: Arc<KeyStore>, chain_id: u64) -> Self {
        Self { keys, chain_id }
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Attempt of `tx` at `nonce` and the given price
    pub fn new_attempt(
        &self,
        tx: &Transaction,
        nonce: i64,
        gas_price: GasPrice,
        gas_limit: u64,
    ) -> TxmResult<NewAttempt> {
        self.sign(AttemptRequest {
            from: tx.from_address,
            to: tx.to_address,
            data: tx.payload.clone(),
            value: tx.value,
            nonce,
            gas_price,
            gas_limit,
        })
    }

    /// Re-priced attempt of a transaction that already holds a nonce
    pub fn repriced_attempt(
        &self,
        tx: &Transaction,
        gas_price: GasPrice,
        gas_limit: u64,
    ) -> TxmResult<NewAttempt> {
        let nonce = tx.nonce.ok_or_else(|| {
            TxmError::InvariantViolation(format!("transaction {} has no nonce", tx.id))
        })?;
        self.new_attempt(tx, nonce, gas_price, gas_limit)
    }

    /// Zero-value transfer to self, used to fill a nonce gap
    pub fn new_empty_attempt(
        &self,
        address: Address,
        nonce: i64,
        gas_price: GasPrice,
        gas_limit: u64,
    ) -> TxmResult<NewAttempt> {
        self.sign(AttemptRequest {
            from: address,
            to: address,
            data: Bytes::default(),
            value: U256::zero(),
            nonce,
            gas_price,
            gas_limit,
        })
    }

    pub fn sign(&self, req: AttemptRequest) -> TxmResult<NewAttempt> {
        if req.nonce < 0 {
            return Err(TxmError::InvariantViolation(format!(
                "cannot sign negative nonce {}",
                req.nonce
            )));
        }
        let tx = build_typed_tx(&req, self.chain_id);
        let (raw, hash) = self.keys.sign(req.from, &tx)?;
        Ok(NewAttempt {
            gas_price: req.gas_price,
            gas_limit: req.gas_limit,
            signed_raw_tx: raw,
            hash,
        })
    }
}

fn build_typed_tx(req: &AttemptRequest, chain_id: u64) -> TypedTransaction {
    match req.gas_price {
        GasPrice::Legacy(price) => {
            let tx = TransactionRequest::new()
                .from(req.from)
                .to(req.to)
                .data(req.data.clone())
                .value(req.value)
                .nonce(req.nonce as u64)
                .gas(req.gas_limit)
                .gas_price(price)
                .chain_id(chain_id);
            TypedTransaction::Legacy(tx)
        }
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let tx = Eip1559TransactionRequest::new()
                .from(req.from)
                .to(req.to)
                .data(req.data.clone())
                .value(req.value)
                .nonce(req.nonce as u64)
                .gas(req.gas_limit)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(chain_id);
            TypedTransaction::Eip1559(tx)
        }
    }
}
