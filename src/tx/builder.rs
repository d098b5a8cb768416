//! Builds and signs relay transactions
//!
//! Creation and funding transactions are signed with the funder key, Safe
//! executions with the tx sender key. Keys live only inside the wallets.

use crate::chain::ChainClient;
use crate::config::{SecretString, Settings};
use crate::contracts::safe::{
    encode_create_proxy_with_nonce, is_exec_transaction, master_copy_from_slot,
};
use crate::error::{RelayerError, RelayerResult};
use crate::relay::record::{RelayKind, RelayRequest, SignedRelay};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

pub struct TransactionBuilder {
    client: Arc<dyn ChainClient>,
    funder: LocalWallet,
    tx_sender: LocalWallet,
    chain_id: u64,
    /// Known Safe master copies
    allowed_contracts: HashSet<Address>,
    proxy_factory: Address,
    /// v1.0.0 master copy and the factory its proxies come from
    v1_0_0_contract: Address,
    proxy_factory_v1_0_0: Address,
    /// Per-transaction value cap in wei
    max_value: U256,
}

impl TransactionBuilder {
    pub fn new(client: Arc<dyn ChainClient>, settings: &Settings) -> RelayerResult<Self> {
        let chain_id = settings.node.chain_id;
        let funder = Self::load_wallet(&settings.wallet.funder_private_key, chain_id)?;
        let tx_sender = Self::load_wallet(settings.wallet.tx_sender_key(), chain_id)?;

        let config_error = |e: anyhow::Error| RelayerError::Config(e.to_string());
        let allowed_contracts = settings.safe.allowed_contracts().map_err(config_error)?;
        let proxy_factory = settings.safe.proxy_factory().map_err(config_error)?;
        let v1_0_0_contract = settings.safe.v1_0_0_contract().map_err(config_error)?;
        let proxy_factory_v1_0_0 = settings
            .safe
            .proxy_factory_v1_0_0()
            .map_err(config_error)?;
        let max_value = settings.safe.funder_max_wei().map_err(config_error)?;

        info!(
            "Transaction builder ready: funder {:?}, tx sender {:?}, {} known master copies",
            funder.address(),
            tx_sender.address(),
            allowed_contracts.len()
        );

        Ok(Self {
            client,
            funder,
            tx_sender,
            chain_id,
            allowed_contracts,
            proxy_factory,
            v1_0_0_contract,
            proxy_factory_v1_0_0,
            max_value,
        })
    }

    fn load_wallet(key: &SecretString, chain_id: u64) -> RelayerResult<LocalWallet> {
        key.expose()
            .parse::<LocalWallet>()
            .map(|wallet| wallet.with_chain_id(chain_id))
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
    }

    fn wallet_for(&self, kind: &RelayKind) -> &LocalWallet {
        match kind {
            RelayKind::SafeExecution => &self.tx_sender,
            RelayKind::SafeCreation { .. } | RelayKind::SafeFunding => &self.funder,
        }
    }

    /// Address that will sign and pay for `kind`
    pub fn signer_for(&self, kind: &RelayKind) -> Address {
        self.wallet_for(kind).address()
    }

    /// Every distinct signing address
    pub fn signer_addresses(&self) -> Vec<Address> {
        let mut addresses = vec![self.funder.address()];
        if self.tx_sender.address() != self.funder.address() {
            addresses.push(self.tx_sender.address());
        }
        addresses
    }

    /// Reject requests that must never reach the network
    pub async fn validate(&self, request: &RelayRequest) -> RelayerResult<()> {
        if request.value > self.max_value {
            return Err(RelayerError::ValueCapExceeded {
                value: request.value,
                cap: self.max_value,
            });
        }

        if request.gas_limit.is_zero() {
            return Err(RelayerError::InvalidRequest("gas limit is zero".to_string()));
        }

        match &request.kind {
            RelayKind::SafeCreation { .. } => {
                if !request.value.is_zero() {
                    return Err(RelayerError::InvalidRequest(
                        "Safe creation carries no value".to_string(),
                    ));
                }
                self.ensure_known(request.target)
            }
            RelayKind::SafeExecution => {
                if !is_exec_transaction(&request.payload) {
                    return Err(RelayerError::InvalidRequest(
                        "payload is not an execTransaction call".to_string(),
                    ));
                }
                let slot = self.client.storage_at(request.target, H256::zero()).await?;
                let master_copy = master_copy_from_slot(slot);
                debug!(
                    "Safe {:?} uses master copy {:?}",
                    request.target, master_copy
                );
                self.ensure_known(master_copy)
            }
            RelayKind::SafeFunding => {
                if !request.payload.is_empty() {
                    return Err(RelayerError::InvalidRequest(
                        "funding transfers carry no payload".to_string(),
                    ));
                }
                if request.value.is_zero() {
                    return Err(RelayerError::InvalidRequest(
                        "funding transfer of zero value".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn ensure_known(&self, master_copy: Address) -> RelayerResult<()> {
        if self.allowed_contracts.contains(&master_copy) {
            Ok(())
        } else {
            Err(RelayerError::UnknownContractVersion {
                address: master_copy,
            })
        }
    }

    /// Proxies of the v1.0.0 master copy come from their own factory
    fn factory_for(&self, master_copy: Address) -> Address {
        if master_copy == self.v1_0_0_contract {
            self.proxy_factory_v1_0_0
        } else {
            self.proxy_factory
        }
    }

    /// Destination and calldata of the on-chain transaction
    fn call_for(&self, request: &RelayRequest) -> (Address, Bytes) {
        match &request.kind {
            RelayKind::SafeCreation { salt_nonce } => (
                self.factory_for(request.target),
                encode_create_proxy_with_nonce(request.target, &request.payload, *salt_nonce),
            ),
            RelayKind::SafeExecution | RelayKind::SafeFunding => {
                (request.target, request.payload.clone())
            }
        }
    }

    /// Build and sign a legacy transaction for `request`
    pub async fn build(
        &self,
        request: &RelayRequest,
        nonce: u64,
        gas_price: U256,
    ) -> RelayerResult<SignedRelay> {
        let wallet = self.wallet_for(&request.kind);
        let (to, data) = self.call_for(request);

        let tx: TypedTransaction = TransactionRequest::new()
            .from(wallet.address())
            .to(to)
            .value(request.value)
            .data(data.clone())
            .nonce(nonce)
            .gas(request.gas_limit)
            .gas_price(gas_price)
            .chain_id(self.chain_id)
            .into();

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let tx_hash = H256::from(keccak256(&raw));

        debug!(
            "Signed tx {:?} from {:?} to {:?} with nonce {} (selector 0x{})",
            tx_hash,
            wallet.address(),
            to,
            nonce,
            selector_hex(&data)
        );

        Ok(SignedRelay {
            signer: wallet.address(),
            to,
            nonce,
            gas_price,
            tx_hash,
            raw,
        })
    }
}

fn selector_hex(data: &[u8]) -> String {
    ::hex::encode(data.get(..4).unwrap_or(data))
}
