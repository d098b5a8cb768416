//! Relay requests and their tracked records

use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256, U256};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RelayKind {
    /// Deploy a proxy for the master copy in `target`; payload is the setup initializer
    SafeCreation { salt_nonce: U256 },
    /// Call `execTransaction` on the Safe proxy in `target`
    SafeExecution,
    /// Send ether from the funder to `target`
    SafeFunding,
}

impl RelayKind {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            RelayKind::SafeCreation { .. } => "safe_creation",
            RelayKind::SafeExecution => "safe_execution",
            RelayKind::SafeFunding => "safe_funding",
        }
    }
}

/// What a caller asks the relayer to send. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayRequest {
    pub kind: RelayKind,
    pub target: Address,
    pub payload: Bytes,
    pub value: U256,
    pub gas_limit: U256,
    /// Explicit nonce for replacements; None allocates the next one
    pub nonce: Option<u64>,
}

impl RelayRequest {
    pub fn safe_creation(
        master_copy: Address,
        initializer: Bytes,
        salt_nonce: U256,
        gas_limit: U256,
    ) -> Self {
        Self {
            kind: RelayKind::SafeCreation { salt_nonce },
            target: master_copy,
            payload: initializer,
            value: U256::zero(),
            gas_limit,
            nonce: None,
        }
    }

    pub fn safe_execution(safe: Address, calldata: Bytes, gas_limit: U256) -> Self {
        Self {
            kind: RelayKind::SafeExecution,
            target: safe,
            payload: calldata,
            value: U256::zero(),
            gas_limit,
            nonce: None,
        }
    }

    pub fn safe_funding(recipient: Address, value: U256) -> Self {
        Self {
            kind: RelayKind::SafeFunding,
            target: recipient,
            payload: Bytes::default(),
            value,
            gas_limit: U256::from(21_000),
            nonce: None,
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Upper bound of what the signer spends: value plus full gas at `gas_price`
    pub fn max_cost(&self, gas_price: U256) -> U256 {
        self.value
            .saturating_add(self.gas_limit.saturating_mul(gas_price))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RelayHandle(Uuid);

impl RelayHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RelayHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Pending,
    /// Unmined past the alert window; still tracked
    Stale,
    Mined,
    Confirmed,
    Failed,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RelayState::Confirmed | RelayState::Failed)
    }

    /// Still waiting to be seen in a block
    pub fn is_unmined(self) -> bool {
        matches!(self, RelayState::Pending | RelayState::Stale)
    }

    fn can_advance_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Pending, Stale)
                | (Pending, Mined)
                | (Stale, Mined)
                | (Mined, Confirmed)
                | (Pending, Failed)
                | (Stale, Failed)
                | (Mined, Failed)
        )
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelayState::Pending => "pending",
            RelayState::Stale => "stale",
            RelayState::Mined => "mined",
            RelayState::Confirmed => "confirmed",
            RelayState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A signed transaction ready to broadcast
#[derive(Debug, Clone)]
pub struct SignedRelay {
    pub signer: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub tx_hash: H256,
    pub raw: Bytes,
}

/// Everything known about one submitted relay
#[derive(Debug, Clone, Serialize)]
pub struct TxRelayRecord {
    pub handle: RelayHandle,
    pub request: RelayRequest,
    pub signer: Address,
    pub to: Address,
    pub nonce: u64,
    pub gas_price: U256,
    pub tx_hash: H256,
    pub signed_payload: Bytes,
    pub submitted_at: DateTime<Utc>,
    pub state: RelayState,
    pub block_number: Option<u64>,
    pub block_hash: Option<H256>,
    pub confirmations: u64,
    pub reorg_count: u32,
    pub stale_alerted: bool,
    pub failure: Option<String>,
}

impl TxRelayRecord {
    pub fn pending(handle: RelayHandle, request: RelayRequest, signed: SignedRelay) -> Self {
        Self {
            handle,
            request,
            signer: signed.signer,
            to: signed.to,
            nonce: signed.nonce,
            gas_price: signed.gas_price,
            tx_hash: signed.tx_hash,
            signed_payload: signed.raw,
            submitted_at: Utc::now(),
            state: RelayState::Pending,
            block_number: None,
            block_hash: None,
            confirmations: 0,
            reorg_count: 0,
            stale_alerted: false,
            failure: None,
        }
    }

    fn advance(&mut self, next: RelayState) -> RelayerResult<()> {
        if !self.state.can_advance_to(next) {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Flag as stale. Only the first call raises; later calls return false.
    pub fn mark_stale(&mut self) -> RelayerResult<bool> {
        if self.stale_alerted {
            return Ok(false);
        }
        self.advance(RelayState::Stale)?;
        self.stale_alerted = true;
        Ok(true)
    }

    pub fn mark_mined(&mut self, block_number: u64, block_hash: H256) -> RelayerResult<()> {
        self.advance(RelayState::Mined)?;
        self.block_number = Some(block_number);
        self.block_hash = Some(block_hash);
        Ok(())
    }

    pub fn mark_confirmed(&mut self, confirmations: u64) -> RelayerResult<()> {
        self.advance(RelayState::Confirmed)?;
        self.confirmations = confirmations;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> RelayerResult<()> {
        self.advance(RelayState::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Roll a mined record back after a reorg evicted it. Returns false when
    /// the reorg budget is exhausted and the record has failed instead.
    pub fn evict(&mut self, max_reorg_retries: u32) -> RelayerResult<bool> {
        if self.state != RelayState::Mined {
            return Err(RelayerError::InvalidStateTransition {
                from: self.state.to_string(),
                to: RelayState::Pending.to_string(),
            });
        }

        self.reorg_count += 1;
        self.block_number = None;
        self.block_hash = None;
        self.confirmations = 0;

        if self.reorg_count > max_reorg_retries {
            self.mark_failed(format!("evicted by {} reorgs", self.reorg_count))?;
            return Ok(false);
        }

        // A stale flag already raised stays raised; the state itself restarts.
        self.state = RelayState::Pending;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TxRelayRecord {
        let request = RelayRequest::safe_funding(Address::repeat_byte(1), U256::from(10));
        let signed = SignedRelay {
            signer: Address::repeat_byte(2),
            to: Address::repeat_byte(1),
            nonce: 0,
            gas_price: U256::from(1),
            tx_hash: H256::repeat_byte(3),
            raw: Bytes::from(vec![1, 2, 3]),
        };
        TxRelayRecord::pending(RelayHandle::new(), request, signed)
    }

    #[test]
    fn test_happy_path() {
        let mut record = record();
        record.mark_mined(10, H256::repeat_byte(9)).unwrap();
        record.mark_confirmed(3).unwrap();
        assert_eq!(record.state, RelayState::Confirmed);
        assert!(record.state.is_terminal());
    }

    #[test]
    fn test_no_regression() {
        let mut record = record();
        record.mark_mined(10, H256::repeat_byte(9)).unwrap();
        assert!(record.mark_stale().is_err());

        record.mark_confirmed(3).unwrap();
        assert!(record.mark_mined(11, H256::zero()).is_err());
        assert!(record.mark_failed("late").is_err());
        assert!(record.evict(3).is_err());
    }

    #[test]
    fn test_stale_flag_raised_once() {
        let mut record = record();
        assert!(record.mark_stale().unwrap());
        assert!(!record.mark_stale().unwrap());
        assert_eq!(record.state, RelayState::Stale);

        // Late inclusion is still tracked
        record.mark_mined(12, H256::repeat_byte(1)).unwrap();
        assert_eq!(record.state, RelayState::Mined);
    }

    #[test]
    fn test_reorg_rollback_is_bounded() {
        let mut record = record();
        for round in 1..=2 {
            record
                .mark_mined(10 + round, H256::repeat_byte(round as u8))
                .unwrap();
            assert!(record.evict(2).unwrap());
            assert_eq!(record.state, RelayState::Pending);
            assert_eq!(record.block_number, None);
        }

        record.mark_mined(20, H256::repeat_byte(7)).unwrap();
        assert!(!record.evict(2).unwrap());
        assert_eq!(record.state, RelayState::Failed);
        assert_eq!(record.reorg_count, 3);
    }

    #[test]
    fn test_max_cost() {
        let request = RelayRequest::safe_funding(Address::zero(), U256::from(1_000));
        assert_eq!(request.max_cost(U256::from(2)), U256::from(1_000 + 21_000 * 2));
    }

    #[test]
    fn test_record_serializes_state() {
        let record = record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["request"]["kind"]["type"], "safe_funding");
    }
}
