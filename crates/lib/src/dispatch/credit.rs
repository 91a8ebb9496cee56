//! Credit gating: one send attempt consumes at most one credit, checked before the transport is touched.

use crate::session::TenantId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Atomic decrement-if-available. Invoked at most once per send item.
#[async_trait]
pub trait CreditGate: Send + Sync {
    async fn try_consume(&self, tenant_id: &str, amount: u64) -> bool;
}

/// In-memory per-tenant balances. Tenants start at `initial_balance` the first time they are seen.
pub struct CreditLedger {
    balances: Mutex<HashMap<TenantId, u64>>,
    initial_balance: u64,
}

impl Default for CreditLedger {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CreditLedger {
    pub fn new(initial_balance: u64) -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            initial_balance,
        }
    }

    pub async fn balance(&self, tenant_id: &str) -> u64 {
        self.balances
            .lock()
            .await
            .get(tenant_id)
            .copied()
            .unwrap_or(self.initial_balance)
    }

    /// Add credits; returns the new balance.
    pub async fn grant(&self, tenant_id: &str, amount: u64) -> u64 {
        let mut balances = self.balances.lock().await;
        let balance = balances
            .entry(tenant_id.to_string())
            .or_insert(self.initial_balance);
        *balance = balance.saturating_add(amount);
        *balance
    }
}

#[async_trait]
impl CreditGate for CreditLedger {
    async fn try_consume(&self, tenant_id: &str, amount: u64) -> bool {
        let mut balances = self.balances.lock().await;
        let balance = balances
            .entry(tenant_id.to_string())
            .or_insert(self.initial_balance);
        if *balance < amount {
            return false;
        }
        *balance -= amount;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn consume_never_goes_negative() {
        let ledger = CreditLedger::new(2);
        assert!(ledger.try_consume("t1", 1).await);
        assert!(ledger.try_consume("t1", 1).await);
        assert!(!ledger.try_consume("t1", 1).await);
        assert_eq!(ledger.balance("t1").await, 0);
        assert_eq!(ledger.balance("t2").await, 2);
        assert_eq!(ledger.grant("t1", 5).await, 5);
    }

    #[tokio::test]
    async fn concurrent_consumers_get_exactly_the_balance() {
        let ledger = Arc::new(CreditLedger::new(0));
        ledger.grant("t1", 10).await;
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move { ledger.try_consume("t1", 1).await }));
        }
        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }
}
