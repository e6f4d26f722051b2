// Integration tests for account routing
//
// The router reads accounts from the in-memory store; token validity is
// controlled per test through small TokenGate implementations.

use async_trait::async_trait;
use brokergate_core::{
    AccountRouter, AllowAllTokenGate, ExpiryTokenGate, InMemoryAccountStore, LoadBalanceStrategy,
    RouteRequest, RouterConfig, RouterError, TokenGate,
};
use brokergate_protocol::{AccountHandle, AccountStatus, AccountType, Environment, OperationType};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Rejects the accounts it was told to reject
#[derive(Default)]
struct DenyListGate {
    denied: DashSet<Uuid>,
}

#[async_trait]
impl TokenGate for DenyListGate {
    async fn ensure_valid_token(&self, account: &AccountHandle) -> bool {
        !self.denied.contains(&account.id)
    }
}

fn store_with(accounts: &[AccountHandle]) -> Arc<InMemoryAccountStore> {
    let store = Arc::new(InMemoryAccountStore::new());
    for account in accounts {
        store.upsert(account.clone()).unwrap();
    }
    store
}

fn production(n: usize) -> Vec<AccountHandle> {
    (0..n)
        .map(|i| AccountHandle::new(format!("U{}", 2000 + i), Environment::Production))
        .collect()
}

fn router(store: Arc<InMemoryAccountStore>) -> AccountRouter {
    AccountRouter::new(store, Arc::new(AllowAllTokenGate), RouterConfig::default())
}

// =============================================================================
// Strategies
// =============================================================================

#[tokio::test]
async fn test_round_robin_visits_each_candidate_once_per_cycle() {
    let accounts = production(4);
    let router = router(store_with(&accounts));
    let request = RouteRequest::new(OperationType::Quote).with_strategy(LoadBalanceStrategy::RoundRobin);

    let mut picks = Vec::new();
    for _ in 0..12 {
        picks.push(router.route_operation(&request).await.unwrap().id);
    }
    for window in picks.windows(4) {
        let distinct: HashSet<&Uuid> = window.iter().collect();
        assert_eq!(distinct.len(), 4);
    }

    let mut sorted: Vec<Uuid> = accounts.iter().map(|a| a.id).collect();
    sorted.sort();
    assert_eq!(&picks[..4], &sorted[..]);
}

#[tokio::test]
async fn test_round_robin_cursor_is_per_operation() {
    let accounts = production(2);
    let router = router(store_with(&accounts));
    let quote = RouteRequest::new(OperationType::Quote).with_strategy(LoadBalanceStrategy::RoundRobin);
    let bars =
        RouteRequest::new(OperationType::HistoricalData).with_strategy(LoadBalanceStrategy::RoundRobin);

    let first_quote = router.route_operation(&quote).await.unwrap().id;
    let first_bars = router.route_operation(&bars).await.unwrap().id;
    assert_eq!(first_quote, first_bars);
}

#[tokio::test]
async fn test_least_used_balances_and_breaks_ties_by_id() {
    let accounts = production(3);
    let router = router(store_with(&accounts));
    let request = RouteRequest::new(OperationType::Quote).with_strategy(LoadBalanceStrategy::LeastUsed);

    let mut lowest: Vec<Uuid> = accounts.iter().map(|a| a.id).collect();
    lowest.sort();
    assert_eq!(router.route_operation(&request).await.unwrap().id, lowest[0]);

    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for _ in 0..8 {
        *counts
            .entry(router.route_operation(&request).await.unwrap().id)
            .or_default() += 1;
    }
    // 9 selections over 3 accounts
    assert!(counts.values().all(|c| *c == 3 || *c == 2));

    let stats = router.get_routing_statistics().await.unwrap();
    assert_eq!(stats.usage_distribution.values().sum::<usize>(), 9);
}

#[tokio::test]
async fn test_fastest_response_prefers_lowest_average() {
    let accounts = production(3);
    let router = router(store_with(&accounts));
    router.record_operation_response_time(accounts[0].id, 250.0);
    router.record_operation_response_time(accounts[1].id, 40.0);
    router.record_operation_response_time(accounts[1].id, 60.0);

    let request =
        RouteRequest::new(OperationType::Quote).with_strategy(LoadBalanceStrategy::FastestResponse);
    assert_eq!(router.route_operation(&request).await.unwrap().id, accounts[1].id);

    let stats = router.get_routing_statistics().await.unwrap();
    assert_eq!(stats.average_response_times.len(), 2);
    assert!(stats.average_response_times[&accounts[1].id] < 60.0);
}

#[tokio::test]
async fn test_random_only_returns_candidates() {
    let accounts = production(3);
    let router = router(store_with(&accounts));
    let excluded = accounts[2].id;
    let request = RouteRequest::new(OperationType::Quote)
        .with_strategy(LoadBalanceStrategy::Random)
        .excluding(excluded);
    for _ in 0..50 {
        assert_ne!(router.route_operation(&request).await.unwrap().id, excluded);
    }
}

// =============================================================================
// Filtering and failover inputs
// =============================================================================

#[tokio::test]
async fn test_excluding_every_candidate_yields_no_accounts() {
    let accounts = production(3);
    let router = router(store_with(&accounts));
    let request = RouteRequest::new(OperationType::Quote).excluding_all(accounts.iter().map(|a| a.id));

    match router.route_operation(&request).await {
        Err(RouterError::NoAccountsAvailable { operation }) => {
            assert_eq!(operation, OperationType::Quote)
        }
        other => panic!("unexpected routing outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_inactive_and_suspended_accounts_are_skipped() {
    let accounts = production(3);
    let store = store_with(&accounts);
    store.set_status(accounts[0].id, AccountStatus::Inactive).unwrap();
    store.set_status(accounts[1].id, AccountStatus::Suspended).unwrap();
    let router = router(store);

    let available = router
        .get_available_accounts_for_operation(OperationType::MarketData)
        .await
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, accounts[2].id);
}

#[tokio::test]
async fn test_account_type_filter() {
    let standard = AccountHandle::new("U1", Environment::Production);
    let paper = AccountHandle::new("U2", Environment::Production).with_account_type(AccountType::Paper);
    let prime = AccountHandle::new("U3", Environment::Production).with_account_type(AccountType::Prime);
    let router = router(store_with(&[standard.clone(), paper.clone(), prime]));

    let request = RouteRequest::new(OperationType::Quote)
        .with_account_type(AccountType::Paper)
        .with_strategy(LoadBalanceStrategy::RoundRobin);
    for _ in 0..4 {
        assert_eq!(router.route_operation(&request).await.unwrap().id, paper.id);
    }

    let request = RouteRequest::new(OperationType::Quote).with_account_type(AccountType::Standard);
    assert_eq!(router.route_data_operation(&request).await.unwrap().id, standard.id);

    let excluded = RouteRequest::new(OperationType::Quote)
        .with_account_type(AccountType::Paper)
        .excluding(paper.id);
    assert!(matches!(
        router.route_operation(&excluded).await,
        Err(RouterError::NoAccountsAvailable { .. })
    ));
}

#[tokio::test]
async fn test_default_data_account_then_fallback() {
    let a = AccountHandle::new("U1", Environment::Production).with_default_data(true);
    let b = AccountHandle::new("U2", Environment::Production);
    let store = store_with(&[a.clone(), b.clone()]);
    let router = router(store.clone());
    let request = RouteRequest::new(OperationType::MarketData);

    for _ in 0..3 {
        assert_eq!(router.route_data_operation(&request).await.unwrap().id, a.id);
    }

    store.set_status(a.id, AccountStatus::Inactive).unwrap();
    assert_eq!(router.route_data_operation(&request).await.unwrap().id, b.id);
}

#[tokio::test]
async fn test_default_trading_account_must_be_trading_capable() {
    let sandbox_default = AccountHandle::new("U1", Environment::Sandbox).with_default_trading(true);
    let paper = AccountHandle::new("U2", Environment::Sandbox).with_account_type(AccountType::Paper);
    let router = router(store_with(&[sandbox_default, paper.clone()]));

    let routed = router
        .route_trading_operation(&RouteRequest::new(OperationType::PlaceOrder))
        .await
        .unwrap();
    assert_eq!(routed.id, paper.id);
}

// =============================================================================
// Token gate
// =============================================================================

#[tokio::test]
async fn test_token_rejection_falls_through_to_next_candidate() {
    let accounts = production(2);
    let gate = Arc::new(DenyListGate::default());
    let mut sorted = accounts.clone();
    sorted.sort_by_key(|a| a.id);
    gate.denied.insert(sorted[0].id);

    let router = AccountRouter::new(store_with(&accounts), gate.clone(), RouterConfig::default());
    let request = RouteRequest::new(OperationType::Quote).with_strategy(LoadBalanceStrategy::LeastUsed);
    assert_eq!(router.route_operation(&request).await.unwrap().id, sorted[1].id);

    gate.denied.insert(sorted[1].id);
    match router.route_operation(&request).await {
        Err(RouterError::TokenInvalid { rejected, .. }) => {
            let rejected: HashSet<Uuid> = rejected.into_iter().collect();
            assert_eq!(rejected, accounts.iter().map(|a| a.id).collect::<HashSet<Uuid>>());
        }
        other => panic!("unexpected routing outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_default_with_invalid_token_falls_back() {
    let a = AccountHandle::new("U1", Environment::Production).with_default_data(true);
    let b = AccountHandle::new("U2", Environment::Production);
    let gate = Arc::new(DenyListGate::default());
    gate.denied.insert(a.id);
    let router = AccountRouter::new(
        store_with(&[a.clone(), b.clone()]),
        gate,
        RouterConfig::default(),
    );

    let routed = router
        .route_data_operation(&RouteRequest::new(OperationType::Quote))
        .await
        .unwrap();
    assert_eq!(routed.id, b.id);
}

#[tokio::test]
async fn test_availability_reflects_token_and_errors() {
    let fresh = AccountHandle::new("U1", Environment::Production)
        .with_token_expires_at(Utc::now() + ChronoDuration::hours(4));
    let flaky = AccountHandle::new("U2", Environment::Production)
        .with_token_expires_at(Utc::now() + ChronoDuration::hours(4))
        .with_error_count(6);
    let expired = AccountHandle::new("U3", Environment::Production)
        .with_token_expires_at(Utc::now() - ChronoDuration::minutes(5));
    let router = AccountRouter::new(
        store_with(&[fresh.clone(), flaky.clone(), expired.clone()]),
        Arc::new(ExpiryTokenGate),
        RouterConfig::default(),
    );

    let fresh = router.check_account_availability(&fresh).await;
    assert!(fresh.token_valid && fresh.can_trade && fresh.can_fetch_data);

    let flaky = router.check_account_availability(&flaky).await;
    assert!(!flaky.can_trade);
    assert!(flaky.can_fetch_data);
    assert_eq!(flaky.error_count, 6);

    let expired = router.check_account_availability(&expired).await;
    assert!(!expired.token_valid);
    assert!(!expired.can_fetch_data);

    let stats = router.get_routing_statistics().await.unwrap();
    assert_eq!(stats.total_accounts, 3);
    assert_eq!(stats.active_accounts, 3);
    assert_eq!(stats.accounts_with_errors, 1);
    assert_eq!(stats.accounts.len(), 3);
}
