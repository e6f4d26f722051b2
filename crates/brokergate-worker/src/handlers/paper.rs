//! Paper brokerage backend.
//!
//! Simulates quotes, orders and positions for one account session. Prices
//! are derived deterministically from the symbol so repeated calls agree.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{HandlerError, RegistryError};
use crate::registry::MethodRegistry;
use crate::session::SessionContext;

pub const DEFAULT_STARTING_CASH: f64 = 1_000_000.0;

const SPREAD: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    pub limit_price: Option<f64>,
    pub fill_price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperPosition {
    pub symbol: String,
    pub quantity: u64,
    pub market_value: f64,
}

#[derive(Debug)]
struct LedgerState {
    cash: f64,
    positions: BTreeMap<String, u64>,
    orders: BTreeMap<u64, PaperOrder>,
    next_order_id: u64,
}

/// Cash, positions and orders of one simulated account
#[derive(Debug)]
pub struct PaperLedger {
    account_number: String,
    state: Mutex<LedgerState>,
}

impl PaperLedger {
    pub fn new(session: &SessionContext, starting_cash: f64) -> Arc<Self> {
        Arc::new(Self {
            account_number: session.account.account_number.clone(),
            state: Mutex::new(LedgerState {
                cash: starting_cash,
                positions: BTreeMap::new(),
                orders: BTreeMap::new(),
                next_order_id: 1,
            }),
        })
    }

    pub fn cash(&self) -> f64 {
        self.state.lock().cash
    }

    pub fn place_order(&self, request: OrderRequest) -> Result<PaperOrder, HandlerError> {
        let symbol = normalize_symbol(&request.symbol)?;
        if request.quantity == 0 {
            return Err(HandlerError::invalid("quantity must be positive"));
        }
        if let Some(limit) = request.limit_price {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(HandlerError::invalid("limit_price must be positive"));
            }
        }

        let price = reference_price(&symbol);
        let marketable = match (request.side, request.limit_price) {
            (_, None) => true,
            (Side::Buy, Some(limit)) => limit >= price,
            (Side::Sell, Some(limit)) => limit <= price,
        };

        let mut state = self.state.lock();
        let order_id = state.next_order_id;
        state.next_order_id += 1;

        let mut order = PaperOrder {
            order_id,
            symbol: symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            limit_price: request.limit_price,
            fill_price: None,
            status: OrderStatus::Submitted,
            created_at: Utc::now(),
        };

        if marketable {
            let notional = price * request.quantity as f64;
            match request.side {
                Side::Buy => {
                    if notional > state.cash {
                        return Err(HandlerError::rejected(format!(
                            "insufficient cash: need {:.2}, have {:.2}",
                            notional, state.cash
                        )));
                    }
                    state.cash -= notional;
                    *state.positions.entry(symbol.clone()).or_insert(0) += request.quantity;
                }
                Side::Sell => {
                    let held = state.positions.get(&symbol).copied().unwrap_or(0);
                    if held < request.quantity {
                        return Err(HandlerError::rejected(format!(
                            "insufficient position in {}: hold {}, selling {}",
                            symbol, held, request.quantity
                        )));
                    }
                    state.cash += notional;
                    if held == request.quantity {
                        state.positions.remove(&symbol);
                    } else {
                        state.positions.insert(symbol.clone(), held - request.quantity);
                    }
                }
            }
            order.fill_price = Some(price);
            order.status = OrderStatus::Filled;
        }

        state.orders.insert(order_id, order.clone());
        Ok(order)
    }

    pub fn cancel_order(&self, order_id: u64) -> Result<PaperOrder, HandlerError> {
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| HandlerError::rejected(format!("order {} not found", order_id)))?;
        if order.status != OrderStatus::Submitted {
            return Err(HandlerError::rejected(format!(
                "order {} cannot be cancelled in state {:?}",
                order_id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(order.clone())
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.state.lock().orders.values().cloned().collect()
    }

    pub fn positions(&self) -> Vec<PaperPosition> {
        self.state
            .lock()
            .positions
            .iter()
            .map(|(symbol, quantity)| PaperPosition {
                symbol: symbol.clone(),
                quantity: *quantity,
                market_value: reference_price(symbol) * *quantity as f64,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: u64,
    #[serde(default)]
    pub limit_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QuoteParams {
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct MarketParams {
    #[serde(default = "default_market")]
    market: String,
}

fn default_market() -> String {
    "US".to_string()
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    order_id: u64,
}

#[derive(Debug, Deserialize)]
struct NoParams {}

fn normalize_symbol(raw: &str) -> Result<String, HandlerError> {
    let symbol = raw.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(HandlerError::invalid("symbol must not be empty"));
    }
    Ok(symbol)
}

/// Deterministic price in [10, 510) with cent precision
fn reference_price(symbol: &str) -> f64 {
    let hash = symbol
        .bytes()
        .fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    10.0 + (hash % 50_000) as f64 / 100.0
}

/// Register `quote.*` and `trade.*` against `ledger`
pub fn register_paper_brokerage(
    registry: &mut MethodRegistry,
    ledger: Arc<PaperLedger>,
) -> Result<(), RegistryError> {
    registry.register_typed("quote", "get_market_status", |session, params: MarketParams| async move {
        Ok::<_, HandlerError>(json!({
            "market": params.market.to_uppercase(),
            "status": "trading",
            "environment": session.account.environment,
            "as_of": Utc::now(),
        }))
    })?;

    registry.register_typed("quote", "get_quote", |_session, params: QuoteParams| async move {
        let symbol = normalize_symbol(&params.symbol)?;
        let price = reference_price(&symbol);
        Ok::<_, HandlerError>(json!({
            "symbol": symbol,
            "price": price,
            "bid": price - SPREAD,
            "ask": price + SPREAD,
            "as_of": Utc::now(),
        }))
    })?;

    let account_ledger = Arc::clone(&ledger);
    registry.register_typed("trade", "get_account", move |session, _params: NoParams| {
        let ledger = Arc::clone(&account_ledger);
        async move {
            let positions = ledger.positions();
            let market_value: f64 = positions.iter().map(|p| p.market_value).sum();
            let cash = ledger.cash();
            Ok::<_, HandlerError>(json!({
                "account_number": ledger.account_number,
                "environment": session.account.environment,
                "cash": cash,
                "market_value": market_value,
                "net_liquidation": cash + market_value,
                "positions_count": positions.len(),
            }))
        }
    })?;

    let order_ledger = Arc::clone(&ledger);
    registry.register_typed("trade", "place_order", move |_session, request: OrderRequest| {
        let ledger = Arc::clone(&order_ledger);
        async move { ledger.place_order(request) }
    })?;

    let cancel_ledger = Arc::clone(&ledger);
    registry.register_typed("trade", "cancel_order", move |_session, params: CancelParams| {
        let ledger = Arc::clone(&cancel_ledger);
        async move { ledger.cancel_order(params.order_id) }
    })?;

    let orders_ledger = Arc::clone(&ledger);
    registry.register_typed("trade", "get_orders", move |_session, _params: NoParams| {
        let ledger = Arc::clone(&orders_ledger);
        async move { Ok::<_, HandlerError>(ledger.orders()) }
    })?;

    registry.register_typed("trade", "get_positions", move |_session, _params: NoParams| {
        let ledger = Arc::clone(&ledger);
        async move { Ok::<_, HandlerError>(ledger.positions()) }
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::test_session;

    fn ledger(cash: f64) -> Arc<PaperLedger> {
        PaperLedger::new(&test_session(), cash)
    }

    fn market(symbol: &str, side: Side, quantity: u64) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            side,
            quantity,
            limit_price: None,
        }
    }

    #[test]
    fn test_reference_price_is_stable() {
        assert_eq!(reference_price("AAPL"), reference_price("AAPL"));
        let price = reference_price("TSLA");
        assert!((10.0..510.0).contains(&price));
    }

    #[test]
    fn test_market_buy_then_sell() {
        let ledger = ledger(DEFAULT_STARTING_CASH);
        let bought = ledger.place_order(market("aapl", Side::Buy, 10)).unwrap();
        assert_eq!(bought.status, OrderStatus::Filled);
        assert_eq!(bought.symbol, "AAPL");
        assert_eq!(ledger.positions()[0].quantity, 10);

        ledger.place_order(market("AAPL", Side::Sell, 10)).unwrap();
        assert!(ledger.positions().is_empty());
        assert!((ledger.cash() - DEFAULT_STARTING_CASH).abs() < 1e-6);
    }

    #[test]
    fn test_rejections() {
        let ledger = ledger(1.0);
        assert!(matches!(
            ledger.place_order(market("AAPL", Side::Buy, 1000)),
            Err(HandlerError::Rejected(_))
        ));
        assert!(matches!(
            ledger.place_order(market("AAPL", Side::Sell, 1)),
            Err(HandlerError::Rejected(_))
        ));
        assert!(matches!(
            ledger.place_order(market("AAPL", Side::Buy, 0)),
            Err(HandlerError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_resting_limit_order_can_be_cancelled() {
        let ledger = ledger(DEFAULT_STARTING_CASH);
        let order = ledger
            .place_order(OrderRequest {
                symbol: "MSFT".to_string(),
                side: Side::Buy,
                quantity: 5,
                limit_price: Some(1.0),
            })
            .unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);

        let cancelled = ledger.cancel_order(order.order_id).unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(ledger.cancel_order(order.order_id).is_err());
    }
}
