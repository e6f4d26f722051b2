//! Operation types used to pick eligible accounts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Market data reads
    Data,
    /// Order placement and modification
    Trading,
    /// Account, position and analysis queries
    Account,
}

/// Operation requested by a caller of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    MarketData,
    Quote,
    HistoricalData,
    Fundamentals,
    OptionsChain,
    PlaceOrder,
    ModifyOrder,
    CancelOrder,
    AccountInfo,
    Positions,
    Orders,
    Transactions,
    PortfolioAnalysis,
    RiskAnalysis,
}

impl OperationType {
    pub const ALL: [OperationType; 14] = [
        OperationType::MarketData,
        OperationType::Quote,
        OperationType::HistoricalData,
        OperationType::Fundamentals,
        OperationType::OptionsChain,
        OperationType::PlaceOrder,
        OperationType::ModifyOrder,
        OperationType::CancelOrder,
        OperationType::AccountInfo,
        OperationType::Positions,
        OperationType::Orders,
        OperationType::Transactions,
        OperationType::PortfolioAnalysis,
        OperationType::RiskAnalysis,
    ];

    pub fn class(&self) -> OperationClass {
        match self {
            OperationType::MarketData
            | OperationType::Quote
            | OperationType::HistoricalData
            | OperationType::Fundamentals
            | OperationType::OptionsChain => OperationClass::Data,
            OperationType::PlaceOrder | OperationType::ModifyOrder | OperationType::CancelOrder => {
                OperationClass::Trading
            }
            OperationType::AccountInfo
            | OperationType::Positions
            | OperationType::Orders
            | OperationType::Transactions
            | OperationType::PortfolioAnalysis
            | OperationType::RiskAnalysis => OperationClass::Account,
        }
    }

    pub fn is_data(&self) -> bool {
        self.class() == OperationClass::Data
    }

    pub fn is_trading(&self) -> bool {
        self.class() == OperationClass::Trading
    }

    /// Whether routing under this operation satisfies `required`
    pub fn permits(&self, required: OperationClass) -> bool {
        match required {
            OperationClass::Data => true,
            OperationClass::Account => !self.is_data(),
            OperationClass::Trading => self.is_trading(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::MarketData => "market_data",
            OperationType::Quote => "quote",
            OperationType::HistoricalData => "historical_data",
            OperationType::Fundamentals => "fundamentals",
            OperationType::OptionsChain => "options_chain",
            OperationType::PlaceOrder => "place_order",
            OperationType::ModifyOrder => "modify_order",
            OperationType::CancelOrder => "cancel_order",
            OperationType::AccountInfo => "account_info",
            OperationType::Positions => "positions",
            OperationType::Orders => "orders",
            OperationType::Transactions => "transactions",
            OperationType::PortfolioAnalysis => "portfolio_analysis",
            OperationType::RiskAnalysis => "risk_analysis",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
