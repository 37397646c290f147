//! Trading cost models.
//!
//! The matching engine stamps every fill with the cost computed here; the
//! ledger then books exactly those amounts.

use crate::config::{AccountConfig, FeeModelKind};
use crate::matching::OrderSide;
use crate::utils::round_price;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt::Debug;
use std::sync::Arc;

/// Cost breakdown of one prospective or executed fill.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TradeCost {
    pub turnover: Decimal,
    /// Commission plus taxes and transfer fees.
    pub commission: Decimal,
    pub slippage: Decimal,
}

impl TradeCost {
    pub fn fees(&self) -> Decimal {
        self.commission + self.slippage
    }

    /// Signed cash effect: buys pay turnover plus fees, sells receive turnover less fees.
    pub fn cash_delta(&self, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => -(self.turnover + self.fees()),
            OrderSide::Sell => self.turnover - self.fees(),
        }
    }
}

/// Fee policy injected into the matching engine and the ledger.
pub trait FeeModel: Debug + Send + Sync {
    /// Shares (or units) per traded volume unit.
    fn contract_size(&self) -> Decimal;

    fn assess(&self, symbol: &str, side: OrderSide, price: Decimal, volume: Decimal) -> TradeCost;
}

/// Shanghai/Shenzhen fee schedule.
#[derive(Debug, Clone)]
pub struct AShareFees {
    pub commission_rate: Decimal,
    pub minimum_commission: Decimal,
    /// Charged on sells only.
    pub stamp_tax_rate: Decimal,
    /// Charged per started thousand shares.
    pub transfer_fee_per_thousand: Decimal,
    /// Symbol code prefixes that pay the transfer fee.
    pub transfer_fee_prefixes: Vec<String>,
    pub slippage_per_unit: Decimal,
    pub contract_size: Decimal,
}

impl AShareFees {
    pub fn from_config(account: &AccountConfig) -> Self {
        Self {
            commission_rate: account.commission_rate,
            minimum_commission: account.minimum_commission,
            stamp_tax_rate: account.stamp_tax_rate,
            transfer_fee_per_thousand: account.transfer_fee_per_thousand,
            transfer_fee_prefixes: account.transfer_fee_prefixes.clone(),
            slippage_per_unit: account.slippage_per_unit,
            contract_size: account.contract_size,
        }
    }

    fn pays_transfer_fee(&self, symbol: &str) -> bool {
        self.transfer_fee_prefixes
            .iter()
            .any(|prefix| symbol.starts_with(prefix.as_str()))
    }
}

impl FeeModel for AShareFees {
    fn contract_size(&self) -> Decimal {
        self.contract_size
    }

    fn assess(&self, symbol: &str, side: OrderSide, price: Decimal, volume: Decimal) -> TradeCost {
        let shares = volume.abs() * self.contract_size;
        let turnover = price * shares;

        let commission = round_price((turnover * self.commission_rate).max(self.minimum_commission), 2);
        let stamp_tax = match side {
            OrderSide::Sell => round_price(turnover * self.stamp_tax_rate, 2),
            OrderSide::Buy => Decimal::ZERO,
        };
        let transfer_fee = if self.pays_transfer_fee(symbol) {
            (shares / dec!(1000)).ceil() * self.transfer_fee_per_thousand
        } else {
            Decimal::ZERO
        };

        TradeCost {
            turnover,
            commission: commission + stamp_tax + transfer_fee,
            slippage: shares * self.slippage_per_unit,
        }
    }
}

/// Commission-only schedule for markets without taxes.
#[derive(Debug, Clone)]
pub struct FlatFees {
    pub commission_rate: Decimal,
    pub minimum_commission: Decimal,
    pub slippage_per_unit: Decimal,
    pub contract_size: Decimal,
}

impl FlatFees {
    pub fn from_config(account: &AccountConfig) -> Self {
        Self {
            commission_rate: account.commission_rate,
            minimum_commission: account.minimum_commission,
            slippage_per_unit: account.slippage_per_unit,
            contract_size: account.contract_size,
        }
    }
}

impl FeeModel for FlatFees {
    fn contract_size(&self) -> Decimal {
        self.contract_size
    }

    fn assess(&self, _symbol: &str, _side: OrderSide, price: Decimal, volume: Decimal) -> TradeCost {
        let shares = volume.abs() * self.contract_size;
        let turnover = price * shares;
        TradeCost {
            turnover,
            commission: round_price((turnover * self.commission_rate).max(self.minimum_commission), 2),
            slippage: shares * self.slippage_per_unit,
        }
    }
}

/// Build the configured fee model.
pub fn fee_model_from_config(account: &AccountConfig) -> Arc<dyn FeeModel> {
    match account.fee_model {
        FeeModelKind::AShare => Arc::new(AShareFees::from_config(account)),
        FeeModelKind::Flat => Arc::new(FlatFees::from_config(account)),
    }
}
