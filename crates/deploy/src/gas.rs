//! Gas usage reporting for deployment receipts.

use std::sync::Mutex;

use comfy_table::{Table, presets::UTF8_FULL};

use crate::{config::GasReporterSettings, rpc::TransactionReceipt};

const WEI_PER_ETH: f64 = 1e18;

/// Notified with the receipt of every confirmed deployment transaction.
pub trait ReceiptObserver: Send + Sync {
    fn observe(&self, network: &str, contract: &str, receipt: &TransactionReceipt);
}

#[derive(Debug, Clone, PartialEq)]
pub struct GasUsage {
    pub network: String,
    pub contract: String,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

impl GasUsage {
    pub fn cost_wei(&self) -> u128 {
        u128::from(self.gas_used) * self.effective_gas_price
    }

    pub fn cost_eth(&self) -> f64 {
        self.cost_wei() as f64 / WEI_PER_ETH
    }
}

/// Collects receipts and renders them as a table.
#[derive(Debug)]
pub struct GasReport {
    settings: GasReporterSettings,
    usages: Mutex<Vec<GasUsage>>,
}

impl GasReport {
    pub fn new(settings: GasReporterSettings) -> Self {
        Self {
            settings,
            usages: Mutex::new(Vec::new()),
        }
    }

    pub fn usages(&self) -> Vec<GasUsage> {
        self.usages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_empty(&self) -> bool {
        self.usages().is_empty()
    }

    pub fn render(&self) -> String {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);

        let mut header = vec![
            "Network".to_string(),
            "Contract".to_string(),
            "Gas used".to_string(),
            "Gas price (gwei)".to_string(),
            "Cost (ETH)".to_string(),
        ];
        if self.settings.eth_price.is_some() {
            header.push(format!("Cost ({})", self.settings.currency));
        }
        table.set_header(header);

        for usage in self.usages() {
            let mut row = vec![
                usage.network.clone(),
                usage.contract.clone(),
                usage.gas_used.to_string(),
                format!("{:.2}", usage.effective_gas_price as f64 / 1e9),
                format!("{:.6}", usage.cost_eth()),
            ];
            if let Some(price) = self.settings.eth_price {
                row.push(format!("{:.2}", usage.cost_eth() * price));
            }
            table.add_row(row);
        }

        table.to_string()
    }
}

impl ReceiptObserver for GasReport {
    fn observe(&self, network: &str, contract: &str, receipt: &TransactionReceipt) {
        let usage = GasUsage {
            network: network.to_string(),
            contract: contract.to_string(),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
        };

        tracing::debug!(
            network,
            contract,
            gas_used = usage.gas_used,
            cost_eth = usage.cost_eth(),
            "Recorded gas usage"
        );

        self.usages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(usage);
    }
}
