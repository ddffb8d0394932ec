// ── Model pricing & cost estimation (§4.4 cost_for, §4.6 settlement) ─────
// Per-model token rates, consulted by the Execution Engine's settlement
// step and by `update_skill_price_cache`. Rates are loaded once at
// startup from the skill pricing table and treated as immutable within a
// request (§5 shared-resource policy).

use crate::atoms::constants::CHARS_PER_TOKEN_ESTIMATE;
use crate::atoms::decimal::Amount;
use crate::atoms::types::ModelPrice;
use std::collections::HashMap;

/// Per-model token rates, keyed by model name.
#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        PriceTable { prices: HashMap::new() }
    }

    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    pub fn get(&self, model: &str) -> Option<ModelPrice> {
        self.prices.get(model).copied()
    }

    /// Gross cost of a model turn: `input_tokens * rate_in + output_tokens *
    /// rate_out + cold_start_cost` (§4.6 Settlement). Rates are per million
    /// tokens, so each term divides the token count by 1_000_000 before
    /// scaling.
    pub fn model_turn_cost(&self, model: &str, input_tokens: u64, output_tokens: u64, cold_start_cost: Amount) -> Amount {
        let price = self.get(model).unwrap_or_default();
        let per_million = rust_decimal::Decimal::from(1_000_000u64);
        let rate_in = rust_decimal::Decimal::try_from(price.input_per_mtok).unwrap_or_default();
        let rate_out = rust_decimal::Decimal::try_from(price.output_per_mtok).unwrap_or_default();
        let input_cost = Amount::quantize(rust_decimal::Decimal::from(input_tokens) * rate_in / per_million);
        let output_cost = Amount::quantize(rust_decimal::Decimal::from(output_tokens) * rate_out / per_million);
        input_cost + output_cost + cold_start_cost
    }
}

/// Approximate, monotonic token estimator (§4.5): same counter for both
/// memory strategies, reproducibility favored over precision.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(CHARS_PER_TOKEN_ESTIMATE as u64).max(if text.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_is_monotonic_in_length() {
        let short = estimate_tokens("hi");
        let long = estimate_tokens(&"hi ".repeat(100));
        assert!(long > short);
    }

    #[test]
    fn estimate_tokens_empty_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn model_turn_cost_accounts_for_cold_start() {
        let mut table = PriceTable::new();
        table.insert("claude-test", ModelPrice { input_per_mtok: 3.0, output_per_mtok: 15.0 });
        let cost = table.model_turn_cost("claude-test", 1_000_000, 0, Amount::ZERO);
        assert_eq!(cost, Amount::from(3));
    }
}
