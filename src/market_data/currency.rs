use std::collections::BTreeMap;

use serde::Serialize;

use crate::market_data::market_state::MarketError;

pub const BASE_CURRENCY: &str = "USD";

/// (code, display symbol, name, units per 1 USD)
const DEFAULT_CURRENCIES: [(&str, &str, &str, f64); 9] = [
    ("USD", "$", "US Dollar", 1.0),
    ("EUR", "€", "Euro", 0.92),
    ("GBP", "£", "British Pound", 0.79),
    ("JPY", "¥", "Japanese Yen", 149.82),
    ("INR", "₹", "Indian Rupee", 83.25),
    ("CNY", "¥", "Chinese Yuan", 7.09),
    ("CHF", "Fr", "Swiss Franc", 0.90),
    ("CAD", "$", "Canadian Dollar", 1.37),
    ("AUD", "$", "Australian Dollar", 1.51),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrencyInfo {
    pub code: String,
    pub symbol: String,
    pub name: String,
    pub usd_rate: f64,
}

/// Display currency selection plus the USD exchange-rate table.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrencyContext {
    selected: String,
    currencies: BTreeMap<String, CurrencyInfo>,
}

impl Default for CurrencyContext {
    fn default() -> Self {
        let currencies = DEFAULT_CURRENCIES
            .iter()
            .map(|(code, symbol, name, rate)| {
                let info = CurrencyInfo {
                    code: code.to_string(),
                    symbol: symbol.to_string(),
                    name: name.to_string(),
                    usd_rate: *rate,
                };
                (code.to_string(), info)
            })
            .collect();
        Self { selected: BASE_CURRENCY.to_string(), currencies }
    }
}

fn normalise_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

impl CurrencyContext {
    pub fn selected(&self) -> &str {
        &self.selected
    }

    pub fn select(&mut self, code: &str) -> Result<(), MarketError> {
        let code = normalise_code(code);
        if !self.currencies.contains_key(&code) {
            return Err(MarketError::UnknownCurrency(code));
        }
        self.selected = code;
        Ok(())
    }

    pub fn info(&self, code: &str) -> Option<&CurrencyInfo> {
        self.currencies.get(&normalise_code(code))
    }

    pub fn rate(&self, code: &str) -> Option<f64> {
        self.info(code).map(|c| c.usd_rate)
    }

    /// Merge new rates into the table. Unknown codes are added with the code
    /// as their display symbol; non-positive or non-finite rates are ignored.
    pub fn update_exchange_rates<I, S>(&mut self, rates: I) -> usize
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        let mut applied = 0;
        for (code, rate) in rates {
            if !rate.is_finite() || rate <= 0.0 {
                continue;
            }
            let code = normalise_code(code.as_ref());
            if code == BASE_CURRENCY {
                continue;
            }
            self.currencies
                .entry(code.clone())
                .and_modify(|info| info.usd_rate = rate)
                .or_insert_with(|| CurrencyInfo {
                    code: code.clone(),
                    symbol: code.clone(),
                    name: code.clone(),
                    usd_rate: rate,
                });
            applied += 1;
        }
        applied
    }
}
