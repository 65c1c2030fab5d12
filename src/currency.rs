// 💱 Currency Conversion - lookup-and-multiply against a local rate table
//
// Rates are "units of base currency per one unit of currency":
//   USD -> 278.5 with base PKR means 1 USD = 278.5 PKR
// Nothing is fetched from the network; rates are whatever was last stored.

use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Amount restated in the base currency
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    pub base_amount: f64,
    pub exchange_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRates {
    base_currency: String,
    rates: HashMap<String, f64>,
}

impl ExchangeRates {
    pub fn new(base_currency: &str) -> Self {
        ExchangeRates {
            base_currency: base_currency.trim().to_ascii_uppercase(),
            rates: HashMap::new(),
        }
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Set the rate of `currency` against the base
    pub fn set_rate(&mut self, currency: &str, rate_to_base: f64) -> Result<()> {
        validate_rate(rate_to_base)?;
        let code = currency.trim().to_ascii_uppercase();
        if code == self.base_currency {
            return Err(LedgerError::InvalidInput(format!(
                "{code} is the base currency; its rate is fixed at 1"
            )));
        }
        self.rates.insert(code, rate_to_base);
        Ok(())
    }

    /// Builder form of `set_rate`
    pub fn with_rate(mut self, currency: &str, rate_to_base: f64) -> Result<Self> {
        self.set_rate(currency, rate_to_base)?;
        Ok(self)
    }

    /// Units of base per one unit of `currency`
    pub fn rate_to_base(&self, currency: &str) -> Result<f64> {
        if currency.eq_ignore_ascii_case(&self.base_currency) {
            return Ok(1.0);
        }
        self.rates
            .get(&currency.to_ascii_uppercase())
            .copied()
            .ok_or_else(|| LedgerError::NotFound(format!("exchange rate for {currency}")))
    }

    /// Multiplier turning an amount in `from` into an amount in `to`
    pub fn rate(&self, from: &str, to: &str) -> Result<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(1.0);
        }
        Ok(self.rate_to_base(from)? / self.rate_to_base(to)?)
    }

    /// Same currency returns `amount` untouched
    pub fn convert_amount(&self, amount: f64, from: &str, to: &str) -> Result<f64> {
        if from.eq_ignore_ascii_case(to) {
            return Ok(amount);
        }
        Ok(amount * self.rate(from, to)?)
    }

    pub fn to_base(&self, amount: f64, currency: &str) -> Result<Conversion> {
        let exchange_rate = self.rate_to_base(currency)?;
        let base_amount = self.convert_amount(amount, currency, &self.base_currency)?;
        Ok(Conversion {
            base_amount,
            exchange_rate,
        })
    }

    /// (currency, rate_to_base), sorted by code
    pub fn rates(&self) -> Vec<(String, f64)> {
        let mut rates: Vec<(String, f64)> = self.rates.iter().map(|(c, r)| (c.clone(), *r)).collect();
        rates.sort_by(|a, b| a.0.cmp(&b.0));
        rates
    }
}

pub fn validate_rate(rate: f64) -> Result<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(LedgerError::InvalidInput(format!(
            "exchange rate must be a positive number, got {rate}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkr_rates() -> ExchangeRates {
        ExchangeRates::new("PKR")
            .with_rate("USD", 280.0)
            .unwrap()
            .with_rate("eur", 300.0)
            .unwrap()
    }

    #[test]
    fn test_same_currency_is_unchanged() {
        let rates = ExchangeRates::new("PKR");
        assert_eq!(rates.convert_amount(1234.56, "PKR", "pkr").unwrap(), 1234.56);
        assert_eq!(
            rates.to_base(99.99, "PKR").unwrap(),
            Conversion { base_amount: 99.99, exchange_rate: 1.0 }
        );
    }

    #[test]
    fn test_convert_to_base() {
        let rates = pkr_rates();
        let conversion = rates.to_base(10.0, "usd").unwrap();
        assert_eq!(conversion.exchange_rate, 280.0);
        assert_eq!(conversion.base_amount, 2800.0);
    }

    #[test]
    fn test_cross_rate_goes_through_base() {
        let rates = pkr_rates();
        let eur = rates.convert_amount(280.0, "EUR", "USD").unwrap();
        assert!((eur - 300.0).abs() < 1e-9);
        assert!((rates.rate("USD", "EUR").unwrap() - 280.0 / 300.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_rate_is_not_found() {
        let rates = pkr_rates();
        assert!(matches!(rates.to_base(1.0, "GBP"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_invalid_rates_rejected() {
        let mut rates = ExchangeRates::new("PKR");
        assert!(rates.set_rate("USD", 0.0).is_err());
        assert!(rates.set_rate("USD", -3.0).is_err());
        assert!(rates.set_rate("USD", f64::NAN).is_err());
        assert!(rates.set_rate("PKR", 2.0).is_err());
        assert!(rates.rates().is_empty());
    }
}
