//! Forgiving decoders for the loosely typed values the source API returns.
//!
//! Amounts and counts arrive as JSON numbers or numeric strings, money as a
//! `{shopMoney: {amount, currencyCode}}` bag or a bare `{amount}`. Absent or
//! malformed values decode to zero instead of failing the record.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Float from a number or numeric string; 0.0 otherwise.
pub fn lenient_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Integer from a number or integer string; 0 otherwise. Fractional numbers
/// are truncated.
pub fn lenient_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Amount of a money value in either shape, 0.0 when absent.
pub fn get_money(value: &Value) -> f64 {
    let Some(obj) = value.as_object() else {
        return 0.0;
    };
    match obj.get("shopMoney").and_then(Value::as_object) {
        Some(shop) if !shop.is_empty() => lenient_f64(shop.get("amount")),
        _ => lenient_f64(obj.get("amount")),
    }
}

/// Currency code of a money value in either shape.
pub fn get_currency(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    let code = match obj.get("shopMoney").and_then(Value::as_object) {
        Some(shop) if !shop.is_empty() => shop.get("currencyCode"),
        _ => obj.get("currencyCode"),
    };
    code.and_then(Value::as_str).map(str::to_string)
}

/// Decoded money value. Never fails to deserialize.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Money {
    pub amount: f64,
    pub currency: Option<String>,
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Money {
            amount: get_money(&value),
            currency: get_currency(&value),
        })
    }
}

pub fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(lenient_f64(Some(&value)))
}

pub fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(lenient_i64(Some(&value)))
}

/// Treat an explicit `null` like a missing field.
pub fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
