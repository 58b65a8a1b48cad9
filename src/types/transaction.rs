//! Transaction records received from the upstream stream

use crate::error::ParseFault;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A card transaction as pushed by the upstream stream.
///
/// Only `trans_num` is required. The fields below are the ones the pipeline reads;
/// everything else (customer identity, card and account numbers, address, ...) is kept
/// verbatim in `extra` and written back out on serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction identifier
    pub trans_num: String,

    /// Transaction amount
    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub amt: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant: Option<String>,

    /// Merchant category (e.g. `grocery_pos`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    /// Customer latitude
    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,

    /// Customer longitude
    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub long: Option<f64>,

    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub merch_lat: Option<f64>,

    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub merch_long: Option<f64>,

    /// Population of the customer's city
    #[serde(default, deserialize_with = "lenient::opt_f64", skip_serializing_if = "Option::is_none")]
    pub city_pop: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,

    /// Date of birth, `YYYY-MM-DD`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,

    /// Customer state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merch_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trans_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trans_time: Option<String>,

    #[serde(default, deserialize_with = "lenient::opt_i64", skip_serializing_if = "Option::is_none")]
    pub unix_time: Option<i64>,

    /// Passthrough fields not interpreted by the pipeline
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Transaction {
    /// Create a transaction carrying only its identifier
    pub fn new(trans_num: impl Into<String>) -> Self {
        Self {
            trans_num: trans_num.into(),
            amt: None,
            merchant: None,
            category: None,
            lat: None,
            long: None,
            merch_lat: None,
            merch_long: None,
            city_pop: None,
            gender: None,
            job: None,
            dob: None,
            state: None,
            merch_state: None,
            trans_date: None,
            trans_time: None,
            unix_time: None,
            extra: Map::new(),
        }
    }

    /// Set the amount
    pub fn with_amount(mut self, amt: f64) -> Self {
        self.amt = Some(amt);
        self
    }

    /// Set the merchant category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Parse a stream payload, rejecting records without a usable `trans_num`
    pub fn from_payload(payload: &str) -> Result<Self, ParseFault> {
        let transaction: Transaction = serde_json::from_str(payload)?;
        transaction.validated()
    }

    /// Check the correlation key
    pub fn validated(mut self) -> Result<Self, ParseFault> {
        let trimmed = self.trans_num.trim();
        if trimmed.is_empty() {
            return Err(ParseFault::MissingTransNum);
        }
        if trimmed.len() != self.trans_num.len() {
            self.trans_num = trimmed.to_string();
        }
        Ok(self)
    }
}

/// Upstream feeds mix JSON numbers and numeric strings for the same field.
mod lenient {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Numeric>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Numeric::Int(v)) => Ok(Some(v as f64)),
            Some(Numeric::Float(v)) => Ok(Some(v)),
            Some(Numeric::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Numeric::Text(s)) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("expected a number, got {s:?}"))),
        }
    }

    pub fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Numeric>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Numeric::Int(v)) => Ok(Some(v)),
            Some(Numeric::Float(v)) => Ok(Some(v as i64)),
            Some(Numeric::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(Numeric::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| serde::de::Error::custom(format!("expected an integer, got {s:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_record() {
        let payload = r#"{
            "trans_num": "T1", "amt": 100.50, "category": "shopping_net",
            "lat": "40.7", "long": -74.0, "city_pop": "8000000", "unix_time": 1672531200,
            "ssn": "123-45-6789", "first": "Jane", "zip": 10001
        }"#;

        let tx = Transaction::from_payload(payload).unwrap();
        assert_eq!(tx.trans_num, "T1");
        assert_eq!(tx.amt, Some(100.50));
        assert_eq!(tx.lat, Some(40.7));
        assert_eq!(tx.city_pop, Some(8_000_000.0));
        assert_eq!(tx.unix_time, Some(1_672_531_200));
        assert_eq!(tx.extra.get("ssn"), Some(&Value::from("123-45-6789")));
        assert_eq!(tx.extra.get("zip"), Some(&Value::from(10001)));
        assert!(!tx.extra.contains_key("amt"));
    }

    #[test]
    fn test_passthrough_fields_survive_serialization() {
        let tx = Transaction::from_payload(r#"{"trans_num":"T2","cc_num":"4111","amt":""}"#).unwrap();
        assert_eq!(tx.amt, None);

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["trans_num"], "T2");
        assert_eq!(json["cc_num"], "4111");
        assert!(json.get("amt").is_none());
    }

    #[test]
    fn test_missing_trans_num_is_rejected() {
        assert!(matches!(
            Transaction::from_payload(r#"{"amt": 5}"#),
            Err(ParseFault::Json(_))
        ));
        assert!(matches!(
            Transaction::from_payload(r#"{"trans_num": "  "}"#),
            Err(ParseFault::MissingTransNum)
        ));
        assert!(matches!(
            Transaction::from_payload("{not json"),
            Err(ParseFault::Json(_))
        ));
    }

    #[test]
    fn test_non_numeric_amount_is_rejected() {
        assert!(Transaction::from_payload(r#"{"trans_num":"T3","amt":"lots"}"#).is_err());
    }
}
