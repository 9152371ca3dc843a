//! Stop-loss / take-profit triggers and the typed order info blob

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Exit condition attached to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExitTrigger {
    /// Trigger price
    pub price: f64,
    /// Limit price used once triggered; 0 means market
    #[serde(default, skip_serializing_if = "is_zero")]
    pub limit: f64,
    /// Fraction of holdings to exit; 0 or 1 means all
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rate: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl ExitTrigger {
    pub fn new(price: f64) -> Self {
        Self {
            price,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: f64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Price the exit would actually be placed at
    pub fn exit_price(&self) -> f64 {
        if self.limit > 0.0 {
            self.limit
        } else {
            self.price
        }
    }

    pub fn is_partial(&self) -> bool {
        self.rate > 0.0 && self.rate <= 0.99
    }
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Runtime state of an [`ExitTrigger`] on one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerState {
    #[serde(flatten)]
    pub trigger: ExitTrigger,
    /// `|init_price - (limit or price)|`
    #[serde(default)]
    pub range: f64,
    #[serde(default)]
    pub hit: bool,
    /// Exchange id of the standing trigger order, live only
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub order_id: String,
    /// Values last sent to the exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<ExitTrigger>,
}

impl TriggerState {
    pub fn is_active(&self) -> bool {
        self.trigger.price > 0.0
    }

    pub fn save_old(&mut self) {
        match self.old.as_mut() {
            None => self.old = Some(self.trigger.clone()),
            Some(old) => {
                old.price = self.trigger.price;
                old.limit = self.trigger.limit;
                old.rate = self.trigger.rate;
                if !self.trigger.tag.is_empty() {
                    old.tag = self.trigger.tag.clone();
                }
            }
        }
    }

    /// Whether the trigger differs from what was last sent to the exchange
    pub fn changed_since_old(&self) -> bool {
        match &self.old {
            None => self.is_active(),
            Some(old) => {
                old.price != self.trigger.price
                    || old.limit != self.trigger.limit
                    || old.rate != self.trigger.rate
            }
        }
    }
}

/// Typed side channel stored as JSON in the main order row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OrderInfo {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub legal_cost: f64,
    /// Deadline for a pending limit entry
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub stop_after: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<TriggerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TriggerState>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_msg: String,
    /// Free-form values written by strategies
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

impl OrderInfo {
    pub fn is_empty(&self) -> bool {
        *self == OrderInfo::default()
    }

    pub fn get_f64(&self, key: &str) -> f64 {
        self.extra.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn get_str(&self, key: &str) -> &str {
        self.extra.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_state_json_is_flat() {
        let st = TriggerState {
            trigger: ExitTrigger::new(95.0).with_limit(94.0),
            range: 6.0,
            ..Default::default()
        };
        let text = serde_json::to_string(&st).unwrap();
        assert!(text.contains("\"price\":95.0"));
        assert!(text.contains("\"limit\":94.0"));
        let back: TriggerState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn test_save_old_tracks_changes() {
        let mut st = TriggerState {
            trigger: ExitTrigger::new(95.0),
            ..Default::default()
        };
        assert!(st.changed_since_old());
        st.save_old();
        assert!(!st.changed_since_old());
        st.trigger.price = 96.0;
        assert!(st.changed_since_old());
    }

    #[test]
    fn test_info_extra_round_trip() {
        let mut info = OrderInfo {
            legal_cost: 10.0,
            ..Default::default()
        };
        info.extra.insert("note".into(), serde_json::json!("x"));
        let text = serde_json::to_string(&info).unwrap();
        let back: OrderInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.get_str("note"), "x");
    }
}
