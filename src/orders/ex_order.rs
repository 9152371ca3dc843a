//! One-sided exchange order: the enter or exit leg of an [`InOutOrder`](super::InOutOrder)

use serde::{Deserialize, Serialize};

use crate::types::{nan_inf_to, OrderType, Side};

/// Sub-order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum OdStatus {
    #[default]
    Init = 0,
    PartOK = 1,
    Closed = 2,
}

impl OdStatus {
    pub fn from_i64(val: i64) -> OdStatus {
        match val {
            1 => OdStatus::PartOK,
            2 => OdStatus::Closed,
            _ => OdStatus::Init,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExOrder {
    pub id: i64,
    pub task_id: i64,
    pub inout_id: i64,
    pub symbol: String,
    pub enter: bool,
    pub order_type: OrderType,
    /// Exchange-side order id, empty until submitted
    pub order_id: String,
    pub side: Side,
    pub create_at: i64,
    pub price: f64,
    pub average: f64,
    pub amount: f64,
    pub filled: f64,
    pub status: OdStatus,
    pub fee: f64,
    pub fee_type: String,
    pub update_at: i64,
}

impl ExOrder {
    pub fn new(symbol: &str, enter: bool, side: Side, order_type: OrderType, create_at: i64) -> Self {
        Self {
            id: 0,
            task_id: 0,
            inout_id: 0,
            symbol: symbol.to_string(),
            enter,
            order_type,
            order_id: String::new(),
            side,
            create_at,
            price: 0.0,
            average: 0.0,
            amount: 0.0,
            filled: 0.0,
            status: OdStatus::Init,
            fee: 0.0,
            fee_type: String::new(),
            update_at: create_at,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.status == OdStatus::Closed
    }

    /// Split `rate` of this sub-order into a new one.
    ///
    /// With `fill` set, the filled amount moves to the part first. Fees are
    /// pro-rated by the amount actually moved.
    pub fn cut_part(&mut self, rate: f64, fill: bool) -> ExOrder {
        let mut part = ExOrder {
            id: 0,
            task_id: self.task_id,
            inout_id: 0,
            symbol: self.symbol.clone(),
            enter: self.enter,
            order_type: self.order_type,
            order_id: self.order_id.clone(),
            side: self.side,
            create_at: self.create_at,
            price: self.price,
            average: self.average,
            amount: self.amount * rate,
            filled: 0.0,
            status: OdStatus::Init,
            fee: 0.0,
            fee_type: self.fee_type.clone(),
            update_at: self.update_at,
        };
        let old_filled = self.filled;
        self.amount -= part.amount;
        if fill && self.filled > 0.0 {
            if self.filled <= part.amount {
                part.filled = self.filled;
                self.filled = 0.0;
            } else {
                part.filled = part.amount;
                self.filled -= part.filled;
            }
        } else if self.filled > self.amount {
            part.filled = self.filled - self.amount;
            self.filled = self.amount;
        }
        if old_filled > 0.0 && self.fee != 0.0 {
            part.fee = self.fee * part.filled / old_filled;
            self.fee -= part.fee;
        }
        part.status = if part.filled >= part.amount {
            OdStatus::Closed
        } else if part.filled > 0.0 {
            OdStatus::PartOK
        } else {
            OdStatus::Init
        };
        if self.filled >= self.amount {
            self.status = OdStatus::Closed;
        }
        part
    }

    pub fn nan_inf_to(&mut self, def: f64) {
        self.price = nan_inf_to(self.price, def);
        self.average = nan_inf_to(self.average, def);
        self.amount = nan_inf_to(self.amount, def);
        self.filled = nan_inf_to(self.filled, def);
        self.fee = nan_inf_to(self.fee, def);
    }
}
