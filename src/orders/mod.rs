//! Order data model
//!
//! - [`InOutOrder`]: one logical trade (enter leg, optional exit leg, typed info)
//! - [`ExOrder`]: a single exchange-side leg
//! - [`ExitTrigger`] / [`TriggerState`]: stop-loss and take-profit bookkeeping

pub mod ex_order;
pub mod inout;
pub mod trigger;

pub use ex_order::{ExOrder, OdStatus};
pub use inout::{InOutOrder, InOutStatus, TriggerKind};
pub use trigger::{ExitTrigger, OrderInfo, TriggerState};
