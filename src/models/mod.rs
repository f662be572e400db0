mod order;
mod trade;
mod user;

pub use order::OrderRow;
pub use trade::TradeRow;
pub use user::{HoldingRow, UserRow};
