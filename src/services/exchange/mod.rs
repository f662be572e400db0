//! Trading Engine Module
//!
//! Multi-ticker continuous double auction with price-time priority.
//!
//! # Architecture
//!
//! ```text
//! Caller (bot, tests, future transport)
//!   ↓
//! OrderFlowOrchestrator
//!   ├→ Exchange (escrow, matching, settlement)
//!   │    ├→ Orderbook (per ticker)
//!   │    └→ AccountsLedger (cash/share balances)
//!   ├→ HistoryManager (in-memory history)
//!   └→ Database (per-request audit commit)
//! ```
//!
//! # Guarantees
//!
//! - **Per-Ticker Serialization**: every place/cancel on a ticker runs under
//!   that ticker's gate; different tickers run in parallel
//! - **Price-Time Priority**: best price first, FIFO within a price level
//! - **Escrow Settlement**: buys reserve cash and sells reserve shares up
//!   front, so no fill can overdraw a non-market-maker account
//! - **Trade Feed**: each placement that trades publishes one batch on a
//!   broadcast channel; subscribers can never block the engine

#![allow(dead_code)]

mod engine;
mod history;
mod orderbook;
mod orchestrator;
mod types;

pub use engine::{EngineStats, Exchange};
pub use history::{HistoryManager, HistoryStats, OrderHistoryRecord};
pub use orderbook::Orderbook;
pub use orchestrator::OrderFlowOrchestrator;
pub use types::*;
