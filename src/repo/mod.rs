pub mod history;

pub use history::{CounterRow, HistoryLimits, HistoryStore, PriceRow, TelemetryRow};
