//! Dispatch Engine (spec.md §4.G) — the core of this service.

mod engine;
#[cfg(test)]
mod tests;

pub use engine::{DispatchEngine, EngineConfig, TICK_INTERVAL};
