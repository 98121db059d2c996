//! Decision-and-lifecycle core
//!
//! The pipeline stages: ingestion, decision, execution (single-leg and
//! multi-leg arbitrage), position lifecycle tracking, capital allocation and
//! periodic evaluation.

mod allocator;
mod arbitrage;
mod decision;
mod evaluation;
mod execution;
mod exits;
mod fees;
mod ingestion;
mod tracker;

pub use allocator::{
    portfolio_metrics, CapitalAllocator, CapitalState, Exposure, PortfolioMetrics, Sizing,
};
pub use arbitrage::{ArbLeg, ArbOpportunity, ArbitrageScanner, GroupExecution, GroupOutcome};
pub use decision::DecisionEngine;
pub use evaluation::{PerformanceEvaluator, PerformanceSnapshot, StrategyPerformance};
pub use execution::OrderExecutor;
pub use exits::ExitPlanner;
pub use fees::FeeSchedule;
pub use ingestion::IngestionStage;
pub use tracker::{evaluate_exit, PositionTracker, TrackerCycleStats};
