//! Detection Engines
//!
//! - `risk_scorer.rs` - per-process additive risk with saturation and levels
//! - `rule_engine.rs` - declarative hash/path/network/registry rules
//! - `correlator.rs` - time-windowed behavioral pattern detection

pub mod correlator;
pub mod risk_scorer;
pub mod rule_engine;

pub use correlator::BehaviorCorrelator;
pub use risk_scorer::{RiskLevel, RiskScore, RiskScorer};
pub use rule_engine::{wildcard_match, Rule, RuleAction, RuleEngine, RuleKind};
