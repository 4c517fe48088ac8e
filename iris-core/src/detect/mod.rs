//! Event normalization and rule evaluation.
//!
//! The engine is a cooperative actor: events are handled one at a time in
//! append order, so rule fires are deterministic for a given input
//! sequence. Rule predicates never abort evaluation; anything a predicate
//! cannot resolve counts as "does not hold".

pub mod builtin;
pub mod engine;
pub mod heuristics;
pub mod normalize;
pub mod rules;

pub use engine::DetectionEngine;
pub use normalize::{EventNormalizer, SigningInfo, SigningOracle};
pub use rules::{
    CorrelationKey, CorrelationRule, FieldKey, Predicate, Rule, RuleError,
    RuleSet, Stage,
};
