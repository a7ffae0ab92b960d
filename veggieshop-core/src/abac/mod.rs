//! Attribute-based access control

mod engine;
mod types;

pub use engine::{AbacConfig, AbacEngine, ActionRisk};
pub use types::{
    AbacDecision, AbacRequest, Action, Effect, Environment, MfaLevel, Obligation, ObligationKind,
    ResourceRef, Role, Sensitivity, Subject,
};
