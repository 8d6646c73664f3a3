//! Admission decisions: identities, policies, and the fixed-window engine.

mod engine;
mod identity;
mod policy;

pub use engine::{AdmissionEngine, Decision};
pub use identity::{CounterKey, Identity, DEFAULT_NAMESPACE};
pub use policy::Policy;
