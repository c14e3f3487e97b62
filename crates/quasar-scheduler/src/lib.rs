pub mod completion;
pub mod controller;
pub mod metrics;
pub mod reconcile;

pub use completion::CompletionLedger;
pub use controller::ReplicaController;
pub use reconcile::Reconciler;
