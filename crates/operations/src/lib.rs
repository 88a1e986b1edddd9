//! Operation lifecycle coordination.
//!
//! An [`Operation`] is what a caller cares about: one logical sync job,
//! bound to a progress tracker and the transfers executed on its behalf.
//! The [`OperationCoordinator`] keeps the active-operation registry,
//! success and failure counters, and a derived health status for the
//! surrounding service layer.

mod coordinator;
mod operation;

pub use coordinator::{
    HealthStatus, OperationCoordinator, OperationCoordinatorConfig, OperationStatistics,
    OperationSummary,
};
pub use operation::Operation;

/// Errors produced by the coordination layer.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}
