//! Error types for flatiron.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias using [`EnergyError`].
pub type Result<T> = std::result::Result<T, EnergyError>;

/// Errors that can occur while building or minimizing an objective.
#[derive(Error, Debug)]
pub enum EnergyError {
    /// The mesh has no faces.
    #[error("mesh has no faces")]
    EmptyMesh,

    /// A face references an invalid vertex index.
    #[error("face {face} references invalid vertex index {vertex}")]
    InvalidVertexIndex {
        /// The face index.
        face: usize,
        /// The invalid vertex index.
        vertex: usize,
    },

    /// A face is degenerate (duplicate vertices or zero reference area).
    #[error("face {face} is degenerate ({reason})")]
    DegenerateFace {
        /// The face index.
        face: usize,
        /// Reason the face is unusable.
        reason: &'static str,
    },

    /// The mesh has no boundary (closed surface).
    #[error("mesh has no boundary; a disk topology is required")]
    NoBoundary,

    /// A required shape member was not set before `init()`, or an
    /// operation was attempted in the wrong lifecycle state.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid parameter value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },

    /// Numeric factorization of the system matrix failed.
    ///
    /// This is the recoverable per-iteration failure: callers react by
    /// raising the diagonal shift and retrying, never by aborting.
    #[error("sparse factorization failed: {0}")]
    Factorization(String),

    /// Inserting a dependency produced a cycle in the recomputation graph.
    #[error("dependency cycle through node {node}")]
    DependencyCycle {
        /// Index of a node on the cycle.
        node: usize,
    },

    /// The background worker thread panicked.
    #[error("solver worker thread panicked")]
    WorkerPanicked,
}

impl EnergyError {
    /// Create a configuration error.
    pub fn config<T: std::fmt::Display>(what: T) -> Self {
        EnergyError::Configuration(what.to_string())
    }

    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: &'static str,
        value: T,
        reason: &'static str,
    ) -> Self {
        EnergyError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }
}

impl From<sprs::errors::LinalgError> for EnergyError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        EnergyError::Factorization(e.to_string())
    }
}
