use pyo3::prelude::*;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OpenHcsError>;

/// Error taxonomy for the OpenHCS engine (spec §7). Subkinds carry enough
/// context (well, step, phase, backend/path) to report without downstream
/// string matching.
#[derive(Error, Debug)]
pub enum OpenHcsError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("compilation error [{phase}] well={well_id} step={step_name}: {message}")]
    Compilation {
        well_id: String,
        step_name: String,
        phase: CompilationPhase,
        message: String,
    },

    #[error("IO error [{operation}] backend={backend} path={path}: {message}")]
    Io {
        backend: String,
        path: String,
        operation: String,
        message: String,
    },

    #[error("execution error well={well_id} step={step_name}: {message}")]
    Execution {
        well_id: String,
        step_name: String,
        message: String,
    },

    #[error("resource error: {message}")]
    Resource { message: String },

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    StdIoError(#[from] std::io::Error),
}

/// Which of the 5 compiler phases raised a `Compilation` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompilationPhase {
    PathPlanning,
    ArchiveDeclaration,
    MaterializationPlanning,
    MemoryContractValidation,
    GpuAssignment,
}

impl std::fmt::Display for CompilationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompilationPhase::PathPlanning => "path_planning",
            CompilationPhase::ArchiveDeclaration => "archive_declaration",
            CompilationPhase::MaterializationPlanning => "materialization_planning",
            CompilationPhase::MemoryContractValidation => "memory_contract_validation",
            CompilationPhase::GpuAssignment => "gpu_assignment",
        };
        write!(f, "{name}")
    }
}

impl From<OpenHcsError> for PyErr {
    fn from(err: OpenHcsError) -> PyErr {
        match err {
            OpenHcsError::Configuration { message } => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("Configuration error: {message}"))
            }
            OpenHcsError::Compilation { well_id, step_name, phase, message } => {
                PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!(
                    "Compilation error [{phase}] well={well_id} step={step_name}: {message}"
                ))
            }
            OpenHcsError::Io { backend, path, operation, message } => {
                PyErr::new::<pyo3::exceptions::PyIOError, _>(format!(
                    "IO error [{operation}] backend={backend} path={path}: {message}"
                ))
            }
            OpenHcsError::Execution { well_id, step_name, message } => {
                PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!(
                    "Execution error well={well_id} step={step_name}: {message}"
                ))
            }
            OpenHcsError::Resource { message } => {
                PyErr::new::<pyo3::exceptions::PyMemoryError, _>(format!("Resource error: {message}"))
            }
            OpenHcsError::SerializationError(e) => {
                PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("Serialization error: {e}"))
            }
            OpenHcsError::StdIoError(e) => {
                PyErr::new::<pyo3::exceptions::PyIOError, _>(format!("IO error: {e}"))
            }
        }
    }
}

// Convenience macros for creating errors with full context, mirroring the
// per-variant macro family the teacher exposes in error.rs.

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::OpenHcsError::Configuration { message: $msg.to_string() }
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::OpenHcsError::Configuration { message: format!($fmt, $($arg)*) }
    };
}

#[macro_export]
macro_rules! compilation_error {
    ($well:expr, $step:expr, $phase:expr, $msg:expr) => {
        $crate::error::OpenHcsError::Compilation {
            well_id: $well.to_string(),
            step_name: $step.to_string(),
            phase: $phase,
            message: $msg.to_string(),
        }
    };
    ($well:expr, $step:expr, $phase:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::OpenHcsError::Compilation {
            well_id: $well.to_string(),
            step_name: $step.to_string(),
            phase: $phase,
            message: format!($fmt, $($arg)*),
        }
    };
}

#[macro_export]
macro_rules! io_error {
    ($backend:expr, $path:expr, $op:expr, $msg:expr) => {
        $crate::error::OpenHcsError::Io {
            backend: $backend.to_string(),
            path: $path.to_string(),
            operation: $op.to_string(),
            message: $msg.to_string(),
        }
    };
}

#[macro_export]
macro_rules! execution_error {
    ($well:expr, $step:expr, $msg:expr) => {
        $crate::error::OpenHcsError::Execution {
            well_id: $well.to_string(),
            step_name: $step.to_string(),
            message: $msg.to_string(),
        }
    };
    ($well:expr, $step:expr, $fmt:expr, $($arg:tt)*) => {
        $crate::error::OpenHcsError::Execution {
            well_id: $well.to_string(),
            step_name: $step.to_string(),
            message: format!($fmt, $($arg)*),
        }
    };
}

#[macro_export]
macro_rules! resource_error {
    ($msg:expr) => {
        $crate::error::OpenHcsError::Resource { message: $msg.to_string() }
    };
}
