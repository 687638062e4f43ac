//! Common types for kuberun: errors, descriptor documents and Kubernetes utilities

#![deny(missing_docs)]

pub mod document;
pub mod error;
pub mod kube_utils;
pub mod retry;

pub use document::{Document, DocumentFormat};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carrying the run identifier on every object of a run
pub const TRACE_LABEL_KEY: &str = "run";

/// Standard Kubernetes label for the managing tool
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label for objects submitted by kuberun
pub const LABEL_MANAGED_BY_KUBERUN: &str = "kuberun";

/// Annotation recording the descriptor's original name before tagging
pub const BASE_NAME_ANNOTATION: &str = "kuberun.dev/base-name";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kuberun";
