//! kuberun - submit Kubernetes workloads for test runs and supervise them to
//! completion
//!
//! The lifecycle logic lives in `kuberun-job`; this crate wires it to a
//! command line.

pub mod cli;
pub mod telemetry;
