//! Kube Sentinel: an autonomous log-classification and remediation
//! operator for Kubernetes. Polls a log backend, classifies errors
//! against a hot-reloadable rule set, tracks them as incidents, and
//! dispatches safety-gated remediation actions against the cluster.

pub mod broadcast;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod k8s;
pub mod logsource;
pub mod orchestrator;
pub mod poller;
pub mod remediation;
pub mod rules;
pub mod store;
pub mod web;
