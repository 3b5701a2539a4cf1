//! # cloudburst
//!
//! A cloud-burst scaler for LLM inference across hybrid infrastructure: an
//! always-on home backend plus ephemeral cloud GPU workers that are started
//! on demand and shut down aggressively when idle.
//!
//! The control plane is one process (`cloudburst serve`) with two listeners:
//!
//! ```text
//! clients ──► Scaler/Router ──► backend (local or cloud worker)
//!               │    gate on readiness, cold-start, idle accounting
//!               ▼
//!         Lifecycle Engine ──► Provisioner (cloud instance API)
//!               ▲
//!               │ readiness probes
//! agents  ──► Fleet Manager (register / heartbeat / stream / commands)
//! ```
//!
//! Worker nodes run `cloudburst agent`, which registers with the fleet,
//! streams status and command results over a WebSocket, and optionally
//! publishes to a message broker.

pub mod agent;
pub mod cli;
pub mod config;
pub mod control;
pub mod fleet;
pub mod lifecycle;
pub mod proto;
pub mod scaler;
