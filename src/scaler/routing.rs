//! Backend selection
//!
//! The routing mode constrains which worker (and which of its interfaces) a
//! request may go to. Selection never mutates state; the proxy acts on the
//! returned [`Selection`].

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleEngine;

/// Operator-selected routing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Prefer local when ready, then any ready on-demand worker (mesh
    /// interface before public), else cold-start one
    #[default]
    Auto,
    /// Only the always-on local worker; never cold-starts
    Local,
    /// The cloud worker via its public interface
    Remote,
    /// Over the overlay network: the mesh-only worker when configured,
    /// else the cloud worker's mesh interface
    Mesh,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Mesh => "mesh",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            "mesh" => Ok(Self::Mesh),
            other => Err(format!("unknown routing mode '{other}'")),
        }
    }
}

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub worker: String,
    pub url: String,
    pub mode: RoutingMode,
}

/// Outcome of backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A running worker with a fresh readiness probe
    Ready(RouteDecision),
    /// No ready backend; cold-starting this worker may produce one
    ColdStart { worker: String },
    /// The routing mode forbids a cold start and nothing is ready
    Unavailable { reason: String },
}

/// Pick a backend for the current mode. The target of a `Ready` decision is
/// `running` with a fresh probe at the moment of selection.
pub fn select_backend(engine: &LifecycleEngine, mode: RoutingMode) -> Selection {
    match mode {
        RoutingMode::Local => match engine.local_name() {
            Some(local) if engine.is_ready(local) => {
                let url = pinned_url(engine, local, mode);
                match url {
                    Some(url) => Selection::Ready(RouteDecision {
                        worker: local.to_string(),
                        url,
                        mode,
                    }),
                    None => Selection::Unavailable {
                        reason: "local worker has no URL".to_string(),
                    },
                }
            }
            Some(_) => Selection::Unavailable {
                reason: "routing mode is local and the local worker is not ready".to_string(),
            },
            None => Selection::Unavailable {
                reason: "no local worker configured".to_string(),
            },
        },

        RoutingMode::Remote => match engine.cloud_name() {
            Some(cloud) => pinned_selection(engine, cloud, mode),
            None => Selection::Unavailable {
                reason: "no cloud worker configured".to_string(),
            },
        },

        // A dedicated mesh-only worker wins; otherwise the cloud worker's
        // overlay interface.
        RoutingMode::Mesh => match engine.mesh_name().or_else(|| engine.cloud_name()) {
            Some(target) => pinned_selection(engine, target, mode),
            None => Selection::Unavailable {
                reason: "no worker with a mesh interface configured".to_string(),
            },
        },

        RoutingMode::Auto => {
            if let Some(local) = engine.local_name() {
                if engine.is_ready(local) {
                    if let Some(url) = pinned_url(engine, local, RoutingMode::Local) {
                        return Selection::Ready(RouteDecision {
                            worker: local.to_string(),
                            url,
                            mode,
                        });
                    }
                }
            }
            // On-demand workers next, cloud before mesh-only. The probe
            // records which interface answered, mesh tried first; route
            // through that one.
            for name in engine.on_demand_names() {
                if engine.is_ready(name) {
                    if let Some(url) = engine.handle(name).ok().and_then(|h| h.ready_url()) {
                        return Selection::Ready(RouteDecision {
                            worker: name.to_string(),
                            url,
                            mode,
                        });
                    }
                }
            }
            match engine.on_demand_names().first() {
                Some(name) => Selection::ColdStart {
                    worker: name.to_string(),
                },
                None => Selection::Unavailable {
                    reason: "no worker is ready and none can be cold-started".to_string(),
                },
            }
        }
    }
}

fn pinned_selection(engine: &LifecycleEngine, name: &str, mode: RoutingMode) -> Selection {
    let Some(url) = pinned_url(engine, name, mode) else {
        return Selection::Unavailable {
            reason: format!("worker '{name}' has no {mode} interface"),
        };
    };
    if engine.is_ready(name) {
        Selection::Ready(RouteDecision {
            worker: name.to_string(),
            url,
            mode,
        })
    } else {
        Selection::ColdStart {
            worker: name.to_string(),
        }
    }
}

fn pinned_url(engine: &LifecycleEngine, name: &str, mode: RoutingMode) -> Option<String> {
    engine
        .handle(name)
        .ok()
        .and_then(|h| h.worker.url_for_mode(mode).map(str::to_string))
}
