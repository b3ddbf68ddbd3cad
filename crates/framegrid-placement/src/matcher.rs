//! Node capability matcher.
//!
//! A node is eligible for a requirement set when all of the following hold:
//! 1. derived status is `Online` (stale heartbeats count as offline)
//! 2. `current_load < max_load`
//! 3. enough CPU cores
//! 4. enough GPU memory
//! 5. enough RAM
//! 6. every required codec is supported
//! 7. every required specialization is present

use thiserror::Error;

use framegrid_state::{Node, NodeStatus, Specialization, TaskRequirements};

/// The first rule a node failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Ineligibility {
    #[error("node is {0:?}")]
    NotOnline(NodeStatus),

    #[error("node is saturated ({load}/{max})")]
    Saturated { load: u32, max: u32 },

    #[error("needs {need} cpu cores, node has {have}")]
    InsufficientCpu { have: u32, need: u32 },

    #[error("needs {need} GB gpu memory, node has {have}")]
    InsufficientGpuMemory { have: u32, need: u32 },

    #[error("needs {need} GB ram, node has {have}")]
    InsufficientRam { have: u32, need: u32 },

    #[error("codec `{0}` not supported")]
    MissingCodec(String),

    #[error("specialization {0:?} not available")]
    MissingSpecialization(Specialization),
}

/// Check a node against an optional requirement set.
///
/// Without requirements only liveness and saturation are checked.
pub fn check_eligibility(
    node: &Node,
    requirements: Option<&TaskRequirements>,
    now: u64,
    heartbeat_timeout_ms: u64,
) -> Result<(), Ineligibility> {
    let status = node.effective_status(now, heartbeat_timeout_ms);
    if status != NodeStatus::Online {
        return Err(Ineligibility::NotOnline(status));
    }
    if node.is_saturated() {
        return Err(Ineligibility::Saturated {
            load: node.current_load,
            max: node.max_load,
        });
    }

    let Some(req) = requirements else {
        return Ok(());
    };
    let caps = &node.capabilities;

    if caps.cpu_cores < req.min_cpu_cores {
        return Err(Ineligibility::InsufficientCpu {
            have: caps.cpu_cores,
            need: req.min_cpu_cores,
        });
    }
    if caps.gpu_memory_gb < req.min_gpu_memory_gb {
        return Err(Ineligibility::InsufficientGpuMemory {
            have: caps.gpu_memory_gb,
            need: req.min_gpu_memory_gb,
        });
    }
    if caps.ram_gb < req.min_ram_gb {
        return Err(Ineligibility::InsufficientRam {
            have: caps.ram_gb,
            need: req.min_ram_gb,
        });
    }
    if let Some(codec) = req
        .required_codecs
        .iter()
        .find(|c| !caps.supported_codecs.contains(c))
    {
        return Err(Ineligibility::MissingCodec(codec.clone()));
    }
    if let Some(spec) = req
        .specializations
        .iter()
        .find(|s| !caps.specializations.contains(s))
    {
        return Err(Ineligibility::MissingSpecialization(*spec));
    }

    Ok(())
}

/// Convenience wrapper over [`check_eligibility`].
pub fn is_eligible(
    node: &Node,
    requirements: Option<&TaskRequirements>,
    now: u64,
    heartbeat_timeout_ms: u64,
) -> bool {
    check_eligibility(node, requirements, now, heartbeat_timeout_ms).is_ok()
}
