//! Guest quiesce protocol: freeze before capture, thaw on every path out of
//! the in-progress phase. Freeze failure downgrades the capture to
//! crash-consistent instead of aborting it; thaw failure is reported as a
//! warning and never reverts a completed capture.

use std::sync::Arc;

use cluster::{GuestAgent, VmClient, VmRecord};
use data_model::{add_indication, Indication};
use tracing::{info, warn};

/// Result of a freeze attempt, expressed as the indications to record on
/// the snapshot.
pub struct FreezeOutcome {
    pub indications: Vec<Indication>,
    /// Set when the freeze was refused and the capture continues
    /// crash-consistent.
    pub warning: Option<String>,
}

/// Attempts to quiesce a running source. A stopped source yields no
/// indications (offline capture); a missing agent is a normal condition.
pub async fn freeze_source(vm: &VmRecord, agent: &Arc<dyn GuestAgent>) -> FreezeOutcome {
    let mut indications = Vec::new();
    if !vm.is_running() {
        return FreezeOutcome {
            indications,
            warning: None,
        };
    }
    add_indication(&mut indications, Indication::Online);
    if !vm.guest_agent_connected {
        add_indication(&mut indications, Indication::NoGuestAgent);
        return FreezeOutcome {
            indications,
            warning: None,
        };
    }
    match agent.freeze(&vm.name).await {
        Ok(()) => {
            info!(vm = vm.name, "guest filesystem frozen");
            add_indication(&mut indications, Indication::GuestAgent);
            FreezeOutcome {
                indications,
                warning: None,
            }
        }
        Err(err) => {
            warn!(vm = vm.name, "freeze failed, capture is crash-consistent: {:?}", err);
            add_indication(&mut indications, Indication::QuiesceFailed);
            FreezeOutcome {
                indications,
                warning: Some(format!("guest freeze failed: {}", err)),
            }
        }
    }
}

/// Undoes a quiesce. Called on every exit from the in-progress phase,
/// including the deadline and deletion paths; safe when the source was
/// never frozen, has stopped, or is already gone. Returns the warning to
/// record when the thaw itself fails.
pub async fn release(
    vm_name: &str,
    vm_client: &Arc<dyn VmClient>,
    agent: &Arc<dyn GuestAgent>,
) -> Option<String> {
    let vm = match vm_client.get(vm_name).await {
        Ok(Some(vm)) => vm,
        Ok(None) => return None,
        Err(err) => return Some(format!("failed to look up source for thaw: {}", err)),
    };
    if !vm.is_running() || !vm.guest_agent_connected {
        return None;
    }
    match agent.thaw(vm_name).await {
        Ok(()) => {
            info!(vm = vm_name, "guest filesystem thawed");
            None
        }
        Err(err) => {
            warn!(vm = vm_name, "thaw failed: {:?}", err);
            Some(format!("guest thaw failed: {}", err))
        }
    }
}
