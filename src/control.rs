//! Translates OS signals into TaskMaster commands: `SIGINT` triggers shutdown,
//! `SIGUSR1` triggers a configuration reload.
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGUSR1};
use signal_hook::iterator::Signals;
use tracing::info;

use crate::task_master::{TaskMasterApi, TaskMasterHandle};

/// Spawns a dedicated thread that blocks on the process's signal mask and forwards
/// `SIGINT`/`SIGUSR1` to `task_master`. Returns once the signal iterator is created so
/// the caller can proceed to block on the TaskMaster's own join.
pub fn install(task_master: Arc<TaskMasterHandle>) -> Result<(), std::io::Error> {
    let mut signals = Signals::new([SIGINT, SIGUSR1])?;
    std::thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => {
                    info!("received SIGINT, shutting down");
                    task_master.shutdown();
                    break;
                }
                SIGUSR1 => {
                    info!("received SIGUSR1, reloading configuration");
                    task_master.reload();
                }
                _ => unreachable!("signal set is limited to SIGINT/SIGUSR1"),
            }
        }
    });
    Ok(())
}
