//! Spawns and terminates the OS process backing one instance.
pub mod terminate;

use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use crate::config::TaskDescription;
use crate::error::SpawnError;

/// Spawns the shell command described by `desc` as a detached child process.
///
/// Mirrors the original's `create_subprocess`: environment is merged (not replaced) over
/// the supervisor's own, redirections are opened before spawn and any partially-opened
/// file is closed if a later one fails, `pwd`/`umask` are applied to the child only.
pub fn spawn(desc: &TaskDescription) -> Result<Child, SpawnError> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(&desc.command);

    if !desc.environment.is_empty() {
        command.envs(desc.environment.iter());
    }

    if let Some(pwd) = &desc.pwd {
        command.current_dir(pwd);
    }

    let stdout = open_redirection(desc.stdout.as_deref())?;
    let stderr = match open_redirection(desc.stderr.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            // the stdout handle (if any) is dropped here, closing it.
            return Err(err);
        }
    };

    command.stdout(stdout.map(Stdio::from).unwrap_or_else(Stdio::inherit));
    command.stderr(stderr.map(Stdio::from).unwrap_or_else(Stdio::inherit));

    if let Some(umask) = desc.umask {
        unsafe {
            command.pre_exec(move || {
                nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(umask as _));
                Ok(())
            });
        }
    }

    command.spawn().map_err(SpawnError::Spawn)
}

fn open_redirection(path: Option<&std::path::Path>) -> Result<Option<std::fs::File>, SpawnError> {
    let Some(path) = path else {
        return Ok(None);
    };
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map(Some)
        .map_err(|source| SpawnError::Redirection {
            path: path.display().to_string(),
            source,
        })
}
