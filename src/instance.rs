//! Drives one OS subprocess through its lifecycle state machine.
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{after, bounded, select, Receiver};
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::config::TaskDescription;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::process;
use crate::process::terminate;

/// Commands accepted on an instance's inbox. `Start`/`Stop` correspond to the spec's
/// should-start/should-stop signals; `Shutdown` additionally marks the instance as
/// finished once it next reaches a stage holding no process.
#[derive(Debug, Clone)]
pub enum InstanceCommand {
    Start,
    Stop,
    Shutdown,
    UpdateDescription(Box<TaskDescription>),
}

/// How a process exited, distinguishing a plain exit code from death-by-signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

fn exit_outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    match status.signal() {
        Some(sig) => ExitOutcome::Signal(sig),
        None => ExitOutcome::Code(status.code().unwrap_or(-1)),
    }
}

/// Whether a `Running` instance that just exited should settle into the terminal
/// `Exited` stage rather than being relaunched, per the task's restart policy.
fn exits_cleanly(
    restart: crate::config::RestartPolicy,
    outcome: ExitOutcome,
    success_exit_codes: &[i32],
) -> bool {
    match (restart, outcome) {
        (crate::config::RestartPolicy::Never, _) => true,
        (crate::config::RestartPolicy::OnFailure, ExitOutcome::Code(c)) => {
            success_exit_codes.contains(&c)
        }
        _ => false,
    }
}

/// A snapshot of an instance's current stage, cheap to clone for status queries.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    NotStarted,
    Starting { pid: u32, attempt: u32 },
    Running { pid: u32 },
    Exiting { pid: u32 },
    Exited { outcome: ExitOutcome },
    OutOfStartAttempts,
    Fatal { message: String },
}

impl Stage {
    /// Whether this stage currently owns a live process handle.
    pub fn owns_process(&self) -> bool {
        matches!(
            self,
            Stage::Starting { .. } | Stage::Running { .. } | Stage::Exiting { .. }
        )
    }

    /// The rendering used by `status` queries and log lines.
    pub fn render(&self) -> String {
        match self {
            Stage::NotStarted => "not started".to_string(),
            Stage::Starting { attempt, .. } => format!("starting attempt n˚{attempt}"),
            Stage::Running { pid } => format!("running (pid: {pid})"),
            Stage::Exiting { pid } => format!("exiting (pid: {pid})"),
            Stage::Exited { outcome } => match outcome {
                ExitOutcome::Code(code) => format!("exited with {code}"),
                ExitOutcome::Signal(sig) => format!("exited by {}", signal_display(*sig)),
            },
            Stage::OutOfStartAttempts => "out of start attempts".to_string(),
            Stage::Fatal { message } => format!("fatal ({message})"),
        }
    }
}

fn signal_display(sig: i32) -> String {
    Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {sig}"))
}

/// A live process this loop is currently driving, kept separate from the publicly
/// shared [`Stage`] so the heavier bookkeeping (timers, exit channel) never leaks out.
struct Owned {
    pid: u32,
    exit_rx: Receiver<ExitOutcome>,
}

fn spawn_and_watch(desc: &TaskDescription) -> Result<Owned, crate::error::SpawnError> {
    let child = process::spawn(desc)?;
    let pid = child.id();
    let (tx, rx) = bounded(1);
    std::thread::spawn(move || {
        let mut child = child;
        let outcome = match child.wait() {
            Ok(status) => exit_outcome_from_status(status),
            Err(_) => ExitOutcome::Code(-1),
        };
        let _ = tx.send(outcome);
    });
    Ok(Owned { pid, exit_rx: rx })
}

/// A handle to a running instance, held by its owning [`crate::task::Task`].
pub struct InstanceHandle {
    publisher: EventPublisher<InstanceCommand>,
    stage: Arc<Mutex<Stage>>,
    join: Option<JoinHandle<()>>,
}

impl InstanceHandle {
    pub fn start(&self) {
        let _ = self.publisher.publish(InstanceCommand::Start);
    }

    pub fn stop(&self) {
        let _ = self.publisher.publish(InstanceCommand::Stop);
    }

    pub fn shutdown(&self) {
        let _ = self.publisher.publish(InstanceCommand::Shutdown);
    }

    pub fn update_description(&self, desc: TaskDescription) {
        let _ = self
            .publisher
            .publish(InstanceCommand::UpdateDescription(Box::new(desc)));
    }

    pub fn status(&self) -> String {
        self.stage.lock().unwrap().render()
    }

    /// Blocks until the instance's run loop has returned (i.e. it finished shutting down).
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawns the dedicated thread that drives one instance's lifecycle and returns a
/// handle to it. `label` is used as the `tracing` span name for every log line this
/// instance produces.
pub fn spawn_instance(desc: TaskDescription, label: String) -> InstanceHandle {
    let (publisher, consumer) = pub_sub::<InstanceCommand>();
    let stage = Arc::new(Mutex::new(Stage::NotStarted));
    let shared_stage = stage.clone();
    let join = std::thread::Builder::new()
        .name(label.clone())
        .spawn(move || run(desc, consumer, shared_stage, label))
        .expect("failed to spawn instance thread");

    InstanceHandle {
        publisher,
        stage,
        join: Some(join),
    }
}

fn publish(shared: &Arc<Mutex<Stage>>, stage: &Stage, label: &str) {
    info!(instance = label, stage = %stage.render(), "stage transition");
    *shared.lock().unwrap() = stage.clone();
}

/// Blocks until a `Start` or `Shutdown` command arrives, discarding no-op `Stop`s and
/// applying `UpdateDescription`s in place. Used by `NotStarted` and the three terminal
/// stages, which all share the same "wait to be told to start again" behavior.
enum Woken {
    Start,
    Shutdown,
}

fn wait_for_wake(cmd_rx: &Receiver<InstanceCommand>, desc: &mut TaskDescription, label: &str) -> Woken {
    loop {
        match cmd_rx.recv() {
            Ok(InstanceCommand::Start) => return Woken::Start,
            Ok(InstanceCommand::Shutdown) => return Woken::Shutdown,
            Ok(InstanceCommand::Stop) => {
                warn!(instance = label, "stop on a non-running instance is a no-op");
            }
            Ok(InstanceCommand::UpdateDescription(new_desc)) => *desc = *new_desc,
            Err(_) => return Woken::Shutdown,
        }
    }
}

/// Spawns the process for `attempt`, racing it against an already-pending stop.
/// Mirrors §4.1 rule 2: if `start_attempts` is exhausted the instance is retired, if a
/// stop was already requested the launch is abandoned, otherwise the spawn result
/// (success or failure) decides between `Starting` and `Fatal`.
fn launch_attempt(
    attempt: u32,
    desc: &TaskDescription,
    should_stop: &mut bool,
    label: &str,
) -> (Stage, Option<Owned>) {
    if attempt > desc.start_attempts {
        return (Stage::OutOfStartAttempts, None);
    }
    if *should_stop {
        return (Stage::NotStarted, None);
    }
    match spawn_and_watch(desc) {
        Ok(owned) => {
            let stage = Stage::Starting {
                pid: owned.pid,
                attempt,
            };
            (stage, Some(owned))
        }
        Err(err) => {
            warn!(instance = label, error = %err, "failed to launch");
            (
                Stage::Fatal {
                    message: err.to_string(),
                },
                None,
            )
        }
    }
}

/// Calls `launch_attempt` and, if it lands in `Starting`, stamps `starting_since` with
/// the entry time so the next `Starting` wait can compute its remaining budget rather
/// than granting a fresh `start_timeout` on every loop-back.
fn begin_launch(
    attempt: u32,
    desc: &TaskDescription,
    should_stop: &mut bool,
    label: &str,
    starting_since: &mut Option<Instant>,
) -> (Stage, Option<Owned>) {
    let (stage, owned) = launch_attempt(attempt, desc, should_stop, label);
    if matches!(stage, Stage::Starting { .. }) {
        *starting_since = Some(Instant::now());
    }
    (stage, owned)
}

fn run(mut desc: TaskDescription, cmd_rx: EventConsumer<InstanceCommand>, shared: Arc<Mutex<Stage>>, label: String) {
    let cmd_rx: Receiver<InstanceCommand> = cmd_rx.as_ref().clone();
    let mut should_stop = false;
    let mut shutting_down = false;
    let mut stage = Stage::NotStarted;
    let mut owned: Option<Owned> = None;
    let mut starting_since: Option<Instant> = None;
    publish(&shared, &stage, &label);

    loop {
        if shutting_down && !stage.owns_process() {
            break;
        }

        stage = match stage {
            Stage::NotStarted => {
                should_stop = false;
                if desc.start_on_launch {
                    let (next, next_owned) = begin_launch(1, &desc, &mut should_stop, &label, &mut starting_since);
                    owned = next_owned;
                    next
                } else {
                    match wait_for_wake(&cmd_rx, &mut desc, &label) {
                        Woken::Start => {
                            let (next, next_owned) = begin_launch(1, &desc, &mut should_stop, &label, &mut starting_since);
                            owned = next_owned;
                            next
                        }
                        Woken::Shutdown => {
                            shutting_down = true;
                            Stage::NotStarted
                        }
                    }
                }
            }

            Stage::Starting { pid, attempt } => {
                let exit_rx = owned.as_ref().expect("Starting stage without owned process").exit_rx.clone();
                let since = starting_since.expect("Starting stage without a recorded entry time");
                let remaining = desc.start_timeout().saturating_sub(since.elapsed());
                select! {
                    recv(&exit_rx) -> outcome => {
                        let outcome = outcome.unwrap_or(ExitOutcome::Code(-1));
                        owned = None;
                        if should_stop {
                            Stage::Exited { outcome }
                        } else {
                            let (next, next_owned) = begin_launch(attempt + 1, &desc, &mut should_stop, &label, &mut starting_since);
                            owned = next_owned;
                            next
                        }
                    }
                    recv(&cmd_rx) -> cmd => {
                        match cmd {
                            Ok(InstanceCommand::Stop) | Ok(InstanceCommand::Shutdown) => {
                                if matches!(cmd, Ok(InstanceCommand::Shutdown)) {
                                    shutting_down = true;
                                }
                                should_stop = true;
                                let _ = terminate::signal(pid, desc.shutdown_signal.0);
                                Stage::Exiting { pid }
                            }
                            Ok(InstanceCommand::Start) => Stage::Starting { pid, attempt },
                            Ok(InstanceCommand::UpdateDescription(new_desc)) => {
                                desc = *new_desc;
                                Stage::Starting { pid, attempt }
                            }
                            Err(_) => {
                                // inbox disconnected: treat as an implicit shutdown request.
                                shutting_down = true;
                                should_stop = true;
                                let _ = terminate::signal(pid, desc.shutdown_signal.0);
                                Stage::Exiting { pid }
                            }
                        }
                    }
                    recv(&after(remaining)) -> _ => Stage::Running { pid },
                }
            }

            Stage::Running { pid } => {
                let exit_rx = owned.as_ref().expect("Running stage without owned process").exit_rx.clone();
                select! {
                    recv(&exit_rx) -> outcome => {
                        let outcome = outcome.unwrap_or(ExitOutcome::Code(-1));
                        owned = None;
                        if exits_cleanly(desc.restart, outcome, &desc.success_exit_codes) {
                            Stage::Exited { outcome }
                        } else {
                            let (next, next_owned) = begin_launch(1, &desc, &mut should_stop, &label, &mut starting_since);
                            owned = next_owned;
                            next
                        }
                    }
                    recv(&cmd_rx) -> cmd => {
                        match cmd {
                            Ok(InstanceCommand::Stop) | Ok(InstanceCommand::Shutdown) => {
                                if matches!(cmd, Ok(InstanceCommand::Shutdown)) {
                                    shutting_down = true;
                                }
                                should_stop = true;
                                let _ = terminate::signal(pid, desc.shutdown_signal.0);
                                Stage::Exiting { pid }
                            }
                            Ok(InstanceCommand::Start) => {
                                warn!(instance = label, "start on a running instance is a no-op");
                                Stage::Running { pid }
                            }
                            Ok(InstanceCommand::UpdateDescription(new_desc)) => {
                                desc = *new_desc;
                                Stage::Running { pid }
                            }
                            Err(_) => {
                                shutting_down = true;
                                should_stop = true;
                                let _ = terminate::signal(pid, desc.shutdown_signal.0);
                                Stage::Exiting { pid }
                            }
                        }
                    }
                }
            }

            Stage::Exiting { pid } => {
                let exit_rx = owned.as_ref().expect("Exiting stage without owned process").exit_rx.clone();
                let remaining = desc.shutdown_timeout();
                select! {
                    recv(&exit_rx) -> outcome => {
                        owned = None;
                        Stage::Exited { outcome: outcome.unwrap_or(ExitOutcome::Code(-1)) }
                    }
                    recv(&after(remaining)) -> _ => {
                        let _ = terminate::kill(pid);
                        let outcome = exit_rx.recv().unwrap_or(ExitOutcome::Code(-1));
                        owned = None;
                        Stage::Exited { outcome }
                    }
                }
            }

            terminal @ (Stage::Exited { .. } | Stage::OutOfStartAttempts | Stage::Fatal { .. }) => {
                match wait_for_wake(&cmd_rx, &mut desc, &label) {
                    Woken::Start => {
                        should_stop = false;
                        let (next, next_owned) = begin_launch(1, &desc, &mut should_stop, &label, &mut starting_since);
                        owned = next_owned;
                        next
                    }
                    Woken::Shutdown => {
                        shutting_down = true;
                        terminal
                    }
                }
            }
        };
        publish(&shared, &stage, &label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RestartPolicy, SignalName};
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::thread::sleep;
    use tracing_test::{logs_assert, traced_test};

    #[rstest]
    #[case(RestartPolicy::Never, ExitOutcome::Code(0), true)]
    #[case(RestartPolicy::Never, ExitOutcome::Code(1), true)]
    #[case(RestartPolicy::Never, ExitOutcome::Signal(9), true)]
    #[case(RestartPolicy::OnFailure, ExitOutcome::Code(0), true)]
    #[case(RestartPolicy::OnFailure, ExitOutcome::Code(1), false)]
    #[case(RestartPolicy::OnFailure, ExitOutcome::Signal(9), false)]
    #[case(RestartPolicy::Always, ExitOutcome::Code(0), false)]
    #[case(RestartPolicy::Always, ExitOutcome::Code(1), false)]
    fn exits_cleanly_matches_restart_policy(
        #[case] restart: RestartPolicy,
        #[case] outcome: ExitOutcome,
        #[case] expected: bool,
    ) {
        assert_eq!(exits_cleanly(restart, outcome, &[0]), expected);
    }

    fn desc(command: &str) -> TaskDescription {
        TaskDescription {
            command: command.to_string(),
            replicas: 1,
            start_on_launch: true,
            restart: RestartPolicy::OnFailure,
            success_exit_codes: vec![0],
            start_timeout_secs: 1,
            start_attempts: 3,
            shutdown_signal: SignalName::default(),
            shutdown_timeout_secs: 1,
            stdout: None,
            stderr: None,
            environment: BTreeMap::new(),
            pwd: None,
            umask: None,
        }
    }

    #[traced_test]
    #[test]
    fn happy_start_logs_stage_transitions() {
        let mut d = desc("true");
        d.start_timeout_secs = 0;
        d.restart = RestartPolicy::Never;
        let handle = spawn_instance(d, "logged".to_string());
        sleep(Duration::from_millis(500));
        assert_eq!(handle.status(), "exited with 0");
        logs_assert(|lines| {
            if lines.iter().any(|line| line.contains("stage transition") && line.contains("logged")) {
                Ok(())
            } else {
                Err("expected a logged stage transition for instance \"logged\"".to_string())
            }
        });
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn happy_start_reaches_running() {
        let mut d = desc("sleep 60");
        d.start_timeout_secs = 1;
        let handle = spawn_instance(d, "sleeper".to_string());
        sleep(Duration::from_millis(1100));
        assert!(handle.status().starts_with("running (pid:"));
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn start_timeout_failure_exhausts_attempts() {
        let mut d = desc("true");
        d.start_timeout_secs = 1;
        d.start_attempts = 3;
        d.restart = RestartPolicy::Never;
        let handle = spawn_instance(d, "flapper".to_string());
        sleep(Duration::from_secs(4));
        assert_eq!(handle.status(), "out of start attempts");
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn success_exit_is_terminal() {
        let mut d = desc("true");
        d.start_timeout_secs = 0;
        d.restart = RestartPolicy::OnFailure;
        d.success_exit_codes = vec![0];
        let handle = spawn_instance(d, "ok".to_string());
        sleep(Duration::from_millis(500));
        assert_eq!(handle.status(), "exited with 0");
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn failure_triggers_restart_until_out_of_attempts() {
        let mut d = desc("false");
        d.start_timeout_secs = 0;
        d.restart = RestartPolicy::OnFailure;
        d.success_exit_codes = vec![0];
        d.start_attempts = 2;
        let handle = spawn_instance(d, "failer".to_string());
        sleep(Duration::from_secs(2));
        assert_eq!(handle.status(), "out of start attempts");
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn graceful_stop_then_force_kill() {
        let mut d = desc("trap '' TERM; sleep 60");
        d.start_timeout_secs = 0;
        d.shutdown_timeout_secs = 1;
        let handle = spawn_instance(d, "stubborn".to_string());
        sleep(Duration::from_millis(300));
        handle.stop();
        sleep(Duration::from_millis(1500));
        assert_eq!(handle.status(), "exited by SIGKILL");
        handle.shutdown();
        handle.join();
    }

    #[test]
    fn stop_on_not_started_is_a_no_op() {
        let mut d = desc("sleep 60");
        d.start_on_launch = false;
        let handle = spawn_instance(d, "idle".to_string());
        sleep(Duration::from_millis(100));
        handle.stop();
        sleep(Duration::from_millis(100));
        assert_eq!(handle.status(), "not started");
        handle.shutdown();
        handle.join();
    }
}
