//! Top-level supervisor: owns every task, the configuration file and the reload algorithm.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::task::{spawn_task, TaskHandle};

#[derive(Debug, Clone)]
pub enum TaskMasterCommand {
    Start { task: String, instances: Vec<u32> },
    Stop { task: String, instances: Vec<u32> },
    Restart { task: String, instances: Vec<u32> },
    Reload,
    Shutdown,
}

/// The supervisor surface the RPC dispatcher talks to. Split out from `TaskMasterHandle`
/// so `rpc::server::dispatch` can be exercised against a mock without a real run loop.
#[cfg_attr(test, mockall::automock)]
pub trait TaskMasterApi {
    fn start(&self, task: String, instances: Vec<u32>);
    fn stop(&self, task: String, instances: Vec<u32>);
    fn restart(&self, task: String, instances: Vec<u32>);
    fn reload(&self);
    fn shutdown(&self);
    fn list(&self) -> Vec<String>;
    fn status(&self, task: &str, instances: &[u32]) -> String;
}

/// A handle to the supervisor's run loop, held by the control surface (RPC server, CLI).
///
/// Shared as `Arc<TaskMasterHandle>` between the RPC listener and the signal thread, so
/// the join handle lives behind a `Mutex` and is taken by whichever caller joins first.
pub struct TaskMasterHandle {
    tasks: Arc<Mutex<HashMap<String, TaskHandle>>>,
    publisher: EventPublisher<TaskMasterCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskMasterHandle {
    /// Blocks until the supervisor's run loop (and every task it owns) has returned.
    pub fn join(&self) {
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
    }
}

impl TaskMasterApi for TaskMasterHandle {
    fn start(&self, task: String, instances: Vec<u32>) {
        let _ = self.publisher.publish(TaskMasterCommand::Start { task, instances });
    }

    fn stop(&self, task: String, instances: Vec<u32>) {
        let _ = self.publisher.publish(TaskMasterCommand::Stop { task, instances });
    }

    fn restart(&self, task: String, instances: Vec<u32>) {
        let _ = self.publisher.publish(TaskMasterCommand::Restart { task, instances });
    }

    fn reload(&self) {
        let _ = self.publisher.publish(TaskMasterCommand::Reload);
    }

    fn shutdown(&self) {
        let _ = self.publisher.publish(TaskMasterCommand::Shutdown);
    }

    /// Names of every currently known task, sorted for stable output.
    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Synchronous status read, same rationale as [`crate::task::TaskHandle::status`]:
    /// a query is not a command and must not wait behind the inbox.
    fn status(&self, task: &str, instances: &[u32]) -> String {
        match self.tasks.lock().unwrap().get(task) {
            Some(handle) => handle.status(instances),
            None => format!("unknown task {task}"),
        }
    }
}

fn resolve_instances(handle: &TaskHandle, instances: Vec<u32>) -> Vec<u32> {
    if instances.is_empty() {
        (1..=handle.replicas()).collect()
    } else {
        instances
    }
}

fn with_task<'a>(
    tasks: &'a HashMap<String, TaskHandle>,
    name: &str,
) -> Option<&'a TaskHandle> {
    let task = tasks.get(name);
    if task.is_none() {
        warn!(task = name, "unknown task");
    }
    task
}

fn build_tasks(configuration: &Configuration) -> HashMap<String, TaskHandle> {
    configuration
        .tasks
        .iter()
        .map(|(name, desc)| (name.clone(), spawn_task(name.clone(), desc.clone())))
        .collect()
}

/// Spawns the supervisor's dedicated thread. `run()` itself loads `config_path` on entry,
/// mirroring the original's `TaskMaster.run` doing the first load lazily rather than in
/// the constructor; a load failure here is fatal and logged before the thread returns.
pub fn spawn_task_master(config_path: PathBuf) -> TaskMasterHandle {
    let (publisher, consumer) = pub_sub::<TaskMasterCommand>();
    let tasks = Arc::new(Mutex::new(HashMap::new()));
    let thread_tasks = tasks.clone();

    let join = std::thread::Builder::new()
        .name("task-master".to_string())
        .spawn(move || run(config_path, thread_tasks, consumer))
        .expect("failed to spawn task-master thread");

    TaskMasterHandle {
        tasks,
        publisher,
        join: Mutex::new(Some(join)),
    }
}

fn run(config_path: PathBuf, tasks: Arc<Mutex<HashMap<String, TaskHandle>>>, cmd_rx: EventConsumer<TaskMasterCommand>) {
    info!("starting");

    let mut configuration = match Configuration::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "could not load configuration, aborting startup");
            return;
        }
    };

    *tasks.lock().unwrap() = build_tasks(&configuration);

    let cmd_rx: Receiver<TaskMasterCommand> = cmd_rx.as_ref().clone();

    loop {
        let command = match cmd_rx.recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        debug!(?command, "command received");

        match command {
            TaskMasterCommand::Start { task, instances } => {
                let guard = tasks.lock().unwrap();
                if let Some(handle) = with_task(&guard, &task) {
                    for id in resolve_instances(handle, instances) {
                        handle.start(id);
                    }
                }
            }
            TaskMasterCommand::Stop { task, instances } => {
                let guard = tasks.lock().unwrap();
                if let Some(handle) = with_task(&guard, &task) {
                    for id in resolve_instances(handle, instances) {
                        handle.stop(id);
                    }
                }
            }
            TaskMasterCommand::Restart { task, instances } => {
                let guard = tasks.lock().unwrap();
                if let Some(handle) = with_task(&guard, &task) {
                    for id in resolve_instances(handle, instances) {
                        handle.restart(id);
                    }
                }
            }
            TaskMasterCommand::Reload => {
                info!("reloading");
                match Configuration::load(&config_path) {
                    Ok(new_configuration) => {
                        reconcile(&mut configuration, new_configuration, &tasks);
                    }
                    Err(err) => {
                        error!(error = %err, "skipping reload, could not load configuration");
                    }
                }
            }
            TaskMasterCommand::Shutdown => {
                info!("shutting down");
                let guard = tasks.lock().unwrap();
                for handle in guard.values() {
                    handle.shutdown();
                }
                break;
            }
        }
    }

    debug!("waiting for tasks to return");
    let remaining: Vec<TaskHandle> = std::mem::take(&mut *tasks.lock().unwrap())
        .into_values()
        .collect();
    for handle in remaining {
        handle.join();
    }
}

/// Applies a reload: tasks dropped from the file are shut down and awaited, tasks
/// common to both are handed their new description, brand new tasks are spawned.
/// Mirrors the original's three-way set partition (`to_shutdown`/`to_update`/`to_start`).
fn reconcile(
    configuration: &mut Configuration,
    new_configuration: Configuration,
    tasks: &Arc<Mutex<HashMap<String, TaskHandle>>>,
) {
    let previous_names: std::collections::HashSet<&String> = configuration.tasks.keys().collect();
    let new_names: std::collections::HashSet<&String> = new_configuration.tasks.keys().collect();

    let to_shutdown: Vec<String> = previous_names.difference(&new_names).map(|s| s.to_string()).collect();
    let to_update: Vec<String> = previous_names.intersection(&new_names).map(|s| s.to_string()).collect();
    let to_start: Vec<String> = new_names.difference(&previous_names).map(|s| s.to_string()).collect();

    let shutting_down: Vec<TaskHandle> = {
        let mut guard = tasks.lock().unwrap();
        let mut removed = Vec::new();
        for name in &to_shutdown {
            debug!(task = name, "shutting down");
            if let Some(handle) = guard.remove(name) {
                handle.shutdown();
                removed.push(handle);
            }
        }
        removed
    };

    {
        let guard = tasks.lock().unwrap();
        for name in &to_update {
            debug!(task = name, "updating");
            if let Some(handle) = guard.get(name) {
                handle.update(new_configuration.tasks[name].clone());
            }
        }
    }

    for handle in shutting_down {
        handle.join();
    }

    {
        let mut guard = tasks.lock().unwrap();
        for name in &to_start {
            debug!(task = name, "starting");
            guard.insert(name.clone(), spawn_task(name.clone(), new_configuration.tasks[name].clone()));
        }
    }

    *configuration = new_configuration;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread::sleep;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reload_removes_dropped_tasks() {
        let file = write_config(
            r#"
tasks:
  a:
    command: "sleep 60"
  b:
    command: "sleep 60"
"#,
        );
        let master = spawn_task_master(file.path().to_path_buf());
        sleep(Duration::from_millis(300));
        assert_eq!(master.list(), vec!["a".to_string(), "b".to_string()]);

        let mut updated = std::fs::File::create(file.path()).unwrap();
        updated
            .write_all(
                br#"
tasks:
  a:
    command: "sleep 60"
"#,
            )
            .unwrap();
        drop(updated);

        master.reload();
        sleep(Duration::from_millis(300));
        assert_eq!(master.list(), vec!["a".to_string()]);

        master.shutdown();
        master.join();
    }

    #[test]
    fn status_reports_unknown_task() {
        let file = write_config(
            r#"
tasks:
  a:
    command: "sleep 60"
"#,
        );
        let master = spawn_task_master(file.path().to_path_buf());
        sleep(Duration::from_millis(200));
        assert_eq!(master.status("nope", &[]), "unknown task nope");
        master.shutdown();
        master.join();
    }
}
