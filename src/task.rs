//! Owns N instances of one task description; handles replica scaling and per-task commands.
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::Receiver;
use tracing::{debug, info, warn};

use crate::config::TaskDescription;
use crate::event::channel::{pub_sub, EventConsumer, EventPublisher};
use crate::instance::{spawn_instance, InstanceHandle};

#[derive(Debug, Clone)]
pub enum TaskCommand {
    Start(u32),
    Stop(u32),
    Restart(u32),
    Update(Box<TaskDescription>),
    Shutdown,
}

/// A handle to a running task, held by the owning [`crate::task_master::TaskMaster`].
pub struct TaskHandle {
    name: String,
    desc: Arc<Mutex<TaskDescription>>,
    instances: Arc<Mutex<Vec<InstanceHandle>>>,
    publisher: EventPublisher<TaskCommand>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn start(&self, id: u32) {
        let _ = self.publisher.publish(TaskCommand::Start(id));
    }

    pub fn stop(&self, id: u32) {
        let _ = self.publisher.publish(TaskCommand::Stop(id));
    }

    pub fn restart(&self, id: u32) {
        let _ = self.publisher.publish(TaskCommand::Restart(id));
    }

    pub fn update(&self, desc: TaskDescription) {
        let _ = self.publisher.publish(TaskCommand::Update(Box::new(desc)));
    }

    pub fn shutdown(&self) {
        let _ = self.publisher.publish(TaskCommand::Shutdown);
    }

    pub fn replicas(&self) -> u32 {
        self.desc.lock().unwrap().replicas
    }

    /// Synchronous read of the addressed instances' current stage renderings, bypassing
    /// the command inbox entirely: a status query is not a state change.
    pub fn status(&self, ids: &[u32]) -> String {
        let instances = self.instances.lock().unwrap();
        let ids: Vec<u32> = if ids.is_empty() {
            (1..=instances.len() as u32).collect()
        } else {
            ids.to_vec()
        };
        ids.iter()
            .map(|id| match resolve(&instances, *id) {
                Some(instance) => format!("{id}: {}", instance.status()),
                None => format!("{id}: inexistent"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Blocks until the task's run loop (and every instance it owns) has returned.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn resolve(instances: &[InstanceHandle], id: u32) -> Option<&InstanceHandle> {
    if id == 0 {
        return None;
    }
    instances.get(id as usize - 1)
}

fn build_instances(task_name: &str, desc: &TaskDescription) -> Vec<InstanceHandle> {
    (1..=desc.replicas)
        .map(|id| spawn_instance(desc.clone(), format!("{task_name}:{id}")))
        .collect()
}

/// Spawns the dedicated thread that owns this task's instances and command inbox.
pub fn spawn_task(name: String, desc: TaskDescription) -> TaskHandle {
    let (publisher, consumer) = pub_sub::<TaskCommand>();
    let instances = Arc::new(Mutex::new(build_instances(&name, &desc)));
    let desc_shared = Arc::new(Mutex::new(desc));

    let thread_instances = instances.clone();
    let thread_desc = desc_shared.clone();
    let thread_name = name.clone();
    let join = std::thread::Builder::new()
        .name(format!("task-{name}"))
        .spawn(move || run(thread_name, thread_desc, thread_instances, consumer))
        .expect("failed to spawn task thread");

    TaskHandle {
        name,
        desc: desc_shared,
        instances,
        publisher,
        join: Some(join),
    }
}

fn with_instance(instances: &Arc<Mutex<Vec<InstanceHandle>>>, id: u32, name: &str, f: impl FnOnce(&InstanceHandle)) {
    let guard = instances.lock().unwrap();
    match resolve(&guard, id) {
        Some(instance) => f(instance),
        None => warn!(task = name, id, "unknown instance"),
    }
}

fn run(
    name: String,
    desc: Arc<Mutex<TaskDescription>>,
    instances: Arc<Mutex<Vec<InstanceHandle>>>,
    cmd_rx: EventConsumer<TaskCommand>,
) {
    let cmd_rx: Receiver<TaskCommand> = cmd_rx.as_ref().clone();

    loop {
        let command = match cmd_rx.recv() {
            Ok(command) => command,
            Err(_) => break,
        };
        debug!(task = %name, "command received");

        match command {
            TaskCommand::Start(id) => with_instance(&instances, id, &name, |i| i.start()),
            TaskCommand::Stop(id) => with_instance(&instances, id, &name, |i| i.stop()),
            TaskCommand::Restart(id) => restart_instance(&name, &desc, &instances, id),
            TaskCommand::Update(new_desc) => apply_update(&name, &desc, &instances, *new_desc),
            TaskCommand::Shutdown => {
                info!(task = %name, "shutting down");
                let guard = instances.lock().unwrap();
                for instance in guard.iter() {
                    instance.shutdown();
                }
                break;
            }
        }
    }

    let remaining: Vec<InstanceHandle> = std::mem::take(&mut *instances.lock().unwrap());
    for instance in remaining {
        instance.join();
    }
}

/// Tears the addressed instance down, awaits it, then spawns a brand new one in its
/// slot, the only way "restart" is expressed, rather than relying on an Exited
/// instance re-entering Starting on its own.
fn restart_instance(
    name: &str,
    desc: &Arc<Mutex<TaskDescription>>,
    instances: &Arc<Mutex<Vec<InstanceHandle>>>,
    id: u32,
) {
    let taken = {
        let mut guard = instances.lock().unwrap();
        if id == 0 || id as usize > guard.len() {
            warn!(task = name, id, "unknown instance");
            None
        } else {
            Some(guard.remove(id as usize - 1))
        }
    };
    let Some(old) = taken else { return };

    old.shutdown();
    old.join();

    let current_desc = desc.lock().unwrap().clone();
    let fresh = spawn_instance(current_desc, format!("{name}:{id}"));
    let mut guard = instances.lock().unwrap();
    let idx = (id as usize - 1).min(guard.len());
    guard.insert(idx, fresh);
}

/// Applies a new description, choosing between a wholesale rebuild (material change)
/// and an in-place update plus replica adjustment.
fn apply_update(
    name: &str,
    desc: &Arc<Mutex<TaskDescription>>,
    instances: &Arc<Mutex<Vec<InstanceHandle>>>,
    new_desc: TaskDescription,
) {
    let requires_restart = desc.lock().unwrap().requires_restart(&new_desc);

    if requires_restart {
        info!(task = name, "restarting all processes");
        let old: Vec<InstanceHandle> = std::mem::take(&mut *instances.lock().unwrap());
        for instance in &old {
            instance.shutdown();
        }
        for instance in old {
            instance.join();
        }

        *desc.lock().unwrap() = new_desc.clone();
        *instances.lock().unwrap() = build_instances(name, &new_desc);
        return;
    }

    info!(task = name, "updating all processes");
    let current_replicas = instances.lock().unwrap().len() as u32;

    if new_desc.replicas < current_replicas {
        let surplus: Vec<InstanceHandle> = {
            let mut guard = instances.lock().unwrap();
            guard.split_off(new_desc.replicas as usize)
        };
        for instance in &surplus {
            instance.shutdown();
        }
        for instance in surplus {
            instance.join();
        }
    }

    {
        let guard = instances.lock().unwrap();
        for instance in guard.iter() {
            instance.update_description(new_desc.clone());
        }
    }
    *desc.lock().unwrap() = new_desc.clone();

    if new_desc.replicas > current_replicas {
        let mut guard = instances.lock().unwrap();
        for id in (current_replicas + 1)..=new_desc.replicas {
            guard.push(spawn_instance(new_desc.clone(), format!("{name}:{id}")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RestartPolicy, SignalName};
    use std::collections::BTreeMap;
    use std::thread::sleep;
    use std::time::Duration;

    fn desc(command: &str, replicas: u32) -> TaskDescription {
        TaskDescription {
            command: command.to_string(),
            replicas,
            start_on_launch: true,
            restart: RestartPolicy::Always,
            success_exit_codes: vec![0],
            start_timeout_secs: 0,
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

    #[test]
    fn status_reports_inexistent_for_out_of_range_ids() {
        let task = spawn_task("sleeper".to_string(), desc("sleep 60", 1));
        sleep(Duration::from_millis(200));
        assert_eq!(task.status(&[5]), "5: inexistent");
        task.shutdown();
        task.join();
    }

    #[test]
    fn reload_scales_replicas_up() {
        let task = spawn_task("sleeper".to_string(), desc("sleep 60", 2));
        sleep(Duration::from_millis(300));
        let before = task.status(&[]);
        assert!(before.contains("1:") && before.contains("2:"));

        task.update(desc("sleep 60", 4));
        sleep(Duration::from_millis(300));
        let after = task.status(&[]);
        assert!(after.contains("1:"));
        assert!(after.contains("2:"));
        assert!(after.contains("3:"));
        assert!(after.contains("4:"));

        task.shutdown();
        task.join();
    }

    #[test]
    fn material_update_rebuilds_instances() {
        let task = spawn_task("sleeper".to_string(), desc("sleep 60", 1));
        sleep(Duration::from_millis(200));

        let mut new_desc = desc("sleep 30", 1);
        new_desc.command = "sleep 30".to_string();
        task.update(new_desc);
        sleep(Duration::from_millis(300));
        assert!(task.status(&[1]).contains("running"));

        task.shutdown();
        task.join();
    }
}
