//! Thread-per-connection listener dispatching RPC requests onto the TaskMaster's public API.
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use tracing::{info, warn};

use super::protocol::{read_frame, write_frame, Request, Response};
use crate::error::RpcError;
use crate::task_master::{TaskMasterApi, TaskMasterHandle};

/// Accepts connections on `listener` until it is closed, spawning one handler thread
/// per connection. Each handler calls straight into `task_master`'s public API; it
/// never touches Task or Instance internals directly.
pub fn serve(listener: TcpListener, task_master: Arc<TaskMasterHandle>) {
    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "rpc listener started"
    );
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let task_master = task_master.clone();
                std::thread::spawn(move || handle_connection(stream, &task_master));
            }
            Err(err) => warn!(error = %err, "failed to accept connection"),
        }
    }
}

fn handle_connection(mut stream: TcpStream, task_master: &TaskMasterHandle) {
    handle_connection_with(&mut stream, task_master)
}

fn handle_connection_with(stream: &mut TcpStream, task_master: &dyn TaskMasterApi) {
    loop {
        let request: Request = match read_frame(stream) {
            Ok(request) => request,
            Err(RpcError::Io(_)) => return,
            Err(err) => {
                warn!(error = %err, "malformed request, closing connection");
                return;
            }
        };

        let response = dispatch(task_master, request);
        if write_frame(stream, &response).is_err() {
            return;
        }
    }
}

fn dispatch(task_master: &dyn TaskMasterApi, request: Request) -> Response {
    match request {
        Request::Start(target) => {
            task_master.start(target.name, target.instances);
            ack()
        }
        Request::Stop(target) => {
            task_master.stop(target.name, target.instances);
            ack()
        }
        Request::Restart(target) => {
            task_master.restart(target.name, target.instances);
            ack()
        }
        Request::Status(target) => Response::Ok {
            message: task_master.status(&target.name, &target.instances),
        },
        Request::List => Response::Names {
            names: task_master.list(),
        },
        Request::Reload => {
            task_master.reload();
            ack()
        }
        Request::Shutdown => {
            task_master.shutdown();
            ack()
        }
    }
}

fn ack() -> Response {
    Response::Ok {
        message: "ok".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_master::MockTaskMasterApi;
    use crate::rpc::protocol::Target;

    #[test]
    fn start_request_invokes_start_and_acks() {
        let mut mock = MockTaskMasterApi::new();
        mock.expect_start()
            .withf(|task: &String, instances: &Vec<u32>| task == "sleeper" && instances.as_slice() == [1, 2])
            .times(1)
            .return_const(());

        let response = dispatch(&mock, Request::Start(Target::new("sleeper".to_string(), vec![1, 2])));
        assert!(matches!(response, Response::Ok { .. }));
    }

    #[test]
    fn status_request_forwards_the_task_masters_answer() {
        let mut mock = MockTaskMasterApi::new();
        mock.expect_status()
            .withf(|task, instances| task == "sleeper" && instances.is_empty())
            .return_once(|_, _| "sleeper: running (pid: 1)".to_string());

        let response = dispatch(&mock, Request::Status(Target::new("sleeper".to_string(), Vec::new())));
        assert_eq!(
            response,
            Response::Ok {
                message: "sleeper: running (pid: 1)".to_string()
            }
        );
    }

    #[test]
    fn list_request_returns_names_from_the_task_master() {
        let mut mock = MockTaskMasterApi::new();
        mock.expect_list()
            .return_once(|| vec!["a".to_string(), "b".to_string()]);

        let response = dispatch(&mock, Request::List);
        assert_eq!(
            response,
            Response::Names {
                names: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn shutdown_request_invokes_shutdown_once() {
        let mut mock = MockTaskMasterApi::new();
        mock.expect_shutdown().times(1).return_const(());

        let response = dispatch(&mock, Request::Shutdown);
        assert!(matches!(response, Response::Ok { .. }));
    }
}
