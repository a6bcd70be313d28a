use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use stackyard_core::paths::socket_path;

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    /// Target unit for delete/retry/update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Absolute path of the archive to stage for `agent.create`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::new("stop"))?;
    response_into_data(response).map(|_| ())
}

pub fn request_units(home: &Path) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, &DaemonRequest::new("units"))?)
}

pub fn request_stack_create(
    home: &Path,
    name: &str,
    description: Option<String>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        name: Some(name.to_string()),
        description,
        ..DaemonRequest::new("stack.create")
    };
    response_into_data(send_request(home, &request)?)
}

pub fn request_stack_delete(home: &Path, stack_id: &str) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("stack.delete").with_id(stack_id);
    response_into_data(send_request(home, &request)?)
}

pub fn request_stack_retry(home: &Path, stack_id: &str) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("stack.retry").with_id(stack_id);
    response_into_data(send_request(home, &request)?)
}

/// Edit a settled stack. Unset fields keep their current value.
pub fn request_stack_update(
    home: &Path,
    stack_id: &str,
    name: Option<String>,
    description: Option<String>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        name,
        description,
        ..DaemonRequest::new("stack.update").with_id(stack_id)
    };
    response_into_data(send_request(home, &request)?)
}

pub fn request_agent_create(
    home: &Path,
    stack_id: &str,
    name: &str,
    description: Option<String>,
    archive: &Path,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        stack_id: Some(stack_id.to_string()),
        name: Some(name.to_string()),
        description,
        archive: Some(archive.to_path_buf()),
        ..DaemonRequest::new("agent.create")
    };
    response_into_data(send_request(home, &request)?)
}

pub fn request_agent_delete(home: &Path, agent_id: &str) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("agent.delete").with_id(agent_id);
    response_into_data(send_request(home, &request)?)
}

pub fn request_agent_update(
    home: &Path,
    agent_id: &str,
    name: Option<String>,
    description: Option<String>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        name,
        description,
        ..DaemonRequest::new("agent.update").with_id(agent_id)
    };
    response_into_data(send_request(home, &request)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_omits_unset_fields() {
        let encoded = serde_json::to_string(&DaemonRequest::new("stack.delete").with_id("abc"))
            .expect("encode");
        assert_eq!(encoded, r#"{"cmd":"stack.delete","id":"abc"}"#);
    }

    #[test]
    fn bare_command_decodes() {
        let request: DaemonRequest = serde_json::from_str(r#"{"cmd":"status"}"#).expect("decode");
        assert_eq!(request.cmd, "status");
        assert!(request.id.is_none() && request.archive.is_none());
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(DaemonResponse::error("unit busy")).unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(ref m) if m == "unit busy"));
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = tempfile::TempDir::new().expect("home");
        let err = send_request(home.path(), &DaemonRequest::new("status")).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }
}
