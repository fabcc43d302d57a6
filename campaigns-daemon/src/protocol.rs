use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use campaigns_core::{CampaignId, CampaignSpecFile, ChangesetId, HostKind};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request, tagged by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum EngineRequest {
    Status,
    Stop,
    /// Sync one changeset ahead of its schedule.
    Sync { changeset: ChangesetId },
    AddRepo {
        name: String,
        host: HostKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        external_service_id: Option<String>,
    },
    Apply { spec: CampaignSpecFile },
    Retry { changeset: ChangesetId },
    Close {
        campaign: CampaignId,
        #[serde(default)]
        close_changesets: bool,
    },
}

impl EngineRequest {
    pub fn name(&self) -> &'static str {
        match self {
            EngineRequest::Status => "status",
            EngineRequest::Stop => "stop",
            EngineRequest::Sync { .. } => "sync",
            EngineRequest::AddRepo { .. } => "add_repo",
            EngineRequest::Apply { .. } => "apply",
            EngineRequest::Retry { .. } => "retry",
            EngineRequest::Close { .. } => "close",
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResponse {
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

/// Send one JSON request to the engine socket and return one response.
pub fn send_request(home: &Path, request: &EngineRequest) -> Result<EngineResponse, DaemonError> {
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
            "engine closed connection before responding".to_string(),
        ));
    }

    let response: EngineResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Send `request` and unwrap the response payload.
pub fn request(home: &Path, request: &EngineRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(home, request)?)
}

/// Status, retried briefly so a daemon that is still binding its socket is
/// not reported as stopped.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &EngineRequest::Status) {
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
        DaemonError::Protocol("engine status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    request(home, &EngineRequest::Stop).map(|_| ())
}

pub fn request_sync(home: &Path, changeset: ChangesetId) -> Result<Value, DaemonError> {
    request(home, &EngineRequest::Sync { changeset })
}

fn response_into_data(response: EngineResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown engine error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn requests_are_tagged_by_cmd() {
        let encoded = serde_json::to_value(EngineRequest::Sync {
            changeset: ChangesetId(7),
        })
        .expect("encode");
        assert_eq!(encoded, json!({ "cmd": "sync", "changeset": 7 }));

        let decoded: EngineRequest =
            serde_json::from_str(r#"{"cmd":"close","campaign":3}"#).expect("decode");
        assert_eq!(
            decoded,
            EngineRequest::Close {
                campaign: CampaignId(3),
                close_changesets: false
            }
        );
        assert_eq!(decoded.name(), "close");
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().expect("home");
        let err = send_request(home.path(), &EngineRequest::Status).expect_err("no daemon");
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = response_into_data(EngineResponse::error("unknown changeset"))
            .expect_err("error response");
        assert_eq!(err.to_string(), "daemon protocol error: unknown changeset");
    }
}
