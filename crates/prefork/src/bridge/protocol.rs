//! Wire protocol for master-worker communication.
//!
//! One control connection per worker, carrying `cmd`-tagged JSON frames:
//! - **WorkerMessage**: register, ready, files, log, status
//! - **MasterMessage**: bootstrap, status_reply
//!
//! `LaunchSpec` is the serialized configuration record a worker is started
//! with; its slot/generation pair is echoed back in `register` so the master
//! can reject stale children after a respawn. If this record changes, both
//! sides must change together.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Messages from worker to master.
///
/// A connection is unauthorized until its first frame is a valid `Register`;
/// any other verb before that, and any frame that fails to decode, is a
/// protocol violation and closes the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once the worker is listening on its data socket.
    Register {
        /// Slot index from the launch spec.
        slot: usize,
        /// Spawn generation from the launch spec.
        generation: u64,
        /// OS pid of the worker process.
        pid: u32,
    },

    /// Application bootstrap succeeded; the slot becomes eligible.
    Ready,

    /// Source files the worker wants watched (merged as a set union).
    Files { files: Vec<PathBuf> },

    /// Free-form log line, forwarded verbatim to operator output.
    Log { message: String },

    /// Request a pool status report.
    Status,
}

/// Messages from master to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MasterMessage {
    /// Run the application bootstrap. Sent immediately after a `register`
    /// is accepted.
    Bootstrap,

    /// Reply to `status`. Placeholder schema.
    StatusReply {
        slots_total: usize,
        slots_ready: usize,
        uptime_secs: u64,
        /// Master start time, RFC 3339.
        started_at: String,
    },
}

/// Serialized configuration a worker is launched with.
///
/// The supervisor writes this as JSON next to the control socket and passes
/// the file path as the last argument of the worker command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Stable slot index; also derives the data socket path.
    pub slot: usize,
    /// Spawn generation, echoed back in `register`.
    pub generation: u64,
    /// Unix socket path the worker must listen on for proxied connections.
    pub data_addr: PathBuf,
    /// Unix socket path of the master's control plane.
    pub control_addr: PathBuf,
    /// Application bootstrap identifier.
    pub bootstrap_ref: String,
    /// Bridge identifier.
    pub bridge_ref: String,
    /// Environment tag (e.g. "dev", "prod").
    pub app_env: String,
    /// Debug mode (file watching + emergency semantics on the master side).
    pub debug: bool,
    /// Whether the worker should emit request logging.
    pub logging: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_serializes_with_cmd_tag() {
        let msg = WorkerMessage::Register {
            slot: 1,
            generation: 4,
            pid: 31337,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"cmd": "register", "slot": 1, "generation": 4, "pid": 31337})
        );
    }

    #[test]
    fn ready_serializes_with_cmd_tag() {
        assert_eq!(
            serde_json::to_value(WorkerMessage::Ready).unwrap(),
            json!({"cmd": "ready"})
        );
    }

    #[test]
    fn files_roundtrips() {
        let msg = WorkerMessage::Files {
            files: vec![PathBuf::from("/srv/app/config.rb")],
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"cmd": "files", "files": ["/srv/app/config.rb"]})
        );

        let parsed: WorkerMessage = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed, WorkerMessage::Files { files } if files.len() == 1));
    }

    #[test]
    fn log_serializes_with_message() {
        assert_eq!(
            serde_json::to_value(WorkerMessage::Log {
                message: "booted".to_string()
            })
            .unwrap(),
            json!({"cmd": "log", "message": "booted"})
        );
    }

    #[test]
    fn bootstrap_serializes_with_cmd_tag() {
        assert_eq!(
            serde_json::to_value(MasterMessage::Bootstrap).unwrap(),
            json!({"cmd": "bootstrap"})
        );
    }

    #[test]
    fn status_reply_roundtrips() {
        let msg = MasterMessage::StatusReply {
            slots_total: 4,
            slots_ready: 3,
            uptime_secs: 61,
            started_at: "2024-03-01T12:00:00+00:00".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "cmd": "status_reply",
                "slots_total": 4,
                "slots_ready": 3,
                "uptime_secs": 61,
                "started_at": "2024-03-01T12:00:00+00:00"
            })
        );
    }

    #[test]
    fn unknown_cmd_is_rejected() {
        let result = serde_json::from_value::<WorkerMessage>(json!({"cmd": "halt"}));
        assert!(result.is_err());
    }

    #[test]
    fn launch_spec_roundtrips() {
        let spec = LaunchSpec {
            slot: 2,
            generation: 9,
            data_addr: PathBuf::from("/tmp/prefork-x/slot-2.sock"),
            control_addr: PathBuf::from("/tmp/prefork-x/control.sock"),
            bootstrap_ref: "symfony".to_string(),
            bridge_ref: "httpkernel".to_string(),
            app_env: "dev".to_string(),
            debug: true,
            logging: true,
        };
        let json = serde_json::to_string(&spec).unwrap();
        let parsed: LaunchSpec = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.slot, 2);
        assert_eq!(parsed.generation, 9);
        assert_eq!(parsed.data_addr, PathBuf::from("/tmp/prefork-x/slot-2.sock"));
        assert!(parsed.debug);
    }
}
