/// worker support structs shared by the cache core, the store connector and the supervisor
///
use serde::{Deserialize, Serialize};

pub type JsonString = String;

pub const OK: &str = "ok";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    #[default]
    Idle,
    Busy,
    Broken,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub status: String,
    pub state: WorkerState,
    pub uptime: String,
    pub error_count: u16,
}

impl WorkerStatus {
    pub fn new(
        worker_id: String,
        status: String,
        state: WorkerState,
        uptime: String,
        error_count: u16,
    ) -> WorkerStatus {
        WorkerStatus {
            worker_id,
            status,
            state,
            uptime,
            error_count,
        }
    }

    /// render as json; a serialization failure still produces a parsable status line
    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => {
                format!(r#"{}"status":"json parse error: {:?}"{}"#, "{", e, "}\n")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain_keys::keys::RouteKey;
    use service_uptime::Uptime;

    #[test]
    fn status_json() {
        let status = WorkerStatus::new(
            RouteKey::create(),
            OK.to_string(),
            WorkerState::Busy,
            Uptime::new().to_string(),
            2,
        );

        let js = status.to_json();
        println!("{}", js);
        assert!(js.contains(r#""state":"Busy""#));

        let parsed: WorkerStatus = serde_json::from_str(&js).expect("should parse status");
        assert_eq!(parsed, status);
    }
}
