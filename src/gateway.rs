/// Transport-agnostic request gateway.
///
/// Maps `GET /cache/{key}`, `PUT /cache/{key}/{value}` and `POST /cache/failure` onto
/// supervisor calls and renders each outcome as a status code and a text body. An http
/// server only needs to hand over the method and the raw path and write the response back;
/// the key and value segments are percent-decoded here.
///
use log::*;
use serde::Serialize;

use crate::cache::Supervisor;
use crate::error::CacheError;
use crate::worker::JsonString;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;
pub const STATUS_UNAVAILABLE: u16 = 503;

const CACHE_PREFIX: &str = "/cache/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get { key: String },
    Put { key: String, value: String },
    SimulateFailure,
}

impl Request {
    /// Parse a method and path; `None` when no route matches.
    ///
    /// The value of a Put is everything after the key, slashes included.
    pub fn parse(method: &str, path: &str) -> Option<Request> {
        let rest = path.strip_prefix(CACHE_PREFIX)?;

        match method.to_ascii_uppercase().as_str() {
            "GET" if !rest.contains('/') => Some(Request::Get { key: decode(rest) }),
            "PUT" => {
                let (key, value) = rest.split_once('/')?;
                Some(Request::Put {
                    key: decode(key),
                    value: decode(value),
                })
            }
            "POST" if rest == "failure" => Some(Request::SimulateFailure),
            _ => None,
        }
    }
}

// invalid utf-8 in an escape is replaced rather than rejected
fn decode(segment: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(segment.as_bytes())).into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn new<B: Into<String>>(status: u16, body: B) -> Response {
        Response {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn to_json(&self) -> JsonString {
        match serde_json::to_string(self) {
            Ok(js) => js,
            Err(e) => format!(r#"{}"status":500,"body":"json error: {:?}"{}"#, "{", e, "}"),
        }
    }

    fn from_error(err: &CacheError) -> Response {
        let status = match err {
            CacheError::InvalidKey(_) => STATUS_BAD_REQUEST,
            CacheError::RequestTimeout(_) | CacheError::Unavailable(_) => STATUS_UNAVAILABLE,
            _ => STATUS_INTERNAL_ERROR,
        };

        Response::new(status, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Gateway {
    supervisor: Supervisor,
}

impl Gateway {
    pub fn new(supervisor: Supervisor) -> Gateway {
        Gateway { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// route a raw method/path pair
    pub async fn dispatch(&self, method: &str, path: &str) -> Response {
        match Request::parse(method, path) {
            Some(request) => self.handle(request).await,
            None => {
                debug!("gateway no route for: {} {}", method, path);
                Response::new(STATUS_NOT_FOUND, format!("no route for {} {}", method, path))
            }
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Get { key } => self.get(&key).await,
            Request::Put { key, value } => self.put(&key, &value).await,
            Request::SimulateFailure => self.simulate_failure().await,
        }
    }

    pub async fn get(&self, key: &str) -> Response {
        match self.supervisor.get(key).await {
            Ok(value) => match value.into_inner() {
                Some(v) => Response::new(STATUS_OK, v),
                None => Response::new(STATUS_NOT_FOUND, format!("key not found: {}", key)),
            },
            Err(e) => {
                warn!("gateway get failed for key: {}, {}", key, e);
                Response::from_error(&e)
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) -> Response {
        match self.supervisor.put(key, value).await {
            Ok(()) => Response::new(STATUS_OK, format!("cache set: {} = {}", key, value)),
            Err(e) => {
                warn!("gateway put failed for key: {}, {}", key, e);
                Response::from_error(&e)
            }
        }
    }

    pub async fn simulate_failure(&self) -> Response {
        match self.supervisor.simulate_failure().await {
            Ok(()) => Response::new(STATUS_OK, "failure simulation sent"),
            Err(e) => {
                warn!("gateway failure simulation not sent: {}", e);
                Response::from_error(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_routes() {
        assert_eq!(
            Request::parse("GET", "/cache/x"),
            Some(Request::Get {
                key: "x".to_string()
            })
        );
        assert_eq!(
            Request::parse("put", "/cache/x/a/b"),
            Some(Request::Put {
                key: "x".to_string(),
                value: "a/b".to_string()
            })
        );
        assert_eq!(
            Request::parse("PUT", "/cache/x/"),
            Some(Request::Put {
                key: "x".to_string(),
                value: String::new()
            })
        );
        assert_eq!(
            Request::parse("POST", "/cache/failure"),
            Some(Request::SimulateFailure)
        );

        assert_eq!(
            Request::parse("PUT", "/cache/my%20key/hello%20world"),
            Some(Request::Put {
                key: "my key".to_string(),
                value: "hello world".to_string()
            })
        );
        assert_eq!(
            Request::parse("GET", "/cache/a%2Fb"),
            Some(Request::Get {
                key: "a/b".to_string()
            })
        );

        assert_eq!(Request::parse("PUT", "/cache/x"), None);
        assert_eq!(Request::parse("GET", "/cache/x/y"), None);
        assert_eq!(Request::parse("DELETE", "/cache/x"), None);
        assert_eq!(Request::parse("GET", "/hello"), None);
    }

    #[test]
    fn error_status() {
        let resp = Response::from_error(&CacheError::RequestTimeout(Duration::from_secs(5)));
        assert_eq!(resp.status, STATUS_UNAVAILABLE);
        assert!(!resp.is_success());

        let resp = Response::from_error(&CacheError::InvalidKey(String::new()));
        assert_eq!(resp.status, STATUS_BAD_REQUEST);

        let resp = Response::from_error(&CacheError::RestartLimitExceeded("cache core".to_string()));
        assert_eq!(resp.status, STATUS_INTERNAL_ERROR);
    }

    #[test]
    fn json() {
        let resp = Response::new(STATUS_OK, "1");
        assert_eq!(resp.to_json(), r#"{"status":200,"body":"1"}"#);
    }
}
