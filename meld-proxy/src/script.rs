use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use meld_plugin::RequestData;

/// Socket the out-of-process script worker listens on.
pub const SCRIPT_WORKER_SOCKET_PATH: &str = "/tmp/meld-script.sock";

/// Hard cap on one serialized request message.
const SCRIPT_MSG_MAX_SIZE: usize = 64 * 1024 * 1024;
/// Headroom the worker may add on top of the echoed request.
const SCRIPT_MSG_EXTRA_BUF_SIZE: usize = 1024;

pub const SCRIPT_ACTION_CONTINUE: &str = "continue";
pub const SCRIPT_ACTION_ABORT: &str = "abort";

/// Request sent to the script worker.
#[derive(Debug, Serialize)]
pub struct ScriptRequest<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Option<&'a [u8]>,
    pub client_ip: &'a str,
}

/// Response from the script worker: the latest gateway action plus the
/// (possibly rewritten) request fields.
#[derive(Debug, Deserialize)]
pub struct ScriptResponse {
    pub action: String,

    #[serde(default)]
    pub status: u16,

    #[serde(default)]
    pub error: String,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub query: String,

    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

impl ScriptResponse {
    /// Overwrite the in-flight request with the worker's rewrite.
    pub fn apply_to(&self, request: &mut RequestData) {
        request.method = self.method.clone();
        request.path = self.path.clone();
        request.query = self.query.clone();
        request.headers = headers_from_wire(&self.headers);
    }
}

/// Send the request snapshot to the script worker over its local stream
/// socket and read back the action response.
pub async fn send(request: &RequestData, request_id: &str) -> anyhow::Result<ScriptResponse> {
    send_to(SCRIPT_WORKER_SOCKET_PATH, request, request_id).await
}

pub async fn send_to(
    socket_path: &str,
    request: &RequestData,
    request_id: &str,
) -> anyhow::Result<ScriptResponse> {
    let script_request = ScriptRequest {
        request_id,
        method: &request.method,
        path: &request.path,
        query: &request.query,
        headers: headers_to_wire(&request.headers),
        body: None,
        client_ip: &request.client_ip,
    };

    let message = serde_json::to_vec(&script_request)
        .map_err(|e| anyhow::anyhow!("failed to serialize script request: {e}"))?;

    if message.len() > SCRIPT_MSG_MAX_SIZE {
        anyhow::bail!(
            "script request exceeds max size: {} bytes (limit {})",
            message.len(),
            SCRIPT_MSG_MAX_SIZE
        );
    }

    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to dial script worker socket: {e}"))?;

    stream
        .write_all(&message)
        .await
        .map_err(|e| anyhow::anyhow!("failed to write to script worker socket: {e}"))?;

    let mut buffer = vec![0u8; message.len() + SCRIPT_MSG_EXTRA_BUF_SIZE];
    let read = stream
        .read(&mut buffer)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read from script worker socket: {e}"))?;

    let response: ScriptResponse = serde_json::from_slice(&buffer[..read])
        .map_err(|e| anyhow::anyhow!("cannot parse script worker response: {e}"))?;

    Ok(response)
}

fn headers_to_wire(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut wire: HashMap<String, Vec<String>> = HashMap::new();

    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    wire
}

fn headers_from_wire(wire: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, values) in wire {
        let Ok(name) = HeaderName::try_from(name.as_str()) else {
            continue;
        };

        for value in values {
            if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                headers.append(name.clone(), value);
            }
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_headers_round_trip() {
        let mut headers = HeaderMap::new();
        headers.append("x-a", HeaderValue::from_static("1"));
        headers.append("x-a", HeaderValue::from_static("2"));
        headers.insert("x-b", HeaderValue::from_static("only"));

        let wire = headers_to_wire(&headers);
        assert_eq!(wire["x-a"], vec!["1", "2"]);
        assert_eq!(wire["x-b"], vec!["only"]);

        let restored = headers_from_wire(&wire);
        let values: Vec<_> = restored.get_all("x-a").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn invalid_wire_header_names_are_skipped() {
        let mut wire = HashMap::new();
        wire.insert("bad name".to_string(), vec!["x".to_string()]);
        wire.insert("good".to_string(), vec!["y".to_string()]);

        let headers = headers_from_wire(&wire);
        assert!(headers.get("good").is_some());
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn apply_to_overwrites_request_fields() {
        let response = ScriptResponse {
            action: SCRIPT_ACTION_CONTINUE.to_string(),
            status: 0,
            error: String::new(),
            method: "POST".to_string(),
            path: "/rewritten".to_string(),
            query: "a=1".to_string(),
            headers: HashMap::from([("x-new".to_string(), vec!["v".to_string()])]),
        };

        let mut request = RequestData {
            method: "GET".to_string(),
            path: "/old".to_string(),
            ..Default::default()
        };
        response.apply_to(&mut request);

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/rewritten");
        assert_eq!(request.query, "a=1");
        assert_eq!(request.header("x-new"), Some("v"));
    }

    #[tokio::test]
    async fn round_trip_against_local_worker() {
        let dir = std::env::temp_dir().join(format!("meld-script-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("worker.sock").to_string_lossy().into_owned();
        let _ = std::fs::remove_file(&socket);

        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let n = conn.read(&mut buf).await.unwrap();

            let incoming: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(incoming["method"], "GET");
            assert_eq!(incoming["request_id"], "req-1");

            let reply = serde_json::json!({
                "action": "continue",
                "status": 0,
                "error": "",
                "request_id": "req-1",
                "method": "GET",
                "path": "/rewritten",
                "query": "",
                "headers": {},
                "body": null,
                "client_ip": "127.0.0.1",
            });
            conn.write_all(reply.to_string().as_bytes()).await.unwrap();
        });

        let request = RequestData {
            method: "GET".to_string(),
            path: "/orders".to_string(),
            client_ip: "127.0.0.1".to_string(),
            ..Default::default()
        };

        let response = send_to(&socket, &request, "req-1").await.unwrap();
        assert_eq!(response.action, SCRIPT_ACTION_CONTINUE);
        assert_eq!(response.path, "/rewritten");

        let _ = std::fs::remove_file(&socket);
    }
}
