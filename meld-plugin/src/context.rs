use bytes::Bytes;
use http::HeaderMap;
use std::collections::HashMap;

/// Snapshot of the client request as seen by plugins and upstream calls.
///
/// Request-phase plugins and the script worker may rewrite method, path,
/// query and headers; once dispatch starts the data is frozen behind an
/// `Arc` and shared by every upstream task.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub method: String,
    pub path: String,
    /// Raw query string without the leading '?'.
    pub query: String,
    pub headers: HeaderMap,
    /// Buffered request body. Empty until the core handler reads it.
    pub body: Bytes,

    /// "ip:port" of the immediate peer.
    pub remote_addr: String,
    /// Value of the Host header (or URI authority).
    pub host: String,
    /// Whether the client connection was TLS. The gateway itself does not
    /// terminate TLS, so this is false unless a fronting layer says otherwise.
    pub tls: bool,
    /// Client IP resolved per the forwarded-header precedence rules.
    pub client_ip: String,
}

impl RequestData {
    /// Case-insensitive single-value header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parsed query pairs in order of appearance.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        form_urlencoded_pairs(&self.query)
    }

    /// First non-empty value for a query key.
    pub fn query_value(&self, key: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(k, v)| k == key && !v.is_empty())
            .map(|(_, v)| v)
    }
}

/// Minimal percent-decoding query parser. Pairs with no '=' get an empty value.
fn form_urlencoded_pairs(query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }

    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Response under construction, visible to response-phase plugins.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// Mutable per-request context threaded through middlewares and plugins.
///
/// Owned by a single request task; destroyed when the handler returns.
#[derive(Debug, Default)]
pub struct PluginContext {
    pub request_id: String,
    pub request: RequestData,
    /// Populated after aggregation, before response-phase plugins run.
    pub response: Option<ResponseData>,
    /// Shared key-value scratch space between plugins.
    pub vars: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    pub fn new(request: RequestData) -> Self {
        Self {
            request_id: String::new(),
            request,
            response: None,
            vars: HashMap::new(),
        }
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.vars.insert(key.into(), value);
    }

    pub fn get_var(&self, key: &str) -> Option<&serde_json::Value> {
        self.vars.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_preserve_order() {
        let req = RequestData {
            query: "b=2&a=1&b=3".to_string(),
            ..Default::default()
        };

        let pairs = req.query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn query_value_skips_empty_values() {
        let req = RequestData {
            query: "empty=&foo=bar".to_string(),
            ..Default::default()
        };

        assert_eq!(req.query_value("empty"), None);
        assert_eq!(req.query_value("foo"), Some("bar".to_string()));
    }

    #[test]
    fn query_decoding_handles_percent_and_plus() {
        let req = RequestData {
            query: "q=hello%20world&name=a+b".to_string(),
            ..Default::default()
        };

        assert_eq!(req.query_value("q"), Some("hello world".to_string()));
        assert_eq!(req.query_value("name"), Some("a b".to_string()));
    }

    #[test]
    fn vars_round_trip() {
        let mut ctx = PluginContext::new(RequestData::default());
        ctx.set_var("trace", serde_json::json!({"hops": 2}));
        assert_eq!(ctx.get_var("trace").unwrap()["hops"], 2);
        assert!(ctx.get_var("missing").is_none());
    }
}
