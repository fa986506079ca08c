use serde_json::value::RawValue;
use serde_json::{Map, Value};
use tracing::{error, warn};

use meld_core::flow::{Aggregation, AggregationStrategy, ConflictPolicy};
use meld_core::response::{
    ClientError, CLIENT_ERR_INTERNAL, CLIENT_ERR_UPSTREAM_BODY_TOO_LARGE,
    CLIENT_ERR_UPSTREAM_ERROR, CLIENT_ERR_UPSTREAM_MALFORMED, CLIENT_ERR_UPSTREAM_UNAVAILABLE,
    CLIENT_ERR_VALUE_CONFLICT,
};

use crate::upstream::{UpstreamError, UpstreamErrorKind, UpstreamResponse};

/// Combined outcome of a flow's upstream responses.
///
/// Invariants: `partial` implies `errors` is non-empty and at least one
/// upstream contributed data; when `errors` is non-empty and `partial` is
/// false, `data` is None.
#[derive(Debug, Default)]
pub struct AggregatedResponse {
    pub data: Option<Box<RawValue>>,
    pub errors: Vec<ClientError>,
    pub partial: bool,
}

impl AggregatedResponse {
    fn single_error(code: ClientError) -> Self {
        Self {
            data: None,
            errors: vec![code],
            partial: false,
        }
    }
}

/// Combines ordered upstream responses into one client envelope.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        responses: Vec<UpstreamResponse>,
        aggregation: &Aggregation,
    ) -> AggregatedResponse;
}

pub struct DefaultAggregator;

impl Aggregator for DefaultAggregator {
    fn aggregate(
        &self,
        responses: Vec<UpstreamResponse>,
        aggregation: &Aggregation,
    ) -> AggregatedResponse {
        if responses.len() == 1 {
            return self.raw_response(responses);
        }

        match aggregation.strategy {
            AggregationStrategy::Merge => self.merge_responses(responses, aggregation),
            AggregationStrategy::Array => {
                self.array_of_responses(responses, aggregation.best_effort)
            }
            AggregationStrategy::Namespace => {
                error!("namespace aggregation strategy is reserved and not implemented");
                AggregatedResponse::single_error(CLIENT_ERR_INTERNAL)
            }
        }
    }
}

impl DefaultAggregator {
    /// Single-upstream shortcut: the body goes to the client verbatim.
    fn raw_response(&self, mut responses: Vec<UpstreamResponse>) -> AggregatedResponse {
        let resp = responses.remove(0);

        if let Some(err) = &resp.err {
            return AggregatedResponse::single_error(map_upstream_error(err));
        }

        let Some(body) = resp.body else {
            return AggregatedResponse::default();
        };

        match raw_json(&body) {
            Some(raw) => AggregatedResponse {
                data: Some(raw),
                errors: Vec::new(),
                partial: false,
            },
            None => {
                warn!("single upstream body is not valid JSON");
                AggregatedResponse::single_error(CLIENT_ERR_UPSTREAM_MALFORMED)
            }
        }
    }

    fn merge_responses(
        &self,
        responses: Vec<UpstreamResponse>,
        aggregation: &Aggregation,
    ) -> AggregatedResponse {
        let best_effort = aggregation.best_effort;

        let mut merged: Map<String, Value> = Map::new();
        // Which upstream currently owns each key, for the prefer policy.
        let mut owners: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut errors: Vec<ClientError> = Vec::new();
        let mut successes = 0usize;

        for (index, resp) in responses.into_iter().enumerate() {
            if let Some(err) = &resp.err {
                let client_error = map_upstream_error(err);

                warn!(
                    best_effort,
                    upstream_error = err.kind.as_str(),
                    cause = %err.cause,
                    client_error = %client_error,
                    "upstream has errors"
                );

                if !best_effort {
                    return AggregatedResponse::single_error(client_error);
                }

                errors.push(client_error);
                continue;
            }

            let Some(body) = resp.body else {
                continue;
            };

            let object: Map<String, Value> = match serde_json::from_slice(&body) {
                Ok(Value::Object(map)) => map,
                _ => {
                    warn!(best_effort, "upstream body is not a JSON object");

                    if !best_effort {
                        return AggregatedResponse::single_error(CLIENT_ERR_UPSTREAM_MALFORMED);
                    }

                    errors.push(CLIENT_ERR_UPSTREAM_MALFORMED);
                    continue;
                }
            };

            successes += 1;

            for (key, value) in object {
                if !merged.contains_key(&key) {
                    owners.insert(key.clone(), index);
                    merged.insert(key, value);
                    continue;
                }

                match aggregation.conflict_policy {
                    ConflictPolicy::Overwrite => {
                        owners.insert(key.clone(), index);
                        merged.insert(key, value);
                    }
                    ConflictPolicy::First => {}
                    ConflictPolicy::Error => {
                        return AggregatedResponse::single_error(CLIENT_ERR_VALUE_CONFLICT);
                    }
                    ConflictPolicy::Prefer => {
                        let preferred = aggregation.preferred_upstream;

                        if owners.get(&key).copied() == preferred {
                            // The incumbent came from the preferred upstream.
                            continue;
                        }

                        if Some(index) == preferred {
                            owners.insert(key.clone(), index);
                            merged.insert(key, value);
                        }
                        // Neither side is preferred: retain the incumbent.
                    }
                }
            }
        }

        let data = match serde_json::to_string(&Value::Object(merged))
            .ok()
            .and_then(|s| RawValue::from_string(s).ok())
        {
            Some(raw) => Some(raw),
            None => return AggregatedResponse::single_error(CLIENT_ERR_INTERNAL),
        };

        let errors = dedupe_errors(errors);
        let partial = !errors.is_empty() && successes > 0;

        let data = if !errors.is_empty() && !partial {
            None
        } else {
            data
        };

        AggregatedResponse {
            data,
            errors,
            partial,
        }
    }

    fn array_of_responses(
        &self,
        responses: Vec<UpstreamResponse>,
        best_effort: bool,
    ) -> AggregatedResponse {
        let mut elements: Vec<Box<RawValue>> = Vec::new();
        let mut errors: Vec<ClientError> = Vec::new();

        for resp in responses {
            if let Some(err) = &resp.err {
                let client_error = map_upstream_error(err);

                warn!(
                    best_effort,
                    upstream_error = err.kind.as_str(),
                    cause = %err.cause,
                    client_error = %client_error,
                    "upstream has errors"
                );

                if !best_effort {
                    return AggregatedResponse::single_error(client_error);
                }

                errors.push(client_error);
                continue;
            }

            let Some(body) = resp.body else {
                continue;
            };

            match raw_json(&body) {
                Some(raw) => elements.push(raw),
                None => {
                    warn!(best_effort, "upstream body is not valid JSON");

                    if !best_effort {
                        return AggregatedResponse::single_error(CLIENT_ERR_UPSTREAM_MALFORMED);
                    }

                    errors.push(CLIENT_ERR_UPSTREAM_MALFORMED);
                }
            }
        }

        let successes = elements.len();

        let data = match serde_json::to_string(&elements)
            .ok()
            .and_then(|s| RawValue::from_string(s).ok())
        {
            Some(raw) => Some(raw),
            None => return AggregatedResponse::single_error(CLIENT_ERR_INTERNAL),
        };

        let errors = dedupe_errors(errors);
        let partial = !errors.is_empty() && successes > 0;

        let data = if !errors.is_empty() && !partial {
            None
        } else {
            data
        };

        AggregatedResponse {
            data,
            errors,
            partial,
        }
    }
}

/// Upstream-to-client error translation. The internal cause never leaves
/// this boundary.
fn map_upstream_error(err: &UpstreamError) -> ClientError {
    match err.kind {
        UpstreamErrorKind::Timeout
        | UpstreamErrorKind::Connection
        | UpstreamErrorKind::CircuitOpen => CLIENT_ERR_UPSTREAM_UNAVAILABLE,
        UpstreamErrorKind::BadStatus => CLIENT_ERR_UPSTREAM_ERROR,
        UpstreamErrorKind::BodyTooLarge => CLIENT_ERR_UPSTREAM_BODY_TOO_LARGE,
        UpstreamErrorKind::Canceled
        | UpstreamErrorKind::ReadError
        | UpstreamErrorKind::Internal => CLIENT_ERR_INTERNAL,
    }
}

/// Deduplicate while preserving first-occurrence order.
fn dedupe_errors(errors: Vec<ClientError>) -> Vec<ClientError> {
    let mut out: Vec<ClientError> = Vec::with_capacity(errors.len());

    for err in errors {
        if !out.contains(&err) {
            out.push(err);
        }
    }

    out
}

fn raw_json(body: &[u8]) -> Option<Box<RawValue>> {
    let text = std::str::from_utf8(body).ok()?;
    RawValue::from_string(text.to_string()).ok()
}
