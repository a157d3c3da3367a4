use chrono::{SecondsFormat, Utc};
use serde::{de, Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Instant;

use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub enum Status {
    Ok,
    Accepted,
    BadRequest,
    InternalServerError,
    ServiceUnavailable,
    GatewayTimeout,
}

impl Status {
    fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Accepted => 202,
            Status::BadRequest => 400,
            Status::InternalServerError => 500,
            Status::ServiceUnavailable => 503,
            Status::GatewayTimeout => 504,
        }
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u16(self.code())
    }
}

struct StatusCodeVisitor;

impl<'de> de::Visitor<'de> for StatusCodeVisitor {
    type Value = Status;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("Status")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            200 => Ok(Status::Ok),
            202 => Ok(Status::Accepted),
            400 => Ok(Status::BadRequest),
            500 => Ok(Status::InternalServerError),
            503 => Ok(Status::ServiceUnavailable),
            504 => Ok(Status::GatewayTimeout),
            value => Err(de::Error::custom(value.to_string())),
        }
    }
}

impl<'de> de::Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u16(StatusCodeVisitor)
    }
}

#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status_code: Status,
    pub headers: Value,
    pub body: Value,
}

/// RFC 3339 UTC timestamp used in every response body.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Success body shared by every mode: status, mode, timestamp, elapsed time
/// and the echoed request parameters, followed by the mode-specific fields.
pub fn success_body(mode: &str, threshold: f64, started: Instant, fields: Map<String, Value>) -> Value {
    let elapsed = (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
    let mut body = Map::new();
    body.insert("status".into(), json!("success"));
    body.insert("mode".into(), json!(mode));
    body.insert("timestamp".into(), json!(timestamp()));
    body.insert("processing_time_seconds".into(), json!(elapsed));
    body.insert("request".into(), json!({ "threshold": threshold }));
    body.extend(fields);
    Value::Object(body)
}

pub fn error_body(err: &ServiceError) -> Value {
    json!({
        "status": "error",
        "error": {
            "type": err.kind,
            "message": err.msg,
        },
        "timestamp": timestamp(),
    })
}

pub fn make_response_payload(
    result: Result<Value, ServiceError>,
) -> Result<Value, lambda_runtime::Error> {
    let headers = json!({
        "Content-Type": "application/json",
        "Access-Control-Allow-Origin": "*"
    });
    let response_payload = match result {
        Err(err) => ResponsePayload {
            body: error_body(&err),
            status_code: err.status,
            headers,
        },
        Ok(body) => ResponsePayload {
            status_code: Status::Ok,
            headers,
            body,
        },
    };
    serde_json::to_value(response_payload).map_err(lambda_runtime::Error::from)
}
