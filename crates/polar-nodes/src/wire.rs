//! Helpers for picking daemon JSON apart.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use polar_core::{Error, Result};
use serde_json::Value;

/// Translate a daemon error payload into [`Error::Protocol`].
///
/// Daemons report failures as a `code`/`message` pair (lightningd, LDK and
/// the grpc-gateway in front of LND) or as a bare `error` string (eclair).
/// A non-2xx status without either shape is still a protocol failure.
pub fn daemon_error(status: u16, body: &Value) -> Option<Error> {
    let message = body.get("message").and_then(Value::as_str).unwrap_or("");
    let code = body.get("code").filter(|code| !is_zero_or_null(code));
    if let (Some(code), false) = (code, message.is_empty()) {
        let code = code
            .as_str()
            .map_or_else(|| code.to_string(), ToString::to_string);
        return Some(Error::protocol(code, message));
    }

    match body.get("error") {
        Some(Value::String(error)) => return Some(Error::protocol(status, error)),
        // grpc-gateway wraps failures of streaming calls in an object.
        Some(nested @ Value::Object(_)) => {
            if let Some(error) = daemon_error(status, nested) {
                return Some(error);
            }
        }
        _ => {}
    }

    if !(200..300).contains(&status) {
        let message = match body {
            Value::String(text) => text.clone(),
            Value::Null => "empty response".to_string(),
            other => other.to_string(),
        };
        return Some(Error::protocol(status, message));
    }

    None
}

fn is_zero_or_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s.is_empty() || s == "0",
        _ => false,
    }
}

/// A non-empty string at `pointer`, or a shape error naming `what`.
pub fn required_str(body: &Value, pointer: &str, what: &str) -> Result<String> {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| Error::ResponseShape(format!("no {what} in response: {body}")))
}

/// A string at `pointer`, empty when absent.
pub fn str_or_empty(body: &Value, pointer: &str) -> String {
    body.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// An amount encoded as a JSON number or a numeric string.
///
/// LND encodes 64-bit integers as strings, lightningd and LDK as numbers.
pub fn amount(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// The amount at `pointer`, zero when absent or unreadable.
pub fn amount_at(body: &Value, pointer: &str) -> u64 {
    body.pointer(pointer).and_then(amount).unwrap_or(0)
}

/// A small counter at `pointer`, zero when absent.
pub fn count_at(body: &Value, pointer: &str) -> u32 {
    u32::try_from(amount_at(body, pointer)).unwrap_or(u32::MAX)
}

/// A required amount at `pointer`.
pub fn required_amount(body: &Value, pointer: &str, what: &str) -> Result<u64> {
    body.pointer(pointer)
        .and_then(amount)
        .ok_or_else(|| Error::ResponseShape(format!("no {what} in response: {body}")))
}

/// Millisatoshis to whole satoshis, rounding down.
pub const fn msat_to_sat(msat: u64) -> u64 {
    msat / 1000
}

/// Hex string to the base64 form LND REST expects for `bytes` fields.
pub fn hex_to_base64(hex_str: &str) -> Result<String> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::InvalidInput(format!("'{hex_str}' is not hex: {e}")))?;
    Ok(STANDARD.encode(bytes))
}

/// Base64 `bytes` field from LND REST to hex.
pub fn base64_to_hex(b64: &str) -> Result<String> {
    STANDARD
        .decode(b64)
        .map(hex::encode)
        .map_err(|e| Error::ResponseShape(format!("'{b64}' is not base64: {e}")))
}

/// LND reports txids as little-endian bytes; txids are displayed reversed.
pub fn base64_txid_to_hex(b64: &str) -> Result<String> {
    let mut bytes = STANDARD
        .decode(b64)
        .map_err(|e| Error::ResponseShape(format!("'{b64}' is not base64: {e}")))?;
    bytes.reverse();
    Ok(hex::encode(bytes))
}
