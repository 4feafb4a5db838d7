//! Result-shape validation for both schema versions.

use serde_json::Value;
use tiny_keccak::{Hasher, Keccak};

use crate::error::{Result, RuntimeError};
use crate::types::{CallData, CallDataPayload, Web3FunctionResult};

/// Result schema a script was built against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemaVersion {
    /// `callData` is a single hex string.
    V1,
    /// `callData` is an array of `{to, data, value?}`.
    V2,
}

impl SchemaVersion {
    /// Major version 2 and above use the multi-call shape.
    pub fn from_version(version: &str) -> Result<Self> {
        let major = version
            .trim()
            .trim_start_matches('v')
            .split('.')
            .next()
            .and_then(|major| major.parse::<u64>().ok())
            .ok_or_else(|| RuntimeError::Validation(format!("invalid version '{version}'")))?;
        Ok(if major >= 2 {
            SchemaVersion::V2
        } else {
            SchemaVersion::V1
        })
    }
}

fn shape_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::ResultShape(message.into())
}

/// Check a raw script result and convert it into a [`Web3FunctionResult`].
pub fn validate_result(version: SchemaVersion, value: &Value) -> Result<Web3FunctionResult> {
    let object = value
        .as_object()
        .ok_or_else(|| shape_error("Web3Function must return {canExec: bool}"))?;
    let can_exec = object
        .get("canExec")
        .and_then(Value::as_bool)
        .ok_or_else(|| shape_error("Web3Function must return {canExec: bool}"))?;

    if !can_exec {
        let message = match object.get("message") {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(_) => return Err(shape_error("Web3Function message must be a string")),
        };
        return Ok(Web3FunctionResult::CannotExec { message });
    }

    let call_data = object
        .get("callData")
        .ok_or_else(|| shape_error("Web3Function must return callData when canExec is true"))?;

    let call_data = match version {
        SchemaVersion::V1 => {
            let data = call_data
                .as_str()
                .ok_or_else(|| shape_error("Web3Function callData must be a hex string"))?;
            if !is_hex_data(data) {
                return Err(shape_error(format!(
                    "Web3Function returned invalid callData: {data}"
                )));
            }
            CallDataPayload::Legacy(data.to_string())
        }
        SchemaVersion::V2 => {
            let entries = call_data
                .as_array()
                .ok_or_else(|| shape_error("Web3Function callData must be an array"))?;
            if entries.is_empty() {
                return Err(shape_error(
                    "Web3Function callData must contain at least one call",
                ));
            }
            let calls = entries
                .iter()
                .enumerate()
                .map(|(index, entry)| validate_call(index, entry))
                .collect::<Result<Vec<_>>>()?;
            CallDataPayload::Calls(calls)
        }
    };

    Ok(Web3FunctionResult::CanExec { call_data })
}

fn validate_call(index: usize, entry: &Value) -> Result<CallData> {
    let entry = entry
        .as_object()
        .ok_or_else(|| shape_error(format!("Web3Function callData[{index}] must be an object")))?;

    let to = entry.get("to").and_then(Value::as_str).unwrap_or_default();
    if !is_valid_address(to) {
        return Err(shape_error(format!(
            "Web3Function returned invalid to address in callData[{index}]: '{to}'"
        )));
    }

    let data = entry.get("data").and_then(Value::as_str).unwrap_or_default();
    if !is_hex_data(data) {
        return Err(shape_error(format!(
            "Web3Function returned invalid data in callData[{index}]: '{data}'"
        )));
    }

    let value = match entry.get("value") {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) if is_decimal(value) => Some(value.clone()),
        Some(other) => {
            return Err(shape_error(format!(
                "Web3Function returned invalid value in callData[{index}]: {other} \
                 (must be a numeric string)"
            )));
        }
    };

    Ok(CallData {
        to: to.to_string(),
        data: data.to_string(),
        value,
    })
}

/// `0x` followed by 40 hex digits. Mixed-case addresses must carry a valid
/// EIP-55 checksum.
pub fn is_valid_address(address: &str) -> bool {
    let Some(hex) = address.strip_prefix("0x") else {
        return false;
    };
    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return false;
    }
    let has_lower = hex.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = hex.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return has_valid_checksum(hex);
    }
    true
}

fn has_valid_checksum(hex: &str) -> bool {
    let lower = hex.to_ascii_lowercase();
    let mut hasher = Keccak::v256();
    hasher.update(lower.as_bytes());
    let mut hash = [0u8; 32];
    hasher.finalize(&mut hash);

    hex.chars().enumerate().all(|(i, c)| {
        if !c.is_ascii_alphabetic() {
            return true;
        }
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        c.is_ascii_uppercase() == (nibble >= 8)
    })
}

/// Non-empty `0x`-prefixed hex.
pub fn is_hex_data(data: &str) -> bool {
    match data.strip_prefix("0x") {
        Some(hex) => !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

fn is_decimal(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CHECKSUMMED: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    #[test]
    fn version_parsing() {
        assert_eq!(SchemaVersion::from_version("2.0.0").unwrap(), SchemaVersion::V2);
        assert_eq!(SchemaVersion::from_version("3.1").unwrap(), SchemaVersion::V2);
        assert_eq!(SchemaVersion::from_version("1.0.0").unwrap(), SchemaVersion::V1);
        assert!(SchemaVersion::from_version("latest").is_err());
    }

    #[test]
    fn cannot_exec_with_message() {
        let result =
            validate_result(SchemaVersion::V2, &json!({ "canExec": false, "message": "Simple" }))
                .unwrap();
        assert_eq!(
            result,
            Web3FunctionResult::CannotExec {
                message: Some("Simple".into())
            }
        );
    }

    #[test]
    fn missing_can_exec_is_rejected() {
        let values = [
            json!(null),
            json!("yes"),
            json!({ "message": "x" }),
            json!({ "canExec": "true" }),
        ];
        for value in values {
            let err = validate_result(SchemaVersion::V2, &value).unwrap_err();
            assert!(matches!(err, RuntimeError::ResultShape(_)), "{value}");
        }
    }

    #[test]
    fn invalid_to_address_is_rejected() {
        let err = validate_result(
            SchemaVersion::V2,
            &json!({ "canExec": true, "callData": [{ "to": "address", "data": "0x0" }] }),
        )
        .unwrap_err();
        assert!(err.message().contains("invalid to address"));
    }

    #[test]
    fn v2_calls_are_validated() {
        let ok = validate_result(
            SchemaVersion::V2,
            &json!({ "canExec": true, "callData": [
                { "to": CHECKSUMMED, "data": "0xa9059cbb", "value": "1000" },
                { "to": CHECKSUMMED.to_lowercase(), "data": "0x00" }
            ]}),
        )
        .unwrap();
        assert!(ok.can_exec());

        let bad_value = validate_result(
            SchemaVersion::V2,
            &json!({
                "canExec": true,
                "callData": [{ "to": CHECKSUMMED, "data": "0x00", "value": "1e18" }]
            }),
        );
        assert!(bad_value.is_err());

        let empty_data = validate_result(
            SchemaVersion::V2,
            &json!({ "canExec": true, "callData": [{ "to": CHECKSUMMED, "data": "0x" }] }),
        );
        assert!(empty_data.is_err());

        let empty_calls =
            validate_result(SchemaVersion::V2, &json!({ "canExec": true, "callData": [] }));
        assert!(empty_calls.is_err());
    }

    #[test]
    fn v1_expects_single_hex_string() {
        let v1 = json!({ "canExec": true, "callData": "0xdeadbeef" });
        let ok = validate_result(SchemaVersion::V1, &v1).unwrap();
        assert_eq!(
            ok,
            Web3FunctionResult::CanExec {
                call_data: CallDataPayload::Legacy("0xdeadbeef".into())
            }
        );
        assert!(
            validate_result(
                SchemaVersion::V1,
                &json!({ "canExec": true, "callData": [{ "to": CHECKSUMMED, "data": "0x00" }] })
            )
            .is_err()
        );
    }

    #[test]
    fn checksum_is_enforced_for_mixed_case() {
        assert!(is_valid_address(CHECKSUMMED));
        assert!(is_valid_address(&CHECKSUMMED.to_lowercase()));
        assert!(is_valid_address(&format!("0x{}", CHECKSUMMED[2..].to_uppercase())));
        // Flip the case of one letter.
        let broken = CHECKSUMMED.replacen("aA", "Aa", 1);
        assert!(!is_valid_address(&broken));
        assert!(!is_valid_address("0x1234"));
    }
}
