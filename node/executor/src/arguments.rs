//! Conversion of raw and script-produced values into ABI-typed call arguments.

use crate::error::{ConversionError, ExecutorError, Result};
use ethers::{
    abi::{Abi, Function, ParamType, Token},
    types::{Address, I256, U256},
};
use serde_json::{Map, Value};
use std::str::FromStr;
use tracing::warn;

/// Line prefix some scripts use to print their result.
pub const PAYLOAD_PREFIX: &str = "Payload received:";

/// Look up `name` in a JSON ABI. `name` may be a bare function name or a
/// full signature such as `setValue(uint256)` to pick an overload.
pub fn resolve_function(abi_json: &str, name: &str) -> Result<Function> {
    if abi_json.trim().is_empty() {
        return Err(ExecutorError::Validation("job has no contract ABI".into()));
    }
    let abi: Abi = serde_json::from_str(abi_json)
        .map_err(|e| ExecutorError::Validation(format!("invalid contract ABI: {}", e)))?;

    let base = name.split('(').next().unwrap_or(name).trim();
    let candidates = abi
        .functions_by_name(base)
        .map_err(|_| ExecutorError::Validation(format!("function {} not found in ABI", base)))?;

    let selected = if name.contains('(') {
        let wanted: String = name.chars().filter(|c| !c.is_whitespace()).collect();
        candidates.iter().find(|f| signature(f) == wanted)
    } else {
        candidates.first()
    };

    selected
        .cloned()
        .ok_or_else(|| ExecutorError::Validation(format!("function {} not found in ABI", name)))
}

fn signature(function: &Function) -> String {
    let inputs: Vec<String> = function.inputs.iter().map(|p| p.kind.to_string()).collect();
    format!("{}({})", function.name, inputs.join(","))
}

/// Convert one value to `kind`. `index` is the parameter position, used in errors.
pub fn convert(index: usize, value: &Value, kind: &ParamType) -> Result<Token, ConversionError> {
    convert_value(value, kind).map_err(|reason| ConversionError {
        index,
        target: kind.to_string(),
        reason,
    })
}

fn convert_value(value: &Value, kind: &ParamType) -> std::result::Result<Token, String> {
    match kind {
        ParamType::Uint(bits) => to_uint(value, *bits).map(Token::Uint),
        ParamType::Int(bits) => to_int(value, *bits).map(|v| Token::Int(v.into_raw())),
        ParamType::Bool => to_bool(value).map(Token::Bool),
        ParamType::String => Ok(Token::String(to_text(value))),
        ParamType::Address => to_address(value).map(Token::Address),
        ParamType::Bytes => to_bytes(value).map(Token::Bytes),
        ParamType::FixedBytes(size) => {
            let bytes = to_bytes(value)?;
            if bytes.len() != *size {
                return Err(format!("expected {} bytes, got {}", size, bytes.len()));
            }
            Ok(Token::FixedBytes(bytes))
        }
        ParamType::Array(inner) => convert_items(&to_items(value)?, inner).map(Token::Array),
        ParamType::FixedArray(inner, len) => {
            let items = to_items(value)?;
            if items.len() != *len {
                return Err(format!("expected {} elements, got {}", len, items.len()));
            }
            convert_items(&items, inner).map(Token::FixedArray)
        }
        ParamType::Tuple(kinds) => {
            let items = to_items(value)?;
            if items.len() != kinds.len() {
                return Err(format!("expected {} tuple fields, got {}", kinds.len(), items.len()));
            }
            items
                .iter()
                .zip(kinds)
                .enumerate()
                .map(|(i, (item, kind))| {
                    convert_value(item, kind).map_err(|e| format!("field {}: {}", i, e))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Token::Tuple)
        }
    }
}

fn convert_items(items: &[Value], inner: &ParamType) -> std::result::Result<Vec<Token>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| convert_value(item, inner).map_err(|e| format!("element {}: {}", i, e)))
        .collect()
}

/// Arrays arrive either as JSON arrays or as strings holding one.
fn to_items(value: &Value) -> std::result::Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(text) => serde_json::from_str::<Vec<Value>>(text.trim())
            .map_err(|e| format!("expected a JSON array: {}", e)),
        other => Err(format!("expected an array, got {}", other)),
    }
}

// Largest integer an f64 holds exactly.
const MAX_SAFE_FLOAT: f64 = 9_007_199_254_740_992.0;

fn to_uint(value: &Value, bits: usize) -> std::result::Result<U256, String> {
    let parsed = match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                U256::from(v)
            } else if n.as_i64().is_some() {
                return Err(format!("{} is negative", n));
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() != 0.0 || f < 0.0 || f > MAX_SAFE_FLOAT {
                    return Err(format!("{} is not an exact unsigned integer", n));
                }
                U256::from(f as u64)
            }
        }
        Value::String(text) => parse_magnitude(text.trim())?,
        other => return Err(format!("expected an integer, got {}", other)),
    };

    if bits < 256 && parsed.bits() > bits {
        return Err(format!("{} does not fit in uint{}", parsed, bits));
    }
    Ok(parsed)
}

/// Decimal or `0x` hex digits, no sign.
fn parse_magnitude(text: &str) -> std::result::Result<U256, String> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex_digits) if !hex_digits.is_empty() => {
            U256::from_str_radix(hex_digits, 16).map_err(|e| e.to_string())
        }
        None if !text.is_empty() && text.chars().all(|c| c.is_ascii_digit()) => {
            U256::from_dec_str(text).map_err(|e| e.to_string())
        }
        _ => Err("not a number".to_string()),
    };
    parsed.map_err(|e| format!("cannot parse {:?} as integer: {}", text, e))
}

fn to_int(value: &Value, bits: usize) -> std::result::Result<I256, String> {
    let parsed = match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                I256::from(v)
            } else if let Some(v) = n.as_u64() {
                I256::from_raw(U256::from(v))
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if f.fract() != 0.0 || f.abs() > MAX_SAFE_FLOAT {
                    return Err(format!("{} is not an exact integer", n));
                }
                I256::from(f as i64)
            }
        }
        Value::String(text) => {
            let text = text.trim();
            let (negative, digits) = match text.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, text.strip_prefix('+').unwrap_or(text)),
            };
            let magnitude = parse_magnitude(digits)?;

            let limit = U256::one() << 255;
            if (negative && magnitude > limit) || (!negative && magnitude >= limit) {
                return Err(format!("{} does not fit in int256", text));
            }
            let unsigned = I256::from_raw(magnitude);
            if negative {
                // -2^255 wraps onto itself
                unsigned.overflowing_neg().0
            } else {
                unsigned
            }
        }
        other => return Err(format!("expected an integer, got {}", other)),
    };

    if bits < 256 {
        let limit = U256::one() << (bits - 1);
        let magnitude = parsed.unsigned_abs();
        let fits = if parsed.is_negative() {
            magnitude <= limit
        } else {
            magnitude < limit
        };
        if !fits {
            return Err(format!("{} does not fit in int{}", parsed, bits));
        }
    }
    Ok(parsed)
}

fn to_bool(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(format!("{:?} is not a boolean", other)),
        },
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(format!("{} is not a boolean", n)),
        },
        other => Err(format!("expected a boolean, got {}", other)),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn to_address(value: &Value) -> std::result::Result<Address, String> {
    let text = match value {
        Value::String(text) => text.trim(),
        other => return Err(format!("expected an address string, got {}", other)),
    };
    let digits = text.strip_prefix("0x").unwrap_or(text);
    if digits.len() != 40 {
        return Err(format!("{:?} is not a 20-byte hex address", text));
    }
    Address::from_str(digits).map_err(|e| format!("{:?} is not a valid address: {}", text, e))
}

fn to_bytes(value: &Value) -> std::result::Result<Vec<u8>, String> {
    match value {
        Value::String(text) => match text.strip_prefix("0x") {
            Some(hex_digits) => {
                hex::decode(hex_digits).map_err(|e| format!("invalid hex {:?}: {}", text, e))
            }
            None => Ok(text.as_bytes().to_vec()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .filter(|b| *b <= u8::MAX as u64)
                    .map(|b| b as u8)
                    .ok_or_else(|| format!("{} is not a byte", item))
            })
            .collect(),
        other => Err(format!("expected bytes, got {}", other)),
    }
}

/// Turn script stdout into argument data.
///
/// Tries the whole output as JSON, then the first `Payload received: <value>`
/// line (as JSON, else verbatim), and finally the raw output as one string.
pub fn parse_script_output(output: &str) -> Value {
    let trimmed = output.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }

    for line in trimmed.lines() {
        if let Some(pos) = line.find(PAYLOAD_PREFIX) {
            let payload = line[pos + PAYLOAD_PREFIX.len()..].trim();
            return serde_json::from_str(payload)
                .unwrap_or_else(|_| Value::String(payload.to_string()));
        }
    }

    Value::String(trimmed.to_string())
}

/// Map resolved argument data onto the inputs of `function`, in declared order.
pub fn process_arguments(function: &Function, value: &Value) -> Result<Vec<Token>> {
    let inputs = &function.inputs;
    match value {
        Value::Array(items) => {
            if items.len() < inputs.len() {
                return Err(ExecutorError::Arguments(format!(
                    "{} expects {} arguments, got {}",
                    function.name,
                    inputs.len(),
                    items.len()
                )));
            }
            if items.len() > inputs.len() {
                warn!(
                    function = %function.name,
                    expected = inputs.len(),
                    received = items.len(),
                    "Ignoring trailing arguments"
                );
            }
            inputs
                .iter()
                .zip(items)
                .enumerate()
                .map(|(i, (param, item))| {
                    convert(i, item, &param.kind).map_err(ExecutorError::from)
                })
                .collect()
        }
        Value::Object(map) => {
            if inputs.len() == 1 && lookup(map, &inputs[0].name).is_none() {
                return Ok(vec![convert(0, value, &inputs[0].kind)?]);
            }
            inputs
                .iter()
                .enumerate()
                .map(|(i, param)| -> Result<Token> {
                    let item = lookup(map, &param.name).ok_or_else(|| {
                        ExecutorError::Arguments(format!(
                            "missing argument {:?} for {}",
                            param.name, function.name
                        ))
                    })?;
                    Ok(convert(i, item, &param.kind)?)
                })
                .collect()
        }
        scalar => match inputs.len() {
            0 => Ok(Vec::new()),
            1 => Ok(vec![convert(0, scalar, &inputs[0].kind)?]),
            n => Err(ExecutorError::Arguments(format!(
                "{} expects {} arguments, got a single value",
                function.name, n
            ))),
        },
    }
}

/// Static arguments are stored as strings, one per input.
pub fn static_arguments(function: &Function, arguments: &[String]) -> Result<Vec<Token>> {
    let values: Vec<Value> = arguments.iter().cloned().map(Value::String).collect();
    process_arguments(function, &Value::Array(values))
}

fn lookup<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use ethers::abi::{decode, encode};
    use serde_json::json;

    const ABI: &str = r#"[
        {"type":"function","name":"setValue","stateMutability":"nonpayable",
         "inputs":[{"name":"value","type":"uint256"}],"outputs":[]},
        {"type":"function","name":"setValue","stateMutability":"nonpayable",
         "inputs":[{"name":"value","type":"uint256"},{"name":"note","type":"string"}],"outputs":[]},
        {"type":"function","name":"process","stateMutability":"nonpayable",
         "inputs":[{"name":"jobId","type":"uint256"},{"name":"taskId","type":"uint256"}],"outputs":[]}
    ]"#;

    #[test]
    fn resolves_functions_and_overloads() -> Result<()> {
        assert_eq!(resolve_function(ABI, "setValue")?.inputs.len(), 1);
        assert_eq!(resolve_function(ABI, "setValue(uint256, string)")?.inputs.len(), 2);
        assert!(matches!(
            resolve_function(ABI, "missing"),
            Err(ExecutorError::Validation(_))
        ));
        assert!(matches!(resolve_function("", "setValue"), Err(ExecutorError::Validation(_))));
        Ok(())
    }

    #[test]
    fn every_supported_type_survives_abi_encoding() -> Result<()> {
        let cases = vec![
            (json!("42"), ParamType::Uint(256)),
            (json!("0xff"), ParamType::Uint(8)),
            (json!(7), ParamType::Uint(32)),
            (json!("-128"), ParamType::Int(8)),
            (json!(-5), ParamType::Int(256)),
            (json!("true"), ParamType::Bool),
            (json!(false), ParamType::Bool),
            (json!("hello"), ParamType::String),
            (json!("0x00000000000000000000000000000000deadbeef"), ParamType::Address),
            (json!("0x0102"), ParamType::Bytes),
            (json!("raw"), ParamType::Bytes),
            (json!(format!("0x{}", "ab".repeat(32))), ParamType::FixedBytes(32)),
            (json!("[1, 2, 3]"), ParamType::Array(Box::new(ParamType::Uint(64)))),
            (
                json!([["0x01"], ["0x02", "0x03"]]),
                ParamType::Array(Box::new(ParamType::Array(Box::new(ParamType::Bytes)))),
            ),
            (json!([true, false]), ParamType::FixedArray(Box::new(ParamType::Bool), 2)),
            (json!(["1", "x"]), ParamType::Tuple(vec![ParamType::Uint(16), ParamType::String])),
        ];

        for (index, (value, kind)) in cases.into_iter().enumerate() {
            let token = convert(index, &value, &kind)?;
            let encoded = encode(&[token.clone()]);
            let decoded = decode(&[kind.clone()], &encoded)?;
            assert_eq!(decoded, vec![token], "type {}", kind);
        }
        Ok(())
    }

    #[test]
    fn converted_values_are_exact() -> Result<()> {
        assert_eq!(
            convert(0, &json!("115792089237316195423570985008687907853269984665640564039457584007913129639935"), &ParamType::Uint(256))?,
            Token::Uint(U256::MAX)
        );
        assert_eq!(
            convert(0, &json!("-1"), &ParamType::Int(256))?,
            Token::Int(U256::MAX)
        );
        assert_eq!(
            convert(0, &json!("0x00000000000000000000000000000000DeaDBeef"), &ParamType::Address)?,
            Token::Address(Address::from_low_u64_be(0xdeadbeef))
        );
        assert_eq!(convert(0, &json!("raw"), &ParamType::Bytes)?, Token::Bytes(b"raw".to_vec()));
        Ok(())
    }

    #[test]
    fn never_truncates_or_pads() {
        let overflow = convert(3, &json!("256"), &ParamType::Uint(8)).unwrap_err();
        assert_eq!(overflow.index, 3);
        assert_eq!(overflow.target, "uint8");

        assert!(convert(0, &json!("128"), &ParamType::Int(8)).is_err());
        assert!(convert(0, &json!("-129"), &ParamType::Int(8)).is_err());
        assert!(convert(0, &json!("-1"), &ParamType::Uint(256)).is_err());
        assert!(convert(0, &json!(1.5), &ParamType::Uint(256)).is_err());
        assert!(convert(0, &json!("12abc"), &ParamType::Uint(256)).is_err());
        assert!(convert(0, &json!("0x0102"), &ParamType::FixedBytes(32)).is_err());
        assert!(convert(0, &json!("0xzz"), &ParamType::Bytes).is_err());
        assert!(convert(0, &json!("0x1234"), &ParamType::Address).is_err());
        assert!(convert(0, &json!("maybe"), &ParamType::Bool).is_err());
        assert!(convert(0, &json!([1]), &ParamType::FixedArray(Box::new(ParamType::Bool), 2)).is_err());
    }

    #[test]
    fn numeric_booleans_are_zero_or_one() -> Result<()> {
        assert_eq!(convert(0, &json!(1), &ParamType::Bool)?, Token::Bool(true));
        assert_eq!(convert(0, &json!(0), &ParamType::Bool)?, Token::Bool(false));
        for value in [json!(2), json!(-1), json!(0.5), json!(1.0)] {
            let err = convert(4, &value, &ParamType::Bool).unwrap_err();
            assert_eq!(err.index, 4);
            assert_eq!(err.target, "bool");
        }
        Ok(())
    }

    #[test]
    fn array_errors_name_the_element() {
        let err = convert(
            1,
            &json!(["1", "oops"]),
            &ParamType::Array(Box::new(ParamType::Uint(256))),
        )
        .unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.target, "uint256[]");
        assert!(err.reason.starts_with("element 1"));
    }

    #[test]
    fn script_output_parsing_order() {
        assert_eq!(parse_script_output(" {\"a\": 1} \n"), json!({"a": 1}));
        assert_eq!(
            parse_script_output("fetching price\nPayload received: [\"7\"]\ndone"),
            json!(["7"])
        );
        assert_eq!(
            parse_script_output("log line\nPayload received: not json"),
            json!("not json")
        );
        assert_eq!(parse_script_output("  12345  "), json!(12345));
        assert_eq!(parse_script_output("plain text"), json!("plain text"));
    }

    #[test]
    fn named_arguments_follow_declared_order() -> Result<()> {
        let function = resolve_function(ABI, "process")?;
        let tokens = process_arguments(&function, &json!({"taskId": "5", "JOBID": "2"}))?;
        assert_eq!(tokens, vec![Token::Uint(U256::from(2)), Token::Uint(U256::from(5))]);

        assert!(matches!(
            process_arguments(&function, &json!({"taskId": "5"})),
            Err(ExecutorError::Arguments(_))
        ));
        Ok(())
    }

    #[test]
    fn positional_and_scalar_arguments() -> Result<()> {
        let function = resolve_function(ABI, "process")?;
        let tokens = process_arguments(&function, &json!(["2", 5, "extra", "more"]))?;
        assert_eq!(tokens, vec![Token::Uint(U256::from(2)), Token::Uint(U256::from(5))]);
        assert!(process_arguments(&function, &json!(["2"])).is_err());
        assert!(process_arguments(&function, &json!("2")).is_err());

        let single = resolve_function(ABI, "setValue")?;
        assert_eq!(
            process_arguments(&single, &json!("42"))?,
            vec![Token::Uint(U256::from(42))]
        );
        assert_eq!(
            static_arguments(&single, &["42".to_string()])?,
            vec![Token::Uint(U256::from(42))]
        );
        Ok(())
    }

    #[test]
    fn conversion_failures_surface_as_typed_errors() -> Result<()> {
        let single = resolve_function(ABI, "setValue")?;
        match static_arguments(&single, &["forty-two".to_string()]) {
            Err(ExecutorError::Conversion(err)) => {
                assert_eq!(err.index, 0);
                assert_eq!(err.target, "uint256");
            }
            other => panic!("expected conversion error, got {:?}", other),
        }
        Ok(())
    }
}
