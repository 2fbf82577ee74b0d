//! Conversion of JS values into transportable form.
//!
//! Anything `JSON.stringify` cannot represent (functions, symbols, circular
//! structures, BigInt) degrades to a string instead of failing the response.

use rquickjs::{CaughtError, Coerced, Ctx, Exception, Type, Value};

/// Drop the exception left pending by a failed conversion.
fn clear_pending_exception(ctx: &Ctx<'_>) {
    let _ = ctx.catch();
}

/// `JSON.stringify(value)`, or `None` if it throws or yields `undefined`.
fn stringify<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> Option<String> {
    match ctx.json_stringify(value.clone()) {
        Ok(Some(text)) => text.to_string().ok(),
        Ok(None) => None,
        Err(_) => {
            clear_pending_exception(ctx);
            None
        }
    }
}

fn type_label(value: &Value<'_>) -> &'static str {
    match value.type_of() {
        Type::Symbol => "symbol",
        Type::BigInt => "bigint",
        Type::Function => "function",
        Type::Array => "array",
        _ => "value",
    }
}

/// `String(value)`, with a marker if even that throws (e.g. symbols).
pub fn coerce_string<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.get::<Coerced<String>>() {
        Ok(Coerced(text)) => text,
        Err(_) => {
            clear_pending_exception(ctx);
            format!("[unserializable {}]", type_label(value))
        }
    }
}

/// Encode a returned value for the `result` field. `undefined` maps to
/// `None`; values JSON cannot carry become strings. Error objects would
/// stringify as `{}`, so they are rendered as `"Name: message"` instead.
pub fn to_transport<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Option<serde_json::Value> {
    if value.is_undefined() {
        return None;
    }
    let encoded = match value.type_of() {
        Type::BigInt | Type::Exception => None,
        _ => stringify(ctx, &value).and_then(|text| serde_json::from_str(&text).ok()),
    };
    Some(encoded.unwrap_or_else(|| serde_json::Value::String(coerce_string(ctx, &value))))
}

fn format_console_arg<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    match value.type_of() {
        Type::String => value
            .as_string()
            .and_then(|s| s.to_string().ok())
            .unwrap_or_default(),
        Type::Object | Type::Array => {
            stringify(ctx, value).unwrap_or_else(|| coerce_string(ctx, value))
        }
        _ => coerce_string(ctx, value),
    }
}

/// Render console arguments the way they appear in a log line.
pub fn format_console_args<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> String {
    args.iter()
        .map(|arg| format_console_arg(ctx, arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_exception(exception: &Exception<'_>) -> String {
    let name = exception
        .as_object()
        .get::<_, Coerced<String>>("name")
        .map(|Coerced(name)| name)
        .unwrap_or_else(|_| "Error".to_owned());
    match exception.message() {
        Some(message) if !message.is_empty() => format!("{name}: {message}"),
        _ => name,
    }
}

/// Stringify a caught error for the `error` field.
pub fn describe_caught<'js>(ctx: &Ctx<'js>, caught: CaughtError<'js>) -> String {
    match caught {
        CaughtError::Exception(exception) => describe_exception(&exception),
        CaughtError::Value(value) => coerce_string(ctx, &value),
        CaughtError::Error(err) => err.to_string(),
    }
}
