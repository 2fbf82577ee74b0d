//! Line-level source instrumentation.
//!
//! Every eligible line gets a trace call prepended on the same line, so line
//! numbers in the rewritten source still match the submitted source. This is
//! a line heuristic, not a parser: a statement spanning several lines is only
//! traced at its first line, `/* ... */` blocks are not recognized, and lines
//! such as `} else {` or object-literal members are traced even though the
//! result may not compile. Such failures surface as ordinary syntax errors.

/// Name of the trace function parameter the evaluator binds.
pub const TRACE_FN: &str = "__jsbox_trace";

/// Whether a line gets a trace call.
fn is_eligible(trimmed: &str) -> bool {
    !(trimmed.is_empty() || trimmed.starts_with("//") || is_closing_only(trimmed))
}

/// `}`, `);`, `];`, `});` and similar: closing tokens with at most one
/// trailing `;` or `,`.
fn is_closing_only(trimmed: &str) -> bool {
    let body = trimmed
        .strip_suffix(';')
        .or_else(|| trimmed.strip_suffix(','))
        .unwrap_or(trimmed);
    !body.is_empty() && body.chars().all(|c| matches!(c, '}' | ')' | ']'))
}

/// A JS string literal for `text`. JSON string syntax is valid JS.
fn js_string_literal(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}

/// Rewrite `source`, prepending a trace call to every eligible line.
pub fn instrument(source: &str) -> String {
    let mut out = String::with_capacity(source.len() * 2);
    for (idx, line) in source.lines().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let trimmed = line.trim();
        if is_eligible(trimmed) {
            out.push_str(TRACE_FN);
            out.push('(');
            out.push_str(&(idx + 1).to_string());
            out.push_str(", ");
            out.push_str(&js_string_literal(trimmed));
            out.push_str("); ");
        }
        out.push_str(line);
    }
    out
}

/// 1-indexed numbers of the lines [`instrument`] would trace.
pub fn eligible_lines(source: &str) -> Vec<u32> {
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| is_eligible(line.trim()))
        .map(|(idx, _)| idx as u32 + 1)
        .collect()
}
