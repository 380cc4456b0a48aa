//! Child-process command construction.

use crate::{JobRequest, TenantId};

/// Flag carrying the tenant to every job script.
pub const ACCOUNT_FLAG: &str = "--account";

/// Build the full argument vector for a job:
/// `interpreter... script_ref --account <tenant> <extra args>`.
///
/// Extra arguments are `arg_string` split on whitespace with empty tokens
/// dropped, so runs of spaces collapse.
pub fn build_argv(
    interpreter: &[String],
    script_ref: &str,
    tenant_id: &TenantId,
    arg_string: Option<&str>,
) -> Vec<String> {
    let mut argv: Vec<String> = interpreter.to_vec();
    argv.push(script_ref.to_string());
    argv.push(ACCOUNT_FLAG.to_string());
    argv.push(tenant_id.to_string());
    argv.extend(split_args(arg_string));
    argv
}

/// Argument vector for a queued request.
pub fn argv_for(interpreter: &[String], request: &JobRequest) -> Vec<String> {
    build_argv(
        interpreter,
        &request.script_ref,
        &request.tenant_id,
        request.arg_string.as_deref(),
    )
}

/// Split an optional argument string into non-empty tokens.
pub fn split_args(arg_string: Option<&str>) -> Vec<String> {
    arg_string
        .map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Keep at most `max_bytes` of `text`, cutting on a char boundary.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
