//! Outbound error-message hygiene.
//!
//! Applied to execution and transport failures before they leave the
//! process: absolute filesystem paths collapse to `[PATH]`, raw OS error
//! spellings become human text, and anything resembling a backtrace is
//! dropped. Pipeline rejections are constructed already-sanitized and skip
//! this pass (the known-hosts mismatch text deliberately names its file).

use std::sync::LazyLock;

use regex::Regex;

static UNC_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\\\\[^\s"']+"#).expect("static regex"));

static DRIVE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[A-Za-z]:[\\/][^\s"']*"#).expect("static regex"));

static UNIX_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s='`(\[])(/[\w.\-]+(?:/[\w.\-]+)+/?)").expect("static regex"));

static TRACE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|\d+:\s+0x[0-9a-f]+.*|.*panicked at.*)$").expect("static regex")
});

const OS_ERROR_SPELLINGS: &[(&str, &str)] = &[
    ("ENOENT", "File or directory not found"),
    ("EACCES", "Permission denied"),
    ("EPERM", "Permission denied"),
    ("ETIMEDOUT", "Operation timed out"),
    ("ECONNREFUSED", "Connection refused"),
    ("ECONNRESET", "Connection reset"),
    ("EHOSTUNREACH", "Host unreachable"),
    ("EPIPE", "Connection closed"),
];

/// Scrub a message destined for the caller.
pub fn sanitize_message(input: &str) -> String {
    let mut out = TRACE_LINE.replace_all(input, "").into_owned();

    out = UNC_PATH.replace_all(&out, "[PATH]").into_owned();
    out = DRIVE_PATH.replace_all(&out, "[PATH]").into_owned();
    out = UNIX_PATH.replace_all(&out, "$1[PATH]").into_owned();

    for (spelling, friendly) in OS_ERROR_SPELLINGS {
        if out.contains(spelling) {
            out = out.replace(spelling, friendly);
        }
    }

    // Collapse blank runs left by dropped trace lines.
    let cleaned: Vec<&str> = out.lines().filter(|line| !line.trim().is_empty()).collect();
    if cleaned.is_empty() {
        "An internal error occurred".to_string()
    } else {
        cleaned.join("\n")
    }
}

/// Friendly rendering of an I/O failure, never echoing raw OS spellings.
pub fn sanitize_io_error(err: &std::io::Error) -> String {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => "File or directory not found".to_string(),
        ErrorKind::PermissionDenied => "Permission denied".to_string(),
        ErrorKind::TimedOut => "Operation timed out".to_string(),
        ErrorKind::ConnectionRefused => "Connection refused".to_string(),
        ErrorKind::ConnectionReset => "Connection reset".to_string(),
        ErrorKind::WouldBlock => "Resource temporarily unavailable".to_string(),
        _ => sanitize_message(&err.to_string()),
    }
}
