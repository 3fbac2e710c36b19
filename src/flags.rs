//! Parsing and rewriting of the `MAKEFLAGS`-shaped flag string.
//!
//! These are pure functions over `&str`: no I/O, no platform gate, so they
//! can be unit tested exhaustively and reused by both [`crate::Client`] and
//! [`crate::Server`].

use crate::error::{Error, Result};
use std::os::raw::c_int;

const JOBSERVER_FDS_PREFIX: &str = "--jobserver-fds=";
const JOBSERVER_AUTH_PREFIX: &str = "--jobserver-auth=";

/// Returns `false` iff a short-form flag `n` (dry-run) or `q` (question)
/// appears as a standalone letter cluster, i.e. in the leading run of
/// characters (up to the first `-`) of a whitespace-delimited token that
/// does not itself start with `-`.
///
/// ```
/// use jobserver_core::flags::should_execute;
///
/// assert!(should_execute(""));
/// assert!(!should_execute("n"));
/// assert!(!should_execute("nq"));
/// assert!(should_execute("--quiant"));
/// assert!(!should_execute("--blah n"));
/// ```
pub fn should_execute(flags: &str) -> bool {
    !flags.split_whitespace().any(|token| {
        !token.starts_with('-')
            && token
                .split('-')
                .next()
                .unwrap_or(token)
                .contains(['n', 'q'])
    })
}

/// `true` iff `flags` mentions a jobserver at all (either spelling).
pub fn has_jobserver(flags: &str) -> bool {
    flags.contains("--jobserver")
}

/// Extracts the `(read_fd, write_fd)` pair out of the first
/// `--jobserver-fds=R,W` (or `--jobserver-auth=R,W`) occurrence.
///
/// Returns `Ok(None)` if no jobserver is advertised at all, and
/// `Err(Error::Config(_))` if one is advertised but malformed or names a
/// descriptor `<= 2` (stdio is reserved).
pub fn extract_fds(flags: &str) -> Result<Option<(c_int, c_int)>> {
    if !has_jobserver(flags) {
        return Ok(None);
    }

    let value = find_endpoint(flags).ok_or_else(|| {
        Error::Config(format!("--jobserver-fds/--jobserver-auth missing a value in {flags:?}"))
    })?;

    let (read, write) = value.split_once(',').ok_or_else(|| {
        Error::Config(format!("malformed jobserver endpoint {value:?} in {flags:?}"))
    })?;

    let read: c_int = read
        .parse()
        .map_err(|_| Error::Config(format!("non-numeric read fd {read:?} in {flags:?}")))?;
    let write: c_int = write
        .parse()
        .map_err(|_| Error::Config(format!("non-numeric write fd {write:?} in {flags:?}")))?;

    if read <= 2 || write <= 2 {
        return Err(Error::Config(format!(
            "jobserver fds must be > 2 (stdio reserved), got ({read}, {write})"
        )));
    }

    Ok(Some((read, write)))
}

/// Substitutes the first `--jobserver-fds=...`/`--jobserver-auth=...`
/// fragment with `new_endpoint` (a full `--jobserver-fds=R,W` or
/// `--jobserver-auth=R,W` string supplied by the caller). Idempotent:
/// replacing with the same endpoint twice yields the same string.
pub fn replace_jobserver(flags: &str, new_endpoint: &str) -> String {
    if !has_jobserver(flags) {
        return flags.to_string();
    }

    match find_endpoint_span(flags) {
        Some((start, end)) => {
            let mut out = String::with_capacity(flags.len() - (end - start) + new_endpoint.len());
            out.push_str(&flags[..start]);
            out.push_str(new_endpoint);
            out.push_str(&flags[end..]);
            out
        }
        None => flags.to_string(),
    }
}

fn find_endpoint(flags: &str) -> Option<&str> {
    find_endpoint_span(flags).map(|(start, end)| {
        let prefix_len = prefix_len_at(flags, start);
        &flags[start + prefix_len..end]
    })
}

fn prefix_len_at(flags: &str, start: usize) -> usize {
    if flags[start..].starts_with(JOBSERVER_AUTH_PREFIX) {
        JOBSERVER_AUTH_PREFIX.len()
    } else {
        JOBSERVER_FDS_PREFIX.len()
    }
}

/// Span (including the `--jobserver-{fds,auth}=` prefix) of the first
/// occurrence of either spelling, up to the next whitespace or end of
/// string.
fn find_endpoint_span(flags: &str) -> Option<(usize, usize)> {
    let start = [JOBSERVER_AUTH_PREFIX, JOBSERVER_FDS_PREFIX]
        .iter()
        .filter_map(|prefix| flags.find(prefix))
        .min()?;

    let end = flags[start..]
        .find(char::is_whitespace)
        .map(|offset| start + offset)
        .unwrap_or(flags.len());

    Some((start, end))
}
