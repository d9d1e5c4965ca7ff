//! Key expressions for the shared namespace.
//!
//! Keys are `/`-separated chunks. Patterns may use `*` for exactly one chunk
//! and `**` for any number of chunks (including zero).
//!
//! Layout under a namespace `ns`:
//! - `ns/presence/<identity>`: liveliness tokens
//! - `ns/heartbeat/<identity>`: heartbeat publications

const PRESENCE: &str = "presence";
const HEARTBEAT: &str = "heartbeat";

pub fn presence_key(namespace: &str, identity: &str) -> String {
    format!("{namespace}/{PRESENCE}/{identity}")
}

pub fn presence_pattern(namespace: &str) -> String {
    format!("{namespace}/{PRESENCE}/**")
}

pub fn heartbeat_key(namespace: &str, identity: &str) -> String {
    format!("{namespace}/{HEARTBEAT}/{identity}")
}

pub fn heartbeat_pattern(namespace: &str) -> String {
    format!("{namespace}/{HEARTBEAT}/**")
}

/// Identity of a presence key, if the key lives under our namespace.
pub fn presence_identity<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    identity_under(namespace, PRESENCE, key)
}

/// Identity of a heartbeat topic, if the topic lives under our namespace.
pub fn heartbeat_identity<'a>(namespace: &str, key: &'a str) -> Option<&'a str> {
    identity_under(namespace, HEARTBEAT, key)
}

fn identity_under<'a>(namespace: &str, segment: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(namespace)?.strip_prefix('/')?;
    let rest = rest.strip_prefix(segment)?.strip_prefix('/')?;
    trailing_segment(rest)
}

/// Last chunk of a key, or None if it is empty.
pub fn trailing_segment(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|s| !s.is_empty())
}

/// Check that an identity can be embedded as a single key chunk.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && !identity.contains('/')
        && !identity.contains('*')
        && !identity.contains('$')
}

/// Match a key against a pattern.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').collect();
    let key: Vec<&str> = key.split('/').collect();
    match_chunks(&pattern, &key)
}

fn match_chunks(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"**", rest)) => (0..=key.len()).any(|skip| match_chunks(rest, &key[skip..])),
        Some((&"*", rest)) => match key.split_first() {
            Some((chunk, key_rest)) => !chunk.is_empty() && match_chunks(rest, key_rest),
            None => false,
        },
        Some((literal, rest)) => match key.split_first() {
            Some((chunk, key_rest)) => chunk == literal && match_chunks(rest, key_rest),
            None => false,
        },
    }
}
