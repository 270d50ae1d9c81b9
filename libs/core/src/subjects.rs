//! NATS subject helpers (multi-tenant/topic-safe)

use std::borrow::Cow;

/// Default prefix for activity subjects published by the gateway.
pub const ACTIVITY_SUBJECT_PREFIX: &str = "greentic.bot.activity";

/// Normalizes identifiers to be subject-safe (replace separators and wildcards, trim).
fn norm<S: AsRef<str>>(s: S) -> Cow<'static, str> {
    let mut t = s
        .as_ref()
        .trim()
        .replace([' ', '\t', '\n', '\r', '*', '>', '/', '.'], "-");
    if t.is_empty() {
        t = "unknown".into();
    }
    Cow::Owned(t)
}

/// Subject an activity event is published on.
///
/// ```
/// use gsm_core::activity_subject;
///
/// assert_eq!(
///     activity_subject("greentic.bot.activity", "acme", "msteams", "19:abc@thread.v2"),
///     "greentic.bot.activity.acme.msteams.19:abc@thread-v2"
/// );
/// ```
pub fn activity_subject(prefix: &str, tenant: &str, channel: &str, conversation: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        prefix.trim_end_matches('.'),
        norm(tenant),
        norm(channel),
        norm(conversation)
    )
}

/// Wildcard covering every activity subject under `prefix`, used for stream topology.
///
/// ```
/// use gsm_core::activity_stream_subject;
///
/// assert_eq!(activity_stream_subject("greentic.bot.activity"), "greentic.bot.activity.>");
/// ```
pub fn activity_stream_subject(prefix: &str) -> String {
    format!("{}.>", prefix.trim_end_matches('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_segments_become_unknown() {
        assert_eq!(
            activity_subject(ACTIVITY_SUBJECT_PREFIX, " ", "", "c"),
            "greentic.bot.activity.unknown.unknown.c"
        );
    }

    #[test]
    fn wildcards_cannot_escape_their_segment() {
        let subject = activity_subject("p", "a.b", "*", "x>y");
        assert_eq!(subject, "p.a-b.-.x-y");
    }
}
