//! Mention token codec.
//!
//! The service carries mentions inline as `<@id|display name>` tokens.
//! Outbound text is expanded before posting: `@all` / `@present` and bare
//! member display names become tokens. Inbound tokens are stripped back to
//! readable names, noting whether the local user was addressed.

/// Pseudo-target addressing every member of a room.
pub const MENTION_ALL: &str = "all";
/// Pseudo-target addressing the members currently present.
pub const MENTION_PRESENT: &str = "present";

const ALL_TOKEN: &str = "<@all|All Members>";
const PRESENT_TOKEN: &str = "<@present|Present Members>";

/// Expands mention shorthand in outbound text into wire tokens.
///
/// `@all` and `@present` become their pseudo-target tokens; every bare
/// occurrence of a member display name becomes `<@id|name>`. `members`
/// maps display names to profile ids. Longer names are replaced first so
/// "Jane Doe" wins over a member named "Jane", and text already inside a
/// token is never replaced again. Text with no recognized shorthand passes
/// through unchanged.
#[must_use]
pub fn expand_mentions<'a, I>(text: &str, members: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = replace_outside_tokens(text, "@all", ALL_TOKEN);
    out = replace_outside_tokens(&out, "@present", PRESENT_TOKEN);

    let mut names: Vec<(&str, &str)> = members.into_iter().collect();
    names.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(b.0)));
    for (name, id) in names {
        if name.is_empty() {
            continue;
        }
        out = replace_outside_tokens(&out, name, &format!("<@{id}|{name}>"));
    }
    out
}

/// Replaces every occurrence of `needle` that does not sit inside an
/// already-formed mention token.
fn replace_outside_tokens(text: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        if rest.starts_with("<@")
            && let Some((_, _, consumed)) = parse_token(rest)
        {
            out.push_str(&rest[..consumed]);
            rest = &rest[consumed..];
            continue;
        }
        if rest.starts_with(needle) {
            out.push_str(replacement);
            rest = &rest[needle.len()..];
            continue;
        }
        let step = rest.chars().next().map_or(1, char::len_utf8);
        out.push_str(&rest[..step]);
        rest = &rest[step..];
    }
    out
}

/// Strips mention tokens from inbound text, returning the readable form and
/// whether the token list addressed `self_id` (directly, or via the `all` /
/// `present` pseudo-targets).
///
/// Malformed tokens pass through literally.
#[must_use]
pub fn strip_mentions(text: &str, self_id: &str) -> (String, bool) {
    let mut out = String::with_capacity(text.len());
    let mut mentioned = false;
    let mut rest = text;

    while let Some(start) = rest.find("<@") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match parse_token(tail) {
            Some((id, name, consumed)) => {
                out.push_str(name);
                if id == MENTION_ALL || id == MENTION_PRESENT || id == self_id {
                    mentioned = true;
                }
                rest = &tail[consumed..];
            }
            None => {
                out.push_str("<@");
                rest = &tail[2..];
            }
        }
    }
    out.push_str(rest);
    (out, mentioned)
}

/// Parses one `<@id|name>` token at the start of `s` (which must begin with
/// `<@`). Returns the id, the display name, and the byte length consumed.
fn parse_token(s: &str) -> Option<(&str, &str, usize)> {
    let body = &s[2..];
    let pipe = body.find('|')?;
    let id = &body[..pipe];
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return None;
    }
    let after_pipe = &body[pipe + 1..];
    let close = after_pipe.find('>')?;
    let name = &after_pipe[..close];
    if name.contains('<') {
        return None;
    }
    Some((id, name, 2 + pipe + 1 + close + 1))
}
