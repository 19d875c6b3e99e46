use std::collections::BTreeSet;

use crate::types::User;

/// User IDs of a roster as an unordered set.
pub fn roster_ids(users: &[User]) -> BTreeSet<String> {
    users.iter().map(|user| user.id.clone()).collect()
}

/// Whether two rosters hold the same members, ignoring order and duplicates.
pub fn same_roster(a: &[User], b: &[User]) -> bool {
    roster_ids(a) == roster_ids(b)
}

/// Comma-separated, case-insensitively sorted display labels.
pub fn display_name_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut names: Vec<&str> = names.into_iter().collect();
    names.sort_by_key(|name| name.to_lowercase());
    names.dedup();
    names.join(", ")
}

/// Normalize a reaction to a stable key shared across backends.
///
/// Strips emoji variation selectors and maps a few common shortcodes.
pub fn normalize_reaction_key(raw: &str) -> String {
    let trimmed: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != '\u{FE0F}' && *ch != '\u{FE0E}')
        .collect();

    match trimmed.to_ascii_lowercase().as_str() {
        ":+1:" | "+1" | ":thumbsup:" => "👍".to_owned(),
        ":-1:" | "-1" | ":thumbsdown:" => "👎".to_owned(),
        ":heart:" | "<3" => "❤".to_owned(),
        ":joy:" => "😂".to_owned(),
        ":tada:" => "🎉".to_owned(),
        _ => trimmed,
    }
}

/// Whether `body` mentions `name` as a whole word, ignoring case.
pub fn mentions_name(body: &str, name: &str) -> bool {
    let name = name.trim().to_lowercase();
    if name.is_empty() {
        return false;
    }
    let body = body.to_lowercase();
    let is_word = |ch: char| ch.is_alphanumeric() || ch == '_';

    body.match_indices(&name).any(|(start, _)| {
        let before = body[..start].chars().next_back();
        let after = body[start + name.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// Escape text for embedding into an HTML subset.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reduce an HTML fragment to plain text.
///
/// Line-breaking tags become newlines, every other tag is dropped, and the
/// common named/numeric entities are decoded.
pub fn plain_text_from_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('>') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + end]
            .trim_start_matches('/')
            .split(|ch: char| ch.is_whitespace() || ch == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if matches!(tag.as_str(), "br" | "p" | "div" | "li" | "tr")
            && !out.is_empty()
            && !out.ends_with('\n')
        {
            out.push('\n');
        }
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);

    decode_entities(out.trim())
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let decoded = after.find(';').filter(|end| *end <= 10).and_then(|end| {
            let entity = &after[..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" | "#39" => Some('\''),
                "nbsp" => Some(' '),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            }?;
            Some((ch, end))
        });

        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
