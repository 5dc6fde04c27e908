// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Telegram entity-list to Matrix HTML formatting.
//!
//! Entity ranges may overlap arbitrarily while HTML nesting may not, so
//! the entities are first arranged into a linked range tree: each node
//! holds its entity plus a first-child and next-sibling link, and any
//! range that partially overlaps an earlier one is split at the
//! boundary. Rendering is then a plain tree walk.

use grammers_tl_types as tl;

use super::common::{escape_attr, utf16_slice};

const MATRIX_TO_PREFIX: &str = "https://matrix.to/#/";
/// Colour used for entity kinds that have no Matrix equivalent.
const FALLBACK_COLOR: &str = "#3771bb";

/// Lookups the formatter needs from the caller.
#[derive(Default)]
pub struct EntityFormatContext<'a> {
    /// Matrix user id of the ghost behind a `@username` mention.
    pub mxid_for_username: Option<&'a dyn Fn(&str) -> Option<String>>,
    /// Matrix user id of the ghost behind a by-id mention.
    pub mxid_for_user_id: Option<&'a dyn Fn(i64) -> Option<String>>,
    /// `mxc://` URI of a custom emoji already bridged to Matrix.
    pub mxc_for_custom_emoji: Option<&'a dyn Fn(i64) -> Option<String>>,
}

struct Node {
    entity: Option<tl::enums::MessageEntity>,
    offset: i32,
    end: i32,
    child: Option<usize>,
    sibling: Option<usize>,
}

fn entity_range(entity: &tl::enums::MessageEntity) -> (i32, i32) {
    use tl::enums::MessageEntity as ME;
    match entity {
        ME::Unknown(e) => (e.offset, e.length),
        ME::Mention(e) => (e.offset, e.length),
        ME::Hashtag(e) => (e.offset, e.length),
        ME::BotCommand(e) => (e.offset, e.length),
        ME::Url(e) => (e.offset, e.length),
        ME::Email(e) => (e.offset, e.length),
        ME::Bold(e) => (e.offset, e.length),
        ME::Italic(e) => (e.offset, e.length),
        ME::Code(e) => (e.offset, e.length),
        ME::Pre(e) => (e.offset, e.length),
        ME::TextUrl(e) => (e.offset, e.length),
        ME::MentionName(e) => (e.offset, e.length),
        ME::InputMessageEntityMentionName(e) => (e.offset, e.length),
        ME::Phone(e) => (e.offset, e.length),
        ME::Cashtag(e) => (e.offset, e.length),
        ME::Underline(e) => (e.offset, e.length),
        ME::Strike(e) => (e.offset, e.length),
        ME::Blockquote(e) => (e.offset, e.length),
        ME::BankCard(e) => (e.offset, e.length),
        ME::Spoiler(e) => (e.offset, e.length),
        ME::CustomEmoji(e) => (e.offset, e.length),
    }
}

/// Inserts `[offset, end)` under `parent`, splitting at the boundary of
/// any partially-overlapped earlier range.
fn insert(
    nodes: &mut Vec<Node>,
    parent: usize,
    entity: &tl::enums::MessageEntity,
    mut offset: i32,
    end: i32,
) {
    let mut prev: Option<usize> = None;
    let mut cursor = nodes[parent].child;

    loop {
        match cursor {
            Some(current) => {
                let (c_off, c_end) = (nodes[current].offset, nodes[current].end);
                if end <= c_off {
                    let idx = nodes.len();
                    nodes.push(Node {
                        entity: Some(entity.clone()),
                        offset,
                        end,
                        child: None,
                        sibling: Some(current),
                    });
                    match prev {
                        Some(p) => nodes[p].sibling = Some(idx),
                        None => nodes[parent].child = Some(idx),
                    }
                    return;
                } else if offset >= c_end {
                    prev = Some(current);
                    cursor = nodes[current].sibling;
                } else if offset >= c_off && end <= c_end {
                    insert(nodes, current, entity, offset, end);
                    return;
                } else {
                    // Partial overlap; the piece inside the earlier
                    // range nests there, the rest continues right of it.
                    insert(nodes, current, entity, offset.max(c_off), c_end);
                    offset = c_end;
                    if offset >= end {
                        return;
                    }
                    prev = Some(current);
                    cursor = nodes[current].sibling;
                }
            }
            None => {
                let idx = nodes.len();
                nodes.push(Node {
                    entity: Some(entity.clone()),
                    offset,
                    end,
                    child: None,
                    sibling: None,
                });
                match prev {
                    Some(p) => nodes[p].sibling = Some(idx),
                    None => nodes[parent].child = Some(idx),
                }
                return;
            }
        }
    }
}

fn escape_text(text: &str, out: &mut String, preformatted: bool) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' if !preformatted => out.push_str("<br/>"),
            _ => out.push(c),
        }
    }
}

fn render(
    nodes: &[Node],
    units: &[u16],
    idx: usize,
    ctx: &EntityFormatContext<'_>,
    out: &mut String,
    preformatted: bool,
) {
    use tl::enums::MessageEntity as ME;

    let mut pos = nodes[idx].offset;
    let mut cursor = nodes[idx].child;

    while let Some(child) = cursor {
        let node = &nodes[child];
        escape_text(&utf16_slice(units, pos as usize, node.offset as usize), out, preformatted);

        let inner = utf16_slice(units, node.offset as usize, node.end as usize);
        let mut preformatted = preformatted;
        let mut skip_content = false;
        let close: Option<String> = match node.entity.as_ref().unwrap() {
            ME::Bold(_) => {
                out.push_str("<strong>");
                Some("</strong>".into())
            }
            ME::Italic(_) => {
                out.push_str("<em>");
                Some("</em>".into())
            }
            ME::Underline(_) => {
                out.push_str("<u>");
                Some("</u>".into())
            }
            ME::Strike(_) => {
                out.push_str("<del>");
                Some("</del>".into())
            }
            ME::Code(_) => {
                preformatted = true;
                out.push_str("<code>");
                Some("</code>".into())
            }
            ME::Pre(e) => {
                preformatted = true;
                if e.language.is_empty() {
                    out.push_str("<pre><code>");
                } else {
                    out.push_str("<pre><code class=\"language-");
                    escape_attr(&e.language, out);
                    out.push_str("\">");
                }
                Some("</code></pre>".into())
            }
            ME::Blockquote(_) => {
                out.push_str("<blockquote>");
                Some("</blockquote>".into())
            }
            ME::Spoiler(_) => {
                out.push_str("<span data-mx-spoiler>");
                Some("</span>".into())
            }
            ME::Url(_) => {
                out.push_str("<a href=\"");
                escape_attr(&inner, out);
                out.push_str("\">");
                Some("</a>".into())
            }
            ME::TextUrl(e) => {
                out.push_str("<a href=\"");
                escape_attr(&e.url, out);
                out.push_str("\">");
                Some("</a>".into())
            }
            ME::Email(_) => {
                out.push_str("<a href=\"mailto:");
                escape_attr(&inner, out);
                out.push_str("\">");
                Some("</a>".into())
            }
            ME::Phone(_) => {
                out.push_str("<a href=\"tel:");
                escape_attr(&inner, out);
                out.push_str("\">");
                Some("</a>".into())
            }
            ME::Mention(_) => {
                let mxid = ctx
                    .mxid_for_username
                    .and_then(|f| f(inner.trim_start_matches('@')));
                match mxid {
                    Some(mxid) => {
                        out.push_str("<a href=\"");
                        escape_attr(&format!("{MATRIX_TO_PREFIX}{mxid}"), out);
                        out.push_str("\">");
                        Some("</a>".into())
                    }
                    None => {
                        out.push_str("<font color=\"");
                        out.push_str(FALLBACK_COLOR);
                        out.push_str("\">");
                        Some("</font>".into())
                    }
                }
            }
            ME::MentionName(e) => {
                let mxid = ctx.mxid_for_user_id.and_then(|f| f(e.user_id));
                match mxid {
                    Some(mxid) => {
                        out.push_str("<a href=\"");
                        escape_attr(&format!("{MATRIX_TO_PREFIX}{mxid}"), out);
                        out.push_str("\">");
                        Some("</a>".into())
                    }
                    None => {
                        out.push_str("<font color=\"");
                        out.push_str(FALLBACK_COLOR);
                        out.push_str("\">");
                        Some("</font>".into())
                    }
                }
            }
            ME::CustomEmoji(e) => {
                match ctx.mxc_for_custom_emoji.and_then(|f| f(e.document_id)) {
                    Some(mxc) => {
                        out.push_str("<img data-mx-emoticon src=\"");
                        escape_attr(&mxc, out);
                        out.push_str("\" alt=\"");
                        escape_attr(&inner, out);
                        out.push_str("\" title=\"");
                        escape_attr(&inner, out);
                        out.push_str("\" height=\"32\"/>");
                        skip_content = true;
                        None
                    }
                    // No bridged file: keep the textual fallback.
                    None => None,
                }
            }
            ME::Hashtag(_) | ME::Cashtag(_) | ME::BotCommand(_) | ME::BankCard(_) => {
                out.push_str("<font color=\"");
                out.push_str(FALLBACK_COLOR);
                out.push_str("\">");
                Some("</font>".into())
            }
            ME::Unknown(_) | ME::InputMessageEntityMentionName(_) => None,
        };

        if !skip_content {
            render(nodes, units, child, ctx, out, preformatted);
        }
        if let Some(close) = close {
            out.push_str(&close);
        }

        pos = node.end;
        cursor = node.sibling;
    }

    escape_text(
        &utf16_slice(units, pos as usize, nodes[idx].end as usize),
        out,
        preformatted,
    );
}

/// Renders a Telegram message body with its entities as Matrix HTML.
pub fn generate_matrix_html(
    text: &str,
    entities: &[tl::enums::MessageEntity],
    ctx: &EntityFormatContext<'_>,
) -> String {
    let units: Vec<u16> = text.encode_utf16().collect();
    let total = units.len() as i32;

    let mut nodes = vec![Node {
        entity: None,
        offset: 0,
        end: total,
        child: None,
        sibling: None,
    }];

    let mut sorted: Vec<&tl::enums::MessageEntity> = entities.iter().collect();
    // Offset ascending, longest range first: parents before children.
    sorted.sort_by_key(|e| {
        let (offset, length) = entity_range(e);
        (offset, -length)
    });

    for entity in sorted {
        let (offset, length) = entity_range(entity);
        let offset = offset.max(0);
        let end = (offset + length).min(total);
        if end <= offset {
            continue;
        }
        insert(&mut nodes, 0, entity, offset, end);
    }

    let mut out = String::with_capacity(text.len() + entities.len() * 16);
    render(&nodes, &units, 0, ctx, &mut out, false);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(text: &str, entities: Vec<tl::enums::MessageEntity>) -> String {
        generate_matrix_html(text, &entities, &EntityFormatContext::default())
    }

    #[test]
    fn simple_formatting() {
        let out = html(
            "hi y",
            vec![
                tl::types::MessageEntityBold {
                    offset: 0,
                    length: 2,
                }
                .into(),
                tl::types::MessageEntityTextUrl {
                    offset: 3,
                    length: 1,
                    url: "https://x".to_string(),
                }
                .into(),
            ],
        );
        assert_eq!(out, "<strong>hi</strong> <a href=\"https://x\">y</a>");
    }

    #[test]
    fn href_is_escaped() {
        let out = html(
            "x",
            vec![
                tl::types::MessageEntityTextUrl {
                    offset: 0,
                    length: 1,
                    url: "https://x/\"><script>".to_string(),
                }
                .into(),
            ],
        );
        assert_eq!(
            out,
            "<a href=\"https://x/&quot;&gt;&lt;script&gt;\">x</a>"
        );
    }

    #[test]
    fn body_is_escaped() {
        assert_eq!(html("a <b> & c", vec![]), "a &lt;b&gt; &amp; c");
        assert_eq!(html("a\nb", vec![]), "a<br/>b");
    }

    #[test]
    fn overlapping_ranges_split() {
        // bold covers "bold both", italic covers "both italics".
        let out = html(
            "Some bold both italics",
            vec![
                tl::types::MessageEntityBold {
                    offset: 5,
                    length: 9,
                }
                .into(),
                tl::types::MessageEntityItalic {
                    offset: 10,
                    length: 12,
                }
                .into(),
            ],
        );
        assert_eq!(
            out,
            "Some <strong>bold <em>both</em></strong><em> italics</em>"
        );
    }

    #[test]
    fn nested_ranges() {
        let out = html(
            "click here now",
            vec![
                tl::types::MessageEntityTextUrl {
                    offset: 0,
                    length: 10,
                    url: "https://x".to_string(),
                }
                .into(),
                tl::types::MessageEntityBold {
                    offset: 6,
                    length: 4,
                }
                .into(),
            ],
        );
        assert_eq!(
            out,
            "<a href=\"https://x\">click <strong>here</strong></a> now"
        );
    }

    #[test]
    fn pre_with_language() {
        let out = html(
            "let x;\nuse y;",
            vec![
                tl::types::MessageEntityPre {
                    offset: 0,
                    length: 13,
                    language: "rust".to_string(),
                }
                .into(),
            ],
        );
        assert_eq!(
            out,
            "<pre><code class=\"language-rust\">let x;\nuse y;</code></pre>"
        );
    }

    #[test]
    fn spoiler_span() {
        let out = html(
            "secret",
            vec![
                tl::types::MessageEntitySpoiler {
                    offset: 0,
                    length: 6,
                }
                .into(),
            ],
        );
        assert_eq!(out, "<span data-mx-spoiler>secret</span>");
    }

    #[test]
    fn mention_with_resolver() {
        let resolve = |username: &str| {
            (username == "somebody").then(|| "@_tg_42:example.org".to_string())
        };
        let ctx = EntityFormatContext {
            mxid_for_username: Some(&resolve),
            ..Default::default()
        };
        let out = generate_matrix_html(
            "hi @somebody",
            &[
                tl::types::MessageEntityMention {
                    offset: 3,
                    length: 9,
                }
                .into(),
            ],
            &ctx,
        );
        assert_eq!(
            out,
            "hi <a href=\"https://matrix.to/#/@_tg_42:example.org\">@somebody</a>"
        );
    }

    #[test]
    fn mention_fallback_is_coloured() {
        let out = html(
            "#tag",
            vec![
                tl::types::MessageEntityHashtag {
                    offset: 0,
                    length: 4,
                }
                .into(),
            ],
        );
        assert_eq!(out, "<font color=\"#3771bb\">#tag</font>");
    }

    #[test]
    fn custom_emoji_image() {
        let resolve = |id: i64| (id == 7).then(|| "mxc://h/e".to_string());
        let ctx = EntityFormatContext {
            mxc_for_custom_emoji: Some(&resolve),
            ..Default::default()
        };
        let out = generate_matrix_html(
            "x 🦀",
            &[
                tl::types::MessageEntityCustomEmoji {
                    offset: 2,
                    length: 2,
                    document_id: 7,
                }
                .into(),
            ],
            &ctx,
        );
        assert_eq!(
            out,
            "x <img data-mx-emoticon src=\"mxc://h/e\" alt=\"🦀\" title=\"🦀\" height=\"32\"/>"
        );
        // Unknown documents keep the textual fallback.
        let out = generate_matrix_html(
            "x 🦀",
            &[
                tl::types::MessageEntityCustomEmoji {
                    offset: 2,
                    length: 2,
                    document_id: 8,
                }
                .into(),
            ],
            &ctx,
        );
        assert_eq!(out, "x 🦀");
    }

    #[test]
    fn astral_offsets() {
        // Offsets are UTF-16: the crab takes two units.
        let out = html(
            "🦀 ok",
            vec![
                tl::types::MessageEntityBold {
                    offset: 3,
                    length: 2,
                }
                .into(),
            ],
        );
        assert_eq!(out, "🦀 <strong>ok</strong>");
    }
}
