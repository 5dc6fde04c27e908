// Copyright 2024 - developers of the `matrigram` project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Matrix HTML to Telegram entity-list parsing.

use std::cell::Cell;

use grammers_tl_types as tl;
use html5ever::local_name as tag;
use html5ever::tendril::StrTendril;
use html5ever::tokenizer::{
    BufferQueue, Tag, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer,
};

use super::common::telegram_string_len;

const CODE_LANG_PREFIX: &str = "language-";
const MATRIX_TO_PREFIX: &str = "https://matrix.to/#/";
const MATRIX_URI_USER_PREFIX: &str = "matrix:u/";

/// Updates the length of the latest matching `MessageEntity` in a vector.
macro_rules! update_entity_len {
    ( $ty:ident($end_offset:expr) in $vector:expr ) => {
        let mut remove = false;
        let end_offset = $end_offset;
        let pos = $vector.iter_mut().rposition(|e| match e {
            tl::enums::MessageEntity::$ty(e) => {
                e.length = end_offset - e.offset;
                remove = e.length == 0;
                true
            }
            _ => false,
        });

        if remove {
            $vector.remove(pos.unwrap());
        }
    };
}

/// The Telegram-side rendering of one Matrix message body.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedMessage {
    pub text: String,
    pub entities: Vec<tl::enums::MessageEntity>,
}

/// What a Matrix user mention maps to on the Telegram side.
#[derive(Clone, Debug)]
pub enum MentionTarget {
    /// The ghost has a public username; the text becomes `@username`.
    Username(String),
    /// Addressed by id; the send path fills in the access hash.
    Name { user_id: i64 },
}

/// Lookups the parser needs from the caller.
#[derive(Default)]
pub struct ParserContext<'a> {
    /// Resolves a full Matrix user id from a mention anchor into the
    /// Telegram user it puppets, if any.
    pub resolve_mention: Option<&'a dyn Fn(&str) -> Option<MentionTarget>>,
    /// Resolves an `mxc://` URI from a `data-mx-emoticon` image into a
    /// known Telegram custom-emoji document.
    pub resolve_emoji: Option<&'a dyn Fn(&str) -> Option<i64>>,
}

enum Anchor {
    TextUrl { url: String, start_byte: usize },
    MentionName,
    Mention { username: String, start: i32 },
    Plain,
}

/// Extracts the Matrix user id out of a mention href, if it is one.
fn mention_user_id(href: &str) -> Option<String> {
    if let Some(rest) = href.strip_prefix(MATRIX_TO_PREFIX) {
        let decoded = rest.replace("%40", "@").replace("%3A", ":").replace("%3a", ":");
        decoded.starts_with('@').then(|| decoded)
    } else if let Some(rest) = href.strip_prefix(MATRIX_URI_USER_PREFIX) {
        Some(format!("@{rest}"))
    } else {
        None
    }
}

pub fn parse_matrix_html(message: &str, ctx: &ParserContext<'_>) -> ParsedMessage {
    struct Sink<'a> {
        ctx: &'a ParserContext<'a>,
        text: Cell<String>,
        entities: Cell<Vec<tl::enums::MessageEntity>>,
        offset: Cell<i32>,
        anchors: Cell<Vec<Anchor>>,
        suppress: Cell<u32>,
    }

    impl<'a> Sink<'a> {
        fn push_text(&self, text: &mut String, offset: &mut i32, what: &str) {
            text.push_str(what);
            *offset += telegram_string_len(what);
        }
    }

    impl<'a> TokenSink for Sink<'a> {
        type Handle = ();

        fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
            let mut text = self.text.take();
            let mut entities = self.entities.take();
            let mut anchors = self.anchors.take();
            let mut offset = self.offset.get();

            let length = 0;

            match token {
                Token::TagToken(Tag {
                    kind: TagKind::StartTag,
                    name,
                    self_closing: _,
                    attrs,
                }) => match name {
                    n if n == tag!("b") || n == tag!("strong") => {
                        entities.push(tl::types::MessageEntityBold { offset, length }.into());
                    }
                    n if n == tag!("i") || n == tag!("em") => {
                        entities.push(tl::types::MessageEntityItalic { offset, length }.into());
                    }
                    n if n == tag!("s") || n == tag!("del") || n == tag!("strike") => {
                        entities.push(tl::types::MessageEntityStrike { offset, length }.into());
                    }
                    tag!("u") => {
                        entities.push(tl::types::MessageEntityUnderline { offset, length }.into());
                    }
                    tag!("blockquote") => {
                        let collapsed = attrs.into_iter().any(|a| &a.name.local == "expandable");
                        entities.push(
                            tl::types::MessageEntityBlockquote {
                                offset,
                                length,
                                collapsed,
                            }
                            .into(),
                        );
                    }
                    tag!("span") | tag!("details") => {
                        // Matrix spells spoilers as `<span data-mx-spoiler>`.
                        if name == tag!("details")
                            || attrs.iter().any(|a| &a.name.local == "data-mx-spoiler")
                        {
                            entities
                                .push(tl::types::MessageEntitySpoiler { offset, length }.into());
                        }
                    }
                    tag!("code") => {
                        match entities.iter_mut().next_back() {
                            // An open `<pre>` right before means this is
                            // the `class="language-foo"` carrier.
                            Some(tl::enums::MessageEntity::Pre(e)) if e.length == 0 => {
                                e.language = attrs
                                    .into_iter()
                                    .find(|a| {
                                        a.name.local == tag!("class")
                                            && a.value.starts_with(CODE_LANG_PREFIX)
                                    })
                                    .map(|a| a.value[CODE_LANG_PREFIX.len()..].to_string())
                                    .unwrap_or_else(|| "".to_string());
                            }
                            _ => {
                                entities
                                    .push(tl::types::MessageEntityCode { offset, length }.into());
                            }
                        }
                    }
                    tag!("pre") => {
                        entities.push(
                            tl::types::MessageEntityPre {
                                offset,
                                length,
                                language: "".to_string(),
                            }
                            .into(),
                        );
                    }
                    tag!("br") => {
                        if self.suppress.get() == 0 {
                            self.push_text(&mut text, &mut offset, "\n");
                        }
                    }
                    tag!("img") => {
                        // Custom emojis arrive as `data-mx-emoticon` images.
                        let emoticon = attrs.iter().any(|a| &a.name.local == "data-mx-emoticon");
                        let src = attrs
                            .iter()
                            .find(|a| a.name.local == tag!("src"))
                            .map(|a| a.value.to_string());
                        let alt = attrs
                            .iter()
                            .find(|a| a.name.local == tag!("alt"))
                            .map(|a| a.value.to_string())
                            .unwrap_or_default();
                        if emoticon && !alt.is_empty() {
                            let document_id = src.as_deref().and_then(|src| {
                                self.ctx.resolve_emoji.and_then(|resolve| resolve(src))
                            });
                            let start = offset;
                            self.push_text(&mut text, &mut offset, &alt);
                            if let Some(document_id) = document_id {
                                entities.push(
                                    tl::types::MessageEntityCustomEmoji {
                                        offset: start,
                                        length: offset - start,
                                        document_id,
                                    }
                                    .into(),
                                );
                            }
                        }
                    }
                    tag!("a") => {
                        let url = attrs
                            .into_iter()
                            .find(|a| a.name.local == tag!("href"))
                            .map(|a| a.value.to_string())
                            .unwrap_or_else(|| "".to_string());

                        let target = mention_user_id(&url).and_then(|mxid| {
                            self.ctx.resolve_mention.and_then(|resolve| resolve(&mxid))
                        });
                        match target {
                            Some(MentionTarget::Username(username)) => {
                                // The visible name is replaced with the
                                // Telegram handle, so drop the inner text.
                                self.suppress.set(self.suppress.get() + 1);
                                anchors.push(Anchor::Mention {
                                    username,
                                    start: offset,
                                });
                            }
                            Some(MentionTarget::Name { user_id }) => {
                                entities.push(
                                    tl::types::MessageEntityMentionName {
                                        offset,
                                        length,
                                        user_id,
                                    }
                                    .into(),
                                );
                                anchors.push(Anchor::MentionName);
                            }
                            None if url.is_empty() => anchors.push(Anchor::Plain),
                            None => {
                                entities.push(
                                    tl::types::MessageEntityTextUrl {
                                        offset,
                                        length,
                                        url: url.clone(),
                                    }
                                    .into(),
                                );
                                anchors.push(Anchor::TextUrl {
                                    url,
                                    start_byte: text.len(),
                                });
                            }
                        }
                    }
                    _ => {}
                },
                Token::TagToken(Tag {
                    kind: TagKind::EndTag,
                    name,
                    self_closing: _,
                    attrs: _,
                }) => match name {
                    n if n == tag!("b") || n == tag!("strong") => {
                        update_entity_len!(Bold(offset) in entities);
                    }
                    n if n == tag!("i") || n == tag!("em") => {
                        update_entity_len!(Italic(offset) in entities);
                    }
                    n if n == tag!("s") || n == tag!("del") || n == tag!("strike") => {
                        update_entity_len!(Strike(offset) in entities);
                    }
                    tag!("u") => {
                        update_entity_len!(Underline(offset) in entities);
                    }
                    tag!("blockquote") => {
                        update_entity_len!(Blockquote(offset) in entities);
                    }
                    tag!("span") | tag!("details") => {
                        // Only close a spoiler that is actually open;
                        // plain spans must not touch earlier ones.
                        let open = entities.iter().rev().find_map(|e| match e {
                            tl::enums::MessageEntity::Spoiler(e) => Some(e.length == 0),
                            _ => None,
                        });
                        if open == Some(true) {
                            update_entity_len!(Spoiler(offset) in entities);
                        }
                    }
                    tag!("code") => {
                        match entities.iter_mut().next_back() {
                            Some(tl::enums::MessageEntity::Pre(e)) if e.length == 0 => {}
                            _ => {
                                update_entity_len!(Code(offset) in entities);
                            }
                        }
                    }
                    tag!("pre") => {
                        update_entity_len!(Pre(offset) in entities);
                    }
                    tag!("p") => {
                        if self.suppress.get() == 0 {
                            self.push_text(&mut text, &mut offset, "\n");
                        }
                    }
                    tag!("a") => match anchors.pop() {
                        Some(Anchor::TextUrl { url, start_byte }) => {
                            update_entity_len!(TextUrl(offset) in entities);
                            if text[start_byte..] == url {
                                // The body is the link itself; a plain
                                // URL entity matches what clients send.
                                let pos = entities.iter().rposition(|e| {
                                    matches!(e, tl::enums::MessageEntity::TextUrl(_))
                                });
                                if let Some(pos) = pos {
                                    if let tl::enums::MessageEntity::TextUrl(e) = &entities[pos] {
                                        entities[pos] = tl::types::MessageEntityUrl {
                                            offset: e.offset,
                                            length: e.length,
                                        }
                                        .into();
                                    }
                                }
                            }
                        }
                        Some(Anchor::MentionName) => {
                            update_entity_len!(MentionName(offset) in entities);
                        }
                        Some(Anchor::Mention { username, start }) => {
                            self.suppress.set(self.suppress.get().saturating_sub(1));
                            let handle = format!("@{username}");
                            self.push_text(&mut text, &mut offset, &handle);
                            entities.push(
                                tl::types::MessageEntityMention {
                                    offset: start,
                                    length: offset - start,
                                }
                                .into(),
                            );
                        }
                        _ => {}
                    },
                    _ => {}
                },
                Token::CharacterTokens(string) => {
                    if self.suppress.get() == 0 {
                        text.push_str(&string);
                        offset += telegram_string_len(&string);
                    }
                }
                _ => {}
            }

            self.text.replace(text);
            self.entities.replace(entities);
            self.anchors.replace(anchors);
            self.offset.replace(offset);

            TokenSinkResult::Continue
        }
    }

    let mut input = BufferQueue::default();
    input.push_back(StrTendril::from_slice(message).try_reinterpret().unwrap());

    let tok = Tokenizer::new(
        Sink {
            ctx,
            text: Cell::new(String::with_capacity(message.len())),
            entities: Cell::new(Vec::new()),
            offset: Cell::new(0),
            anchors: Cell::new(Vec::new()),
            suppress: Cell::new(0),
        },
        Default::default(),
    );
    let _ = tok.feed(&mut input);
    tok.end();

    let Sink { text, entities, .. } = tok.sink;
    let mut text = text.take();
    let mut entities = entities.take();

    // Paragraph handling can leave a dangling trailing newline.
    while text.ends_with('\n') {
        text.pop();
    }
    let text_len = telegram_string_len(&text);
    for entity in entities.iter_mut() {
        clamp_entity(entity, text_len);
    }

    ParsedMessage { text, entities }
}

fn clamp_entity(entity: &mut tl::enums::MessageEntity, text_len: i32) {
    use tl::enums::MessageEntity as ME;
    let (offset, length) = match entity {
        ME::Bold(e) => (&mut e.offset, &mut e.length),
        ME::Italic(e) => (&mut e.offset, &mut e.length),
        ME::Underline(e) => (&mut e.offset, &mut e.length),
        ME::Strike(e) => (&mut e.offset, &mut e.length),
        ME::Code(e) => (&mut e.offset, &mut e.length),
        ME::Pre(e) => (&mut e.offset, &mut e.length),
        ME::Blockquote(e) => (&mut e.offset, &mut e.length),
        ME::Spoiler(e) => (&mut e.offset, &mut e.length),
        ME::Url(e) => (&mut e.offset, &mut e.length),
        ME::TextUrl(e) => (&mut e.offset, &mut e.length),
        ME::Mention(e) => (&mut e.offset, &mut e.length),
        ME::MentionName(e) => (&mut e.offset, &mut e.length),
        ME::CustomEmoji(e) => (&mut e.offset, &mut e.length),
        _ => return,
    };
    if *offset + *length > text_len {
        *length = (text_len - *offset).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str) -> ParsedMessage {
        parse_matrix_html(html, &ParserContext::default())
    }

    #[test]
    fn parse_simple_formatting() {
        let parsed = parse("<strong>hi</strong> <a href=\"https://x\">y</a>");
        assert_eq!(parsed.text, "hi y");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityBold {
                    offset: 0,
                    length: 2
                }
                .into(),
                tl::types::MessageEntityTextUrl {
                    offset: 3,
                    length: 1,
                    url: "https://x".to_string()
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_plain_url() {
        let parsed = parse("see <a href=\"https://x\">https://x</a>");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityUrl {
                    offset: 4,
                    length: 9
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_spoiler_span() {
        let parsed = parse("a <span data-mx-spoiler>secret</span>!");
        assert_eq!(parsed.text, "a secret!");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntitySpoiler {
                    offset: 2,
                    length: 6
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_plain_span_is_not_a_spoiler() {
        let parsed = parse("a <span>plain</span>!");
        assert_eq!(parsed.text, "a plain!");
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn parse_pre_with_language() {
        let parsed = parse("<pre><code class=\"language-rust\">let x;</code></pre>");
        assert_eq!(parsed.text, "let x;");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityPre {
                    offset: 0,
                    length: 6,
                    language: "rust".to_string()
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_mention_with_username() {
        let resolve = |mxid: &str| {
            (mxid == "@_telegram_42:example.org")
                .then(|| MentionTarget::Username("somebody".to_string()))
        };
        let ctx = ParserContext {
            resolve_mention: Some(&resolve),
            resolve_emoji: None,
        };
        let parsed = parse_matrix_html(
            "hey <a href=\"https://matrix.to/#/@_telegram_42:example.org\">Some Body</a>",
            &ctx,
        );
        assert_eq!(parsed.text, "hey @somebody");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityMention {
                    offset: 4,
                    length: 9
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_mention_without_username() {
        let resolve = |_: &str| Some(MentionTarget::Name { user_id: 42 });
        let ctx = ParserContext {
            resolve_mention: Some(&resolve),
            resolve_emoji: None,
        };
        let parsed = parse_matrix_html(
            "hey <a href=\"https://matrix.to/#/@_telegram_42:example.org\">Some Body</a>",
            &ctx,
        );
        assert_eq!(parsed.text, "hey Some Body");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityMentionName {
                    offset: 4,
                    length: 9,
                    user_id: 42
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_custom_emoji_image() {
        let resolve = |src: &str| (src == "mxc://h/e").then_some(99i64);
        let ctx = ParserContext {
            resolve_mention: None,
            resolve_emoji: Some(&resolve),
        };
        let parsed = parse_matrix_html(
            "x <img data-mx-emoticon src=\"mxc://h/e\" alt=\"🦀\"> y",
            &ctx,
        );
        assert_eq!(parsed.text, "x 🦀 y");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityCustomEmoji {
                    offset: 2,
                    length: 2,
                    document_id: 99
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_line_breaks() {
        let parsed = parse("a<br>b<br/>c");
        assert_eq!(parsed.text, "a\nb\nc");
    }

    #[test]
    fn parse_nested_entities() {
        let parsed = parse("Some <b>bold <i>both</b> italics</i>");
        assert_eq!(parsed.text, "Some bold both italics");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityBold {
                    offset: 5,
                    length: 9
                }
                .into(),
                tl::types::MessageEntityItalic {
                    offset: 10,
                    length: 12
                }
                .into(),
            ]
        );
    }

    #[test]
    fn parse_emoji_offsets() {
        let parsed = parse("A <b>little 🦀</b> here");
        assert_eq!(parsed.text, "A little 🦀 here");
        assert_eq!(
            parsed.entities,
            vec![
                tl::types::MessageEntityBold {
                    offset: 2,
                    length: 9
                }
                .into(),
            ]
        );
    }
}
