//! Assistant message parsing
//!
//! The model invokes tools with XML-style tags:
//!
//! ```text
//! Let me look at that file.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! The whole buffer is parsed again every time a chunk arrives. Growing the
//! buffer never yields fewer blocks, and only the last block can be partial.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use strand_ai::ContentBlock;

struct Tag {
    name: String,
    open: String,
    close: String,
}

impl Tag {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open: format!("<{name}>"),
            close: format!("</{name}>"),
        }
    }
}

/// Tool and parameter names the parser recognizes as tags
pub struct ParserVocabulary {
    tools: Vec<Tag>,
    params: Vec<Tag>,
    /// Params whose values may contain their own closing tag
    raw_params: Vec<Tag>,
}

impl ParserVocabulary {
    pub fn new<T, P>(tools: T, params: P) -> Self
    where
        T: IntoIterator,
        T::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let mut params: Vec<Tag> = params.into_iter().map(|p| Tag::new(p.as_ref())).collect();
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params.dedup_by(|a, b| a.name == b.name);
        Self {
            tools: tools.into_iter().map(|t| Tag::new(t.as_ref())).collect(),
            params,
            raw_params: vec![Tag::new("content"), Tag::new("diff")],
        }
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|p| p.name.as_str())
    }
}

struct OpenTool<'v> {
    tag: &'v Tag,
    start: usize,
    params: Map<String, Value>,
}

struct OpenParam<'v> {
    tag: &'v Tag,
    start: usize,
}

/// Parse `text` into blocks. Tool ids are `{id_prefix}_{n}` where `n`
/// counts tool invocations, so they stay stable across re-parses.
pub fn parse_assistant_message(
    text: &str,
    vocabulary: &ParserVocabulary,
    id_prefix: &str,
) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    let mut text_start: Option<usize> = None;
    let mut tool: Option<OpenTool<'_>> = None;
    let mut param: Option<OpenParam<'_>> = None;
    let mut tool_count = 0usize;

    for (i, c) in text.char_indices() {
        let end = i + c.len_utf8();

        if let Some(open_param) = &param {
            let value = &text[open_param.start..end];
            if let Some(value) = value.strip_suffix(open_param.tag.close.as_str()) {
                if let Some(open_tool) = tool.as_mut() {
                    open_tool
                        .params
                        .insert(
                            open_param.tag.name.clone(),
                            Value::String(value.trim().to_string()),
                        );
                }
                param = None;
            }
            continue;
        }

        if let Some(mut open_tool) = tool.take() {
            let segment = &text[open_tool.start..end];
            if segment.ends_with(open_tool.tag.close.as_str()) {
                blocks.push(tool_block(open_tool, id_prefix, tool_count, false));
                tool_count += 1;
                continue;
            }

            if let Some(tag) = vocabulary
                .params
                .iter()
                .find(|p| segment.ends_with(p.open.as_str()))
            {
                param = Some(OpenParam { tag, start: end });
            }

            // A raw value may contain its closing tag, so take everything
            // up to the last close seen so far.
            if let Some(tag) = vocabulary
                .raw_params
                .iter()
                .find(|p| segment.ends_with(p.close.as_str()))
            {
                if let (Some(first), Some(last)) =
                    (segment.find(tag.open.as_str()), segment.rfind(tag.close.as_str()))
                {
                    let value_start = first + tag.open.len();
                    if value_start <= last {
                        open_tool.params.insert(
                            tag.name.clone(),
                            Value::String(segment[value_start..last].trim().to_string()),
                        );
                    }
                }
            }

            tool = Some(open_tool);
            continue;
        }

        let so_far = &text[..end];
        if let Some(tag) = vocabulary
            .tools
            .iter()
            .find(|t| so_far.ends_with(t.open.as_str()))
        {
            let tag_start = end - tag.open.len();
            if let Some(start) = text_start.take() {
                if start <= tag_start {
                    let body = text[start..tag_start].trim();
                    if !body.is_empty() {
                        blocks.push(ContentBlock::text(body));
                    }
                }
            }
            tool = Some(OpenTool {
                tag,
                start: end,
                params: Map::new(),
            });
            continue;
        }

        if text_start.is_none() {
            text_start = Some(i);
        }
    }

    if let Some(mut open_tool) = tool {
        if let Some(open_param) = param {
            open_tool.params.insert(
                open_param.tag.name.clone(),
                Value::String(text[open_param.start..].trim().to_string()),
            );
        }
        blocks.push(tool_block(open_tool, id_prefix, tool_count, true));
    } else if let Some(start) = text_start {
        let body = text[start..].trim();
        if !body.is_empty() {
            blocks.push(ContentBlock::Text {
                text: body.to_string(),
                partial: true,
            });
        }
    }

    blocks
}

fn tool_block(open: OpenTool<'_>, id_prefix: &str, n: usize, partial: bool) -> ContentBlock {
    ContentBlock::ToolUse {
        id: format!("{id_prefix}_{n}"),
        name: open.tag.name.clone(),
        params: open.params,
        partial,
    }
}

/// Mark every block complete once the stream has ended
pub fn complete_all(blocks: &mut [ContentBlock]) {
    for block in blocks {
        block.set_partial(false);
    }
}

static THINKING_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<thinking>\s?").expect("static regex"));
static THINKING_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s?</thinking>").expect("static regex"));

/// Text as shown to the user: thinking tags removed and, while streaming,
/// a half-written tag at the tail cut off.
pub fn display_text(text: &str, partial: bool) -> String {
    let cleaned = THINKING_OPEN.replace_all(text, "");
    let mut cleaned = THINKING_CLOSE.replace_all(&cleaned, "").into_owned();

    if partial {
        if let Some(last_open) = cleaned.rfind('<') {
            let tail = &cleaned[last_open..];
            if !tail.contains('>') {
                let tag_body = tail
                    .strip_prefix("</")
                    .or_else(|| tail.strip_prefix('<'))
                    .unwrap_or(tail);
                // A name must follow `<` directly; `x < y` is prose
                let looks_like_tag = tag_body.chars().all(|c| c.is_ascii_alphabetic() || c == '_');
                if looks_like_tag {
                    cleaned.truncate(last_open);
                }
            }
        }
    }

    cleaned.trim().to_string()
}

/// Remove a half-streamed closing `tag` from the end of a partial value
pub fn strip_partial_tag(tag: &str, text: &str, partial: bool) -> String {
    if !partial {
        return text.to_string();
    }
    let optional_chars: String = tag
        .chars()
        .map(|c| format!("(?:{})?", regex::escape(&c.to_string())))
        .collect();
    match Regex::new(&format!(r"\s?</?{optional_chars}$")) {
        Ok(re) => re.replace(text, "").into_owned(),
        Err(_) => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabulary() -> ParserVocabulary {
        ParserVocabulary::new(
            ["read_file", "write_to_file", "attempt_completion", "access_mcp_resource"],
            ["path", "content", "result", "server_name", "uri"],
        )
    }

    fn count_complete(blocks: &[ContentBlock]) -> usize {
        blocks.iter().filter(|b| !b.is_partial()).count()
    }

    #[test]
    fn test_plain_text_is_single_partial_block() {
        let blocks = parse_assistant_message("  Hello world  ", &vocabulary(), "t");
        assert_eq!(
            blocks,
            vec![ContentBlock::Text {
                text: "Hello world".into(),
                partial: true
            }]
        );
    }

    #[test]
    fn test_text_then_complete_tool() {
        let text = "I'll read it.\n<read_file>\n<path>src/main.rs</path>\n</read_file>";
        let blocks = parse_assistant_message(text, &vocabulary(), "t");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], ContentBlock::text("I'll read it."));
        match &blocks[1] {
            ContentBlock::ToolUse {
                id,
                name,
                params,
                partial,
            } => {
                assert_eq!(id, "t_0");
                assert_eq!(name, "read_file");
                assert_eq!(params["path"], "src/main.rs");
                assert!(!partial);
            }
            other => panic!("expected tool use, got {:?}", other),
        }
    }

    #[test]
    fn test_mcp_resource_params() {
        let text = "<access_mcp_resource><server_name>srv</server_name><uri>/path</uri></access_mcp_resource>";
        let blocks = parse_assistant_message(text, &vocabulary(), "t");
        match &blocks[..] {
            [ContentBlock::ToolUse { params, partial, .. }] => {
                assert_eq!(params["server_name"], "srv");
                assert_eq!(params["uri"], "/path");
                assert!(!partial);
            }
            other => panic!("unexpected blocks {:?}", other),
        }
    }

    #[test]
    fn test_partial_tool_keeps_partial_param() {
        let text = "<read_file>\n<path>src/ma";
        let blocks = parse_assistant_message(text, &vocabulary(), "t");
        match &blocks[..] {
            [ContentBlock::ToolUse { params, partial, .. }] => {
                assert!(partial);
                assert_eq!(params["path"], "src/ma");
            }
            other => panic!("unexpected blocks {:?}", other),
        }
    }

    #[test]
    fn test_content_may_contain_its_closing_tag() {
        let text = "<write_to_file><path>a.md</path><content>see </content> tag</content></write_to_file>";
        let blocks = parse_assistant_message(text, &vocabulary(), "t");
        match &blocks[..] {
            [ContentBlock::ToolUse { params, .. }] => {
                assert_eq!(params["content"], "see </content> tag");
            }
            other => panic!("unexpected blocks {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tags_are_text() {
        let blocks = parse_assistant_message("<bogus>x</bogus>", &vocabulary(), "t");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].as_text(), Some("<bogus>x</bogus>"));
    }

    #[test]
    fn test_tool_ids_count_invocations() {
        let text = "<read_file><path>a</path></read_file>\nthen\n<read_file><path>b</path></read_file>";
        let blocks = parse_assistant_message(text, &vocabulary(), "turn3");
        let ids: Vec<_> = blocks.iter().filter_map(|b| b.tool_use_id()).collect();
        assert_eq!(ids, vec!["turn3_0", "turn3_1"]);
    }

    #[test]
    fn test_growing_prefix_never_loses_blocks() {
        let text = "Checking.\n<read_file>\n<path>src/lib.rs</path>\n</read_file>\nDone <thinking>ok</thinking>\n<attempt_completion><result>All good</result></attempt_completion>";
        let vocab = vocabulary();
        let mut prev_total = 0;
        let mut prev_complete = 0;
        for (i, _) in text.char_indices().skip(1) {
            let blocks = parse_assistant_message(&text[..i], &vocab, "t");
            assert!(blocks.len() >= prev_total, "block count dropped at {}", i);
            assert!(count_complete(&blocks) >= prev_complete, "complete count dropped at {}", i);
            let partials = blocks.iter().filter(|b| b.is_partial()).count();
            assert!(partials <= 1);
            if partials == 1 {
                assert!(blocks.last().unwrap().is_partial());
            }
            prev_total = blocks.len();
            prev_complete = count_complete(&blocks);
        }
        let mut blocks = parse_assistant_message(text, &vocab, "t");
        complete_all(&mut blocks);
        assert!(blocks.iter().all(|b| !b.is_partial()));
        assert_eq!(blocks.len(), 4);
    }

    #[test]
    fn test_display_text_strips_thinking_and_partial_tag() {
        assert_eq!(display_text("<thinking> plan </thinking> Hi", false), "plan Hi");
        assert_eq!(display_text("Let me read <read_fi", true), "Let me read");
        assert_eq!(display_text("Let me read </", true), "Let me read");
        assert_eq!(display_text("a <= b", true), "a <= b");
        assert_eq!(display_text("when x < y holds", true), "when x < y holds");
        assert_eq!(display_text("if x < y", true), "if x < y");
        assert_eq!(display_text("then </ done", true), "then </ done");
        assert_eq!(display_text("Let me read <read_fi", false), "Let me read <read_fi");
    }

    #[test]
    fn test_strip_partial_tag() {
        assert_eq!(strip_partial_tag("path", "src/main.rs </pa", true), "src/main.rs");
        assert_eq!(strip_partial_tag("path", "src/main.rs<", true), "src/main.rs");
        assert_eq!(strip_partial_tag("path", "src/main.rs</pa", false), "src/main.rs</pa");
    }
}
