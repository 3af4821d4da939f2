//! Fence-aware reply chunking.
//!
//! Splits reply text into fragments that fit a channel cap without breaking
//! fenced code spans. Preference order: paragraph break, line break, hard
//! character split. An oversized fence is split by lines and each fragment is
//! re-wrapped in the same fence so every fragment stays renderable.

enum Unit {
    Text(String),
    Fence { header: String, lines: Vec<String> },
}

/// Splits `text` into fragments of at most `max_chars` characters.
pub fn chunk_markdown_text(text: &str, max_chars: usize) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let max_chars = max_chars.max(16);
    if trimmed.chars().count() <= max_chars {
        return vec![trimmed.to_string()];
    }

    let units = tokenize_units(trimmed);
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for unit in units {
        match unit {
            Unit::Text(paragraph) => {
                pack_text(&mut chunks, &mut current, &paragraph, max_chars);
            }
            Unit::Fence { header, lines } => {
                pack_fence(&mut chunks, &mut current, &header, &lines, max_chars);
            }
        }
    }
    flush(&mut chunks, &mut current);
    chunks
}

fn tokenize_units(text: &str) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut fence: Option<(String, Vec<String>)> = None;

    for line in text.lines() {
        let is_fence_marker = line.trim_start().starts_with("```");
        match (&mut fence, is_fence_marker) {
            (None, true) => {
                if !paragraph.is_empty() {
                    units.push(Unit::Text(paragraph.join("\n")));
                    paragraph.clear();
                }
                fence = Some((line.to_string(), Vec::new()));
            }
            (Some((header, lines)), true) => {
                units.push(Unit::Fence {
                    header: header.clone(),
                    lines: lines.clone(),
                });
                fence = None;
            }
            (Some((_, lines)), false) => lines.push(line.to_string()),
            (None, false) => {
                if line.trim().is_empty() {
                    if !paragraph.is_empty() {
                        units.push(Unit::Text(paragraph.join("\n")));
                        paragraph.clear();
                    }
                } else {
                    paragraph.push(line);
                }
            }
        }
    }
    if let Some((header, lines)) = fence {
        // Unterminated fence: keep it as a fence so it still renders.
        units.push(Unit::Fence { header, lines });
    }
    if !paragraph.is_empty() {
        units.push(Unit::Text(paragraph.join("\n")));
    }
    units
}

fn flush(chunks: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
    current.clear();
}

fn append_block(current: &mut String, block: &str) {
    if !current.is_empty() {
        current.push_str("\n\n");
    }
    current.push_str(block);
}

fn fits(current: &str, block: &str, max_chars: usize) -> bool {
    let separator = if current.is_empty() { 0 } else { 2 };
    current.chars().count() + separator + block.chars().count() <= max_chars
}

fn pack_text(chunks: &mut Vec<String>, current: &mut String, paragraph: &str, max_chars: usize) {
    if fits(current, paragraph, max_chars) {
        append_block(current, paragraph);
        return;
    }
    flush(chunks, current);
    if paragraph.chars().count() <= max_chars {
        append_block(current, paragraph);
        return;
    }
    // Paragraph alone exceeds the cap: split on lines, then characters.
    for line in paragraph.lines() {
        if fits(current, line, max_chars) {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            continue;
        }
        flush(chunks, current);
        if line.chars().count() <= max_chars {
            current.push_str(line);
        } else {
            for piece in split_by_chars(line, max_chars) {
                flush(chunks, current);
                current.push_str(&piece);
            }
        }
    }
}

fn pack_fence(
    chunks: &mut Vec<String>,
    current: &mut String,
    header: &str,
    lines: &[String],
    max_chars: usize,
) {
    let closed = |body: &[String]| -> String {
        let mut block = String::from(header);
        for line in body {
            block.push('\n');
            block.push_str(line);
        }
        block.push_str("\n```");
        block
    };

    let whole = closed(lines);
    if fits(current, &whole, max_chars) {
        append_block(current, &whole);
        return;
    }
    flush(chunks, current);
    if whole.chars().count() <= max_chars {
        append_block(current, &whole);
        return;
    }

    // The fence alone exceeds the cap: emit line-packed fragments, each
    // re-wrapped in the original fence header.
    let overhead = header.chars().count() + "\n```".chars().count() + 1;
    let budget = max_chars.saturating_sub(overhead).max(1);
    let mut body: Vec<String> = Vec::new();
    let mut body_len = 0usize;
    for line in lines {
        let line_len = line.chars().count() + 1;
        if body_len + line_len > budget && !body.is_empty() {
            chunks.push(closed(&body));
            body.clear();
            body_len = 0;
        }
        if line.chars().count() > budget {
            for piece in split_by_chars(line, budget) {
                chunks.push(closed(&[piece]));
            }
            continue;
        }
        body_len += line_len;
        body.push(line.clone());
    }
    if !body.is_empty() {
        chunks.push(closed(&body));
    }
}

fn split_by_chars(line: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buffer = String::new();
    for ch in line.chars() {
        if buffer.chars().count() >= max_chars {
            pieces.push(std::mem::take(&mut buffer));
        }
        buffer.push(ch);
    }
    if !buffer.is_empty() {
        pieces.push(buffer);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::chunk_markdown_text;

    #[test]
    fn unit_short_text_stays_whole() {
        assert_eq!(chunk_markdown_text("hello", 100), vec!["hello"]);
        assert!(chunk_markdown_text("   ", 100).is_empty());
    }

    #[test]
    fn functional_chunks_prefer_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_markdown_text(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(60));
        assert_eq!(chunks[1], "b".repeat(60));
    }

    #[test]
    fn functional_fenced_code_is_never_split_mid_span() {
        let text = format!(
            "intro paragraph\n\n```rust\nlet x = 1;\nlet y = 2;\n```\n\n{}",
            "tail ".repeat(10)
        );
        let chunks = chunk_markdown_text(&text, 48);
        for chunk in &chunks {
            let fence_markers = chunk.matches("```").count();
            assert_eq!(fence_markers % 2, 0, "unbalanced fence in {chunk:?}");
        }
        assert!(chunks.iter().any(|chunk| chunk.contains("let x = 1;")));
    }

    #[test]
    fn regression_oversized_fence_fragments_are_rewrapped() {
        let body = (0..40)
            .map(|index| format!("line number {index}"))
            .collect::<Vec<_>>()
            .join("\n");
        let text = format!("```python\n{body}\n```");
        let chunks = chunk_markdown_text(&text, 120);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.starts_with("```python"), "fragment lost header");
            assert!(chunk.ends_with("```"), "fragment lost closing fence");
            assert!(chunk.chars().count() <= 120);
        }
    }

    #[test]
    fn regression_every_chunk_respects_the_cap() {
        let text = "word ".repeat(500);
        for chunk in chunk_markdown_text(&text, 100) {
            assert!(chunk.chars().count() <= 100);
        }
    }
}
