// 轻量 markdown 渲染：模型返回的文本按行解析为结构化块，
// 再映射成带样式的 ratatui Line。绝不把模型文本当可执行标记处理。
// 支持：# / ## / ### 标题、* 与 - 列表、**加粗**、$...$ 行内公式、$$...$$ 块级公式

use once_cell::sync::Lazy;
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use regex::Regex;

use crate::ui::Theme;

#[derive(Debug, Clone, PartialEq)]
pub enum Inline {
    Text(String),
    Bold(String),
    Math(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Heading(u8, Vec<Inline>),
    ListItem(Vec<Inline>),
    MathBlock(String),
    Paragraph(Vec<Inline>),
    Blank,
}

static INLINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$(.+?)\$\$|\$([^$\n]+)\$|\*\*([^*]+?)\*\*").unwrap());

pub fn parse_inlines(line: &str) -> Vec<Inline> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in INLINE_RE.captures_iter(line) {
        let m = caps.get(0).unwrap();
        if m.start() > last {
            out.push(Inline::Text(line[last..m.start()].to_string()));
        }
        if let Some(math) = caps.get(1).or_else(|| caps.get(2)) {
            out.push(Inline::Math(math.as_str().to_string()));
        } else if let Some(bold) = caps.get(3) {
            out.push(Inline::Bold(bold.as_str().to_string()));
        }
        last = m.end();
    }
    if last < line.len() {
        out.push(Inline::Text(line[last..].to_string()));
    }
    out
}

pub fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut math_buf: Option<Vec<String>> = None;
    for line in text.lines() {
        let trimmed = line.trim_end();
        // $$ 单独成行时开/收一个块级公式
        if let Some(buf) = math_buf.as_mut() {
            if trimmed.trim() == "$$" {
                blocks.push(Block::MathBlock(buf.join("\n")));
                math_buf = None;
            } else {
                buf.push(trimmed.to_string());
            }
            continue;
        }
        if trimmed.trim() == "$$" {
            math_buf = Some(Vec::new());
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("### ") {
            blocks.push(Block::Heading(3, parse_inlines(rest)));
        } else if let Some(rest) = trimmed.strip_prefix("## ") {
            blocks.push(Block::Heading(2, parse_inlines(rest)));
        } else if let Some(rest) = trimmed.strip_prefix("# ") {
            blocks.push(Block::Heading(1, parse_inlines(rest)));
        } else if let Some(rest) = trimmed
            .strip_prefix("* ")
            .or_else(|| trimmed.strip_prefix("- "))
        {
            blocks.push(Block::ListItem(parse_inlines(rest)));
        } else if trimmed.trim().is_empty() {
            blocks.push(Block::Blank);
        } else if trimmed.trim().starts_with("$$")
            && trimmed.trim().ends_with("$$")
            && trimmed.trim().len() > 4
        {
            let inner = trimmed.trim();
            blocks.push(Block::MathBlock(inner[2..inner.len() - 2].to_string()));
        } else {
            blocks.push(Block::Paragraph(parse_inlines(trimmed)));
        }
    }
    // 未闭合的 $$：按块级公式收尾而不是丢内容
    if let Some(buf) = math_buf {
        blocks.push(Block::MathBlock(buf.join("\n")));
    }
    blocks
}

fn inline_spans(inlines: &[Inline], base: Style, th: Theme) -> Vec<Span<'static>> {
    inlines
        .iter()
        .map(|seg| match seg {
            Inline::Text(s) => Span::styled(s.clone(), base),
            Inline::Bold(s) => Span::styled(s.clone(), base.add_modifier(Modifier::BOLD)),
            Inline::Math(s) => Span::styled(
                s.clone(),
                Style::default().fg(th.info).add_modifier(Modifier::ITALIC),
            ),
        })
        .collect()
}

/// 整段文本 → 带样式的行（供 Paragraph 渲染）
pub fn render(text: &str, th: Theme) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    for block in parse_blocks(text) {
        match block {
            Block::Heading(level, inlines) => {
                let style = match level {
                    1 | 2 => Style::default().fg(th.accent).add_modifier(Modifier::BOLD),
                    _ => Style::default().fg(th.fg).add_modifier(Modifier::BOLD),
                };
                lines.push(Line::from(inline_spans(&inlines, style, th)));
            }
            Block::ListItem(inlines) => {
                let mut spans = vec![Span::styled("  • ", Style::default().fg(th.accent))];
                spans.extend(inline_spans(&inlines, Style::default().fg(th.fg), th));
                lines.push(Line::from(spans));
            }
            Block::MathBlock(src) => {
                for math_line in src.lines() {
                    lines.push(Line::from(Span::styled(
                        format!("    {}", math_line),
                        Style::default().fg(th.info).add_modifier(Modifier::ITALIC),
                    )));
                }
            }
            Block::Paragraph(inlines) => {
                lines.push(Line::from(inline_spans(
                    &inlines,
                    Style::default().fg(th.fg),
                    th,
                )));
            }
            Block::Blank => lines.push(Line::from("")),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_and_lists_parse() {
        let blocks = parse_blocks("## 三角函数\n- 对称轴\n正文");
        assert_eq!(blocks.len(), 3);
        assert!(matches!(&blocks[0], Block::Heading(2, _)));
        assert!(matches!(&blocks[1], Block::ListItem(_)));
        assert!(matches!(&blocks[2], Block::Paragraph(_)));
    }

    #[test]
    fn bold_and_math_split_within_line() {
        let inlines = parse_inlines("设 **周期** 为 $T = \\pi$ 即可");
        assert_eq!(
            inlines,
            vec![
                Inline::Text("设 ".into()),
                Inline::Bold("周期".into()),
                Inline::Text(" 为 ".into()),
                Inline::Math("T = \\pi".into()),
                Inline::Text(" 即可".into()),
            ]
        );
    }

    #[test]
    fn block_math_fences_collect_lines() {
        let blocks = parse_blocks("$$\nf(x) = \\sin x\n$$");
        assert_eq!(blocks, vec![Block::MathBlock("f(x) = \\sin x".into())]);
    }

    #[test]
    fn single_line_block_math() {
        let blocks = parse_blocks("$$E = mc^2$$");
        assert_eq!(blocks, vec![Block::MathBlock("E = mc^2".into())]);
    }

    #[test]
    fn unclosed_math_fence_keeps_content() {
        let blocks = parse_blocks("$$\nx + y");
        assert_eq!(blocks, vec![Block::MathBlock("x + y".into())]);
    }

    #[test]
    fn plain_text_is_untouched() {
        let inlines = parse_inlines("没有任何标记的句子");
        assert_eq!(inlines, vec![Inline::Text("没有任何标记的句子".into())]);
    }
}
