// 界面绘制：顶栏 Tab + 错误横幅 + 四个标签页 + 辅导对话弹窗
// 纯渲染消费者，除滚动/选中辅助外不改业务状态

use clap::ValueEnum;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap};
use ratatui::Frame;
use unicode_width::UnicodeWidthChar;

use crate::markdown;
use crate::state::{App, ChatState, Sender, Tab};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ThemeKind {
    Dark,
    Light,
}

#[derive(Debug, Clone, Copy)]
pub struct Theme {
    pub fg: Color,
    pub muted: Color,
    pub accent: Color,
    pub bar_bg: Color,
    pub selection_bg: Color,
    pub good: Color,
    pub warn: Color,
    pub info: Color,
}

pub fn theme_of(kind: ThemeKind) -> Theme {
    match kind {
        ThemeKind::Dark => Theme {
            fg: Color::Rgb(220, 220, 220),
            muted: Color::Rgb(140, 140, 140),
            accent: Color::Rgb(95, 175, 255),
            bar_bg: Color::Rgb(35, 40, 46),
            selection_bg: Color::Rgb(60, 65, 72),
            good: Color::Rgb(130, 200, 120),
            warn: Color::Rgb(255, 200, 110),
            info: Color::Rgb(120, 170, 255),
        },
        ThemeKind::Light => Theme {
            fg: Color::Rgb(30, 30, 30),
            muted: Color::Rgb(120, 120, 120),
            accent: Color::Rgb(0, 122, 255),
            bar_bg: Color::Rgb(235, 240, 245),
            selection_bg: Color::Rgb(210, 220, 235),
            good: Color::Rgb(38, 166, 91),
            warn: Color::Rgb(255, 160, 0),
            info: Color::Rgb(0, 122, 255),
        },
    }
}

pub fn ui(f: &mut Frame, app: &mut App, th: Theme) {
    let v = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(5),
            Constraint::Length(1),
        ])
        .split(f.area());

    draw_header(f, v[0], app, th);

    // 有错误时主区顶部挤出一行横幅
    let body = if app.error.is_some() {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(1), Constraint::Min(4)])
            .split(v[1]);
        draw_error_banner(f, rows[0], app, th);
        rows[1]
    } else {
        v[1]
    };

    match app.tab {
        Tab::Upload => draw_upload(f, body, app, th),
        Tab::Bank => draw_bank(f, body, app, th),
        Tab::Analysis => draw_analysis(f, body, app, th),
        Tab::Practice => draw_practice(f, body, app, th),
    }

    draw_footer(f, v[2], app, th);

    if app.chat.is_some() {
        draw_chat_modal(f, app, th);
    }
}

fn draw_header(f: &mut Frame, area: Rect, app: &App, th: Theme) {
    let bg = Block::default()
        .borders(Borders::NONE)
        .style(Style::default().bg(th.bar_bg));
    f.render_widget(bg, area);

    let mut segs = vec![Span::styled(
        " AI 错题本 ",
        Style::default().fg(th.accent).add_modifier(Modifier::BOLD),
    )];
    for (i, tab) in Tab::ALL.iter().enumerate() {
        let style = if *tab == app.tab {
            Style::default()
                .fg(th.accent)
                .bg(th.selection_bg)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(th.muted)
        };
        segs.push(Span::styled(format!(" {} {} ", i + 1, tab.title()), style));
    }
    segs.push(Span::styled(
        format!("  题数:{}", app.bank.len()),
        Style::default().fg(th.muted),
    ));
    if app.busy {
        segs.push(Span::styled(
            format!("  ⏳ {}", app.busy_message),
            Style::default().fg(th.warn).add_modifier(Modifier::BOLD),
        ));
    }
    let para = Paragraph::new(Line::from(segs)).style(Style::default().bg(th.bar_bg).fg(th.fg));
    f.render_widget(para, area);
}

fn draw_error_banner(f: &mut Frame, area: Rect, app: &App, th: Theme) {
    let msg = app.error.as_deref().unwrap_or_default();
    let para = Paragraph::new(Line::from(vec![
        Span::styled(" ⚠ ", Style::default().fg(th.warn)),
        Span::styled(msg.to_string(), Style::default().fg(th.warn)),
        Span::styled("  (x 关闭)", Style::default().fg(th.muted)),
    ]));
    f.render_widget(para, area);
}

fn draw_footer(f: &mut Frame, area: Rect, app: &App, th: Theme) {
    let bg = Block::default()
        .borders(Borders::NONE)
        .style(Style::default().bg(th.bar_bg));
    f.render_widget(bg, area);
    let tips = if app.chat.is_some() {
        " [Enter]发送  [Esc]关闭对话  [↑/↓]滚动记录 ".to_string()
    } else {
        let per_tab = match app.tab {
            Tab::Upload => "[i]输入图片路径  [r]开始识别  [Enter]存入错题库",
            Tab::Bank => "[j/k]上下  [d]删除  [t]错题精讲  [z]分析知识点",
            Tab::Analysis => "[j/k]滚动  [g]生成巩固练习",
            Tab::Practice => "[j/k]上下  [a]查看/隐藏详解",
        };
        format!(" [q]退出  [1-4]切换标签  [x]清除提示  {} ", per_tab)
    };
    let help = Paragraph::new(Line::from(vec![Span::styled(
        tips,
        Style::default().fg(th.muted),
    )]))
    .style(Style::default().bg(th.bar_bg));
    f.render_widget(help, area);
}

// ---------------- 上传页 ----------------

fn draw_upload(f: &mut Frame, area: Rect, app: &mut App, th: Theme) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Length(2), Constraint::Min(3)])
        .split(area);

    let input_title = if app.path_editing {
        " 图片路径（Enter 确认 / Esc 取消） "
    } else {
        " 图片路径（按 i 编辑） "
    };
    app.path_input.set_block(
        Block::default()
            .title(Span::styled(
                input_title,
                Style::default().fg(if app.path_editing { th.accent } else { th.muted }),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if app.path_editing { th.accent } else { th.muted })),
    );
    app.path_input.set_cursor_line_style(Style::default());
    f.render_widget(&app.path_input, rows[0]);

    let status = match &app.uploaded_image {
        Some(img) => Line::from(vec![
            Span::styled(" 已加载: ", Style::default().fg(th.muted)),
            Span::styled(
                img.path.display().to_string(),
                Style::default().fg(th.good),
            ),
            Span::styled(
                format!("  ({} KB)", img.bytes.len() / 1024),
                Style::default().fg(th.muted),
            ),
        ]),
        None => Line::from(Span::styled(
            " 尚未加载图片。输入一张试卷照片的路径，按 r 识别标记为错误的题目。",
            Style::default().fg(th.muted),
        )),
    };
    f.render_widget(Paragraph::new(status), rows[1]);

    let mut lines: Vec<Line> = Vec::new();
    if app.extracted.is_empty() {
        lines.push(Line::from(Span::styled(
            "（识别出的错题会显示在这里）",
            Style::default().fg(th.muted),
        )));
    } else {
        for (i, q) in app.extracted.iter().enumerate() {
            lines.push(Line::from(vec![
                Span::styled(
                    format!("{}. ", i + 1),
                    Style::default().fg(th.accent),
                ),
                Span::styled(
                    format!("[{}] ", q.subject),
                    Style::default().fg(subject_color(&q.subject)),
                ),
            ]));
            lines.extend(markdown::render(&q.question_text, th));
            lines.push(Line::from(""));
        }
    }
    let block = Block::default()
        .title(Span::styled(
            format!(" 识别出的错题 ({}) ", app.extracted.len()),
            Style::default().fg(th.accent),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(th.muted));
    f.render_widget(
        Paragraph::new(lines).block(block).wrap(Wrap { trim: false }),
        rows[2],
    );
}

// ---------------- 错题库页 ----------------

fn subject_color(subject: &str) -> Color {
    match subject {
        "数学" => Color::LightBlue,
        "物理" => Color::Magenta,
        "化学" => Color::Yellow,
        "语文" | "英语" => Color::Green,
        _ => Color::Gray,
    }
}

fn draw_bank(f: &mut Frame, area: Rect, app: &mut App, th: Theme) {
    if app.bank.is_empty() {
        let empty = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                "  错题库是空的",
                Style::default().fg(th.fg).add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                "  请先从\u{201c}上传错题\u{201d}标签页添加题目。",
                Style::default().fg(th.muted),
            )),
        ])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(th.muted)));
        f.render_widget(empty, area);
        return;
    }

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    let width = cols[0].width.saturating_sub(14) as usize;
    let items: Vec<ListItem> = app
        .bank
        .iter()
        .map(|q| {
            let excerpt = truncate_width(q.question_text.lines().next().unwrap_or(""), width);
            ListItem::new(Line::from(vec![
                Span::styled("› ", Style::default().fg(th.accent)),
                Span::styled(
                    format!("[{}] ", q.subject),
                    Style::default().fg(subject_color(&q.subject)),
                ),
                Span::styled(excerpt, Style::default().fg(th.fg)),
            ]))
        })
        .collect();
    let list = List::new(items)
        .block(
            Block::default()
                .title(Span::styled(
                    format!(" 我的错题库 ({}) ", app.bank.len()),
                    Style::default().fg(th.accent),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(th.muted)),
        )
        .highlight_style(
            Style::default()
                .bg(th.selection_bg)
                .fg(th.fg)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▸ ");
    f.render_stateful_widget(list, cols[0], &mut app.bank_list);

    let mut detail: Vec<Line> = Vec::new();
    if let Some(q) = app.selected_bank_question() {
        detail.push(Line::from(Span::styled(
            format!("[{}]", q.subject),
            Style::default().fg(subject_color(&q.subject)).add_modifier(Modifier::BOLD),
        )));
        detail.push(Line::from(""));
        detail.extend(markdown::render(&q.question_text, th));
    }
    let block = Block::default()
        .title(Span::styled(" 题目详情 ", Style::default().fg(th.accent)))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(th.muted));
    f.render_widget(
        Paragraph::new(detail).block(block).wrap(Wrap { trim: false }),
        cols[1],
    );
}

// ---------------- 分析页 ----------------

fn draw_analysis(f: &mut Frame, area: Rect, app: &App, th: Theme) {
    let block = Block::default()
        .title(Span::styled(
            " 知识点分析与复习提纲 ",
            Style::default().fg(th.accent),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(th.muted));
    if app.analysis.is_empty() {
        let empty = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                "  暂无分析报告",
                Style::default().fg(th.fg).add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                "  请先在\u{201c}我的错题库\u{201d}中进行知识点分析。",
                Style::default().fg(th.muted),
            )),
        ])
        .block(block);
        f.render_widget(empty, area);
        return;
    }

    let mut lines: Vec<Line> = Vec::new();
    let excerpt_width = area.width.saturating_sub(10) as usize;
    for point in &app.analysis {
        lines.push(Line::from(Span::styled(
            format!("▍{}", point.title),
            Style::default().fg(th.accent).add_modifier(Modifier::BOLD),
        )));
        lines.extend(markdown::render(&point.description, th));
        // 按 id 回查题目原文；悬空 id 静默跳过
        let mut shown = false;
        for id in &point.relevant_question_ids {
            if let Some(q) = app.bank.iter().find(|q| &q.id == id) {
                if !shown {
                    lines.push(Line::from(Span::styled(
                        "  关联错题:",
                        Style::default().fg(th.muted),
                    )));
                    shown = true;
                }
                lines.push(Line::from(vec![
                    Span::styled("  · ", Style::default().fg(th.muted)),
                    Span::styled(
                        format!("[{}] ", q.subject),
                        Style::default().fg(subject_color(&q.subject)),
                    ),
                    Span::styled(
                        truncate_width(q.question_text.lines().next().unwrap_or(""), excerpt_width),
                        Style::default().fg(th.muted),
                    ),
                ]));
            }
        }
        lines.push(Line::from(""));
    }
    let para = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.analysis_scroll, 0));
    f.render_widget(para, area);
}

// ---------------- 练习页 ----------------

fn draw_practice(f: &mut Frame, area: Rect, app: &App, th: Theme) {
    let block = Block::default()
        .title(Span::styled(" 巩固练习 ", Style::default().fg(th.accent)))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(th.muted));
    if app.practice.is_empty() {
        let empty = Paragraph::new(vec![
            Line::from(""),
            Line::from(Span::styled(
                "  暂无练习题",
                Style::default().fg(th.fg).add_modifier(Modifier::BOLD),
            )),
            Line::from(Span::styled(
                "  请先生成知识点分析，然后创建巩固练习。",
                Style::default().fg(th.muted),
            )),
        ])
        .block(block);
        f.render_widget(empty, area);
        return;
    }

    let mut lines: Vec<Line> = Vec::new();
    let mut selected_start = 0usize;
    for (i, q) in app.practice.iter().enumerate() {
        let selected = i == app.practice_sel;
        if selected {
            selected_start = lines.len();
        }
        let marker = if selected { "▸ " } else { "  " };
        lines.push(Line::from(Span::styled(
            format!("{}第 {} 题", marker, i + 1),
            if selected {
                Style::default().fg(th.accent).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(th.fg).add_modifier(Modifier::BOLD)
            },
        )));
        lines.extend(markdown::render(&q.question_text, th));
        if app.revealed.contains(&q.id) {
            lines.push(Line::from(Span::styled(
                "  详解：",
                Style::default().fg(th.good).add_modifier(Modifier::BOLD),
            )));
            lines.extend(markdown::render(&q.answer_text, th));
        } else {
            lines.push(Line::from(Span::styled(
                "  [a 查看详解]",
                Style::default().fg(th.muted),
            )));
        }
        lines.push(Line::from(""));
    }
    // 让当前选中的题目保持在视口里
    let viewport = area.height.saturating_sub(2) as usize;
    let scroll = if selected_start + 3 > viewport {
        (selected_start + 3 - viewport) as u16
    } else {
        0
    };
    let para = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0));
    f.render_widget(para, area);
}

// ---------------- 辅导对话弹窗 ----------------

fn chat_transcript_lines(chat: &ChatState, th: Theme) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();
    for msg in &chat.transcript {
        let (label, color) = match msg.sender {
            Sender::User => ("你：", th.accent),
            Sender::Ai => ("老师：", th.good),
        };
        lines.push(Line::from(Span::styled(
            label.to_string(),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
        if msg.text.is_empty() {
            lines.push(Line::from(Span::styled(
                "…",
                Style::default().fg(th.muted),
            )));
        } else {
            lines.extend(markdown::render(&msg.text, th));
        }
        lines.push(Line::from(""));
    }
    lines
}

fn draw_chat_modal(f: &mut Frame, app: &mut App, th: Theme) {
    let area = centered_rect(80, 85, f.area());
    f.render_widget(Clear, area);
    let outer = Block::default()
        .title(Span::styled(
            " 错题精讲 ",
            Style::default().fg(th.accent).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(th.accent));
    let inner = outer.inner(area);
    f.render_widget(outer, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Min(4),
            Constraint::Length(3),
        ])
        .split(inner);

    let Some(chat) = app.chat.as_ref() else { return };

    let excerpt = truncate_width(
        chat.question.question_text.lines().next().unwrap_or(""),
        rows[0].width.saturating_sub(8) as usize,
    );
    f.render_widget(
        Paragraph::new(vec![Line::from(vec![
            Span::styled(
                format!("[{}] ", chat.question.subject),
                Style::default().fg(subject_color(&chat.question.subject)),
            ),
            Span::styled(excerpt, Style::default().fg(th.muted)),
        ])]),
        rows[0],
    );

    let lines = chat_transcript_lines(chat, th);
    let total = lines.len() as u16;
    let viewport = rows[1].height;
    // 默认贴底显示，chat.scroll 表示向上回看的行数
    let bottom = total.saturating_sub(viewport);
    let scroll = bottom.saturating_sub(chat.scroll);
    let para = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0));
    f.render_widget(para, rows[1]);

    let busy = chat.busy;
    let input_title = if busy {
        " 老师正在回复… "
    } else {
        " 在这里输入你的问题... "
    };
    app.chat_input.set_block(
        Block::default()
            .title(Span::styled(
                input_title,
                Style::default().fg(if busy { th.muted } else { th.accent }),
            ))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if busy { th.muted } else { th.accent })),
    );
    app.chat_input.set_cursor_line_style(Style::default());
    f.render_widget(&app.chat_input, rows[2]);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let vert = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    let horiz = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vert[1]);
    horiz[1]
}

/// 按显示宽度截断，超出部分以 … 结尾（中文占两列）。
/// 恰好放得下时原样返回，只有真正截断才占用省略号那一列
pub fn truncate_width(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let total: usize = s.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max {
        return s.to_string();
    }
    let mut width = 0;
    let mut out = String::new();
    for ch in s.chars() {
        let w = ch.width().unwrap_or(0);
        if width + w > max - 1 {
            break;
        }
        width += w;
        out.push(ch);
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_display_width() {
        assert_eq!(truncate_width("abcdef", 4), "abc…");
        assert_eq!(truncate_width("短句", 10), "短句");
        // 中文每字两列
        assert_eq!(truncate_width("已知函数的图像", 7), "已知函…");
        assert_eq!(truncate_width("anything", 0), "");
    }

    #[test]
    fn truncate_keeps_exact_fit_intact() {
        assert_eq!(truncate_width("abcd", 4), "abcd");
        assert_eq!(truncate_width("短句", 4), "短句");
        assert_eq!(truncate_width("abcde", 4), "abc…");
    }
}
