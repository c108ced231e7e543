// 视图状态控制器：App 是全部可变状态的唯一拥有者，
// 只在 UI 线程上被修改。异步网关调用的结果以 AppEvent 形式
// 回到事件循环，由 apply_event 统一折叠进状态。

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use ratatui::widgets::ListState;
use tui_textarea::TextArea;

use crate::gateway::{
    GatewayError, KnowledgePoint, ModelGateway, PracticeQuestion, WireMessage,
};
use crate::store::{BankStore, Question};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Upload,
    Bank,
    Analysis,
    Practice,
}

impl Tab {
    pub fn title(&self) -> &'static str {
        match self {
            Tab::Upload => "上传错题",
            Tab::Bank => "我的错题库",
            Tab::Analysis => "知识点分析",
            Tab::Practice => "巩固练习",
        }
    }

    pub const ALL: [Tab; 4] = [Tab::Upload, Tab::Bank, Tab::Analysis, Tab::Practice];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
}

/// 一次打开的辅导对话。随弹窗关闭整体丢弃，不做任何持久化
#[derive(Debug)]
pub struct ChatState {
    pub question: Question,
    pub transcript: Vec<ChatMessage>,
    /// 模型侧会话上下文（system 人设 + 历史轮次）
    pub wire: Vec<WireMessage>,
    pub busy: bool,
    pub session: u64,
    pub scroll: u16,
    /// 仍在首轮（开场流）中；决定失败时用哪条道歉文案
    opening: bool,
}

#[derive(Debug)]
pub struct UploadedImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// 异步任务完成后投递回事件循环的消息
#[derive(Debug)]
pub enum AppEvent {
    ExtractFinished(Result<Vec<Question>, GatewayError>),
    AnalysisFinished(Result<Vec<KnowledgePoint>, GatewayError>),
    PracticeFinished(Result<Vec<PracticeQuestion>, GatewayError>),
    ChatChunk { session: u64, delta: String },
    ChatTurnFinished { session: u64, result: Result<String, GatewayError> },
}

pub struct App {
    pub tab: Tab,
    store: BankStore,
    pub bank: Vec<Question>,
    pub uploaded_image: Option<UploadedImage>,
    pub extracted: Vec<Question>,
    pub analysis: Vec<KnowledgePoint>,
    pub practice: Vec<PracticeQuestion>,
    /// 已展开详解的练习题 id（仅 UI 状态，不落盘）
    pub revealed: HashSet<String>,
    pub busy: bool,
    pub busy_message: String,
    pub error: Option<String>,
    pub chat: Option<ChatState>,
    chat_session_seq: u64,
    pub should_quit: bool,
    // ---- 界面选择与输入 ----
    pub bank_list: ListState,
    pub practice_sel: usize,
    pub analysis_scroll: u16,
    pub path_input: TextArea<'static>,
    pub path_editing: bool,
    pub chat_input: TextArea<'static>,
}

const SAVE_FAILED: &str = "无法将错题保存至本地。";

impl App {
    pub fn new(store: BankStore) -> Self {
        let outcome = store.load();
        let mut bank_list = ListState::default();
        if !outcome.bank.is_empty() {
            bank_list.select(Some(0));
        }
        Self {
            tab: Tab::Upload,
            store,
            bank: outcome.bank,
            uploaded_image: None,
            extracted: Vec::new(),
            analysis: Vec::new(),
            practice: Vec::new(),
            revealed: HashSet::new(),
            busy: false,
            busy_message: String::new(),
            error: outcome.warning,
            chat: None,
            chat_session_seq: 0,
            should_quit: false,
            bank_list,
            practice_sel: 0,
            analysis_scroll: 0,
            path_input: TextArea::default(),
            path_editing: false,
            chat_input: TextArea::default(),
        }
    }

    pub fn select_tab(&mut self, tab: Tab) {
        self.tab = tab;
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// 从磁盘重新加载错题库（外部改动了数据文件时按 R 刷新）
    pub fn reload(&mut self) {
        let outcome = self.store.load();
        self.bank = outcome.bank;
        if let Some(w) = outcome.warning {
            self.error = Some(w);
        }
        if self.bank.is_empty() {
            self.bank_list.select(None);
        } else {
            match self.bank_list.selected() {
                Some(sel) if sel < self.bank.len() => {}
                _ => self.bank_list.select(Some(0)),
            }
        }
    }

    fn persist(&mut self) {
        if let Err(e) = self.store.save(&self.bank) {
            tracing::error!("保存错题库失败: {:#}", e);
            self.error = Some(SAVE_FAILED.into());
        }
    }

    // ---------------- 上传与识别 ----------------

    /// 读入图片文件并清掉上一次的识别结果和残留错误
    pub fn set_image_from_path(&mut self, path: &Path) {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "jpg" | "jpeg" | "png" | "webp" | "gif") {
            self.error = Some("仅支持 jpg/jpeg/png/webp/gif 图片。".into());
            return;
        }
        match fs::read(path) {
            Ok(bytes) => {
                self.uploaded_image = Some(UploadedImage {
                    path: path.to_path_buf(),
                    bytes,
                });
                self.extracted.clear();
                self.error = None;
            }
            Err(e) => {
                tracing::warn!("读取图片失败: {}: {}", path.display(), e);
                self.error = Some(format!("无法读取图片: {}", path.display()));
            }
        }
    }

    /// 前置条件满足时返回待识别的图片字节；否则置错误横幅、不触发网关
    pub fn begin_extract(&mut self) -> Option<Vec<u8>> {
        let Some(img) = self.uploaded_image.as_ref() else {
            self.error = Some("请先上传一张图片。".into());
            return None;
        };
        self.busy = true;
        self.busy_message = "正在识别题目...".into();
        self.error = None;
        Some(img.bytes.clone())
    }

    /// 识别结果入库：按题目文本去重，保持到达顺序，随后清空缓冲并切到错题库
    pub fn add_extracted_to_bank(&mut self) {
        let fresh: Vec<Question> = self
            .extracted
            .drain(..)
            .filter(|eq| !self.bank.iter().any(|bq| bq.question_text == eq.question_text))
            .collect();
        if !fresh.is_empty() {
            self.bank.extend(fresh);
            self.persist();
        }
        self.uploaded_image = None;
        self.tab = Tab::Bank;
        if self.bank_list.selected().is_none() && !self.bank.is_empty() {
            self.bank_list.select(Some(0));
        }
    }

    // ---------------- 错题库 ----------------

    pub fn selected_bank_question(&self) -> Option<&Question> {
        self.bank.get(self.bank_list.selected()?)
    }

    pub fn move_bank_selection(&mut self, delta: isize) {
        if self.bank.is_empty() {
            self.bank_list.select(None);
            return;
        }
        let cur = self.bank_list.selected().unwrap_or(0) as isize;
        let next = (cur + delta).clamp(0, self.bank.len() as isize - 1);
        self.bank_list.select(Some(next as usize));
    }

    /// 按 id 删除恰好一条；id 不存在则是空操作。无确认步骤
    pub fn delete_question(&mut self, id: &str) {
        let before = self.bank.len();
        self.bank.retain(|q| q.id != id);
        if self.bank.len() != before {
            self.persist();
        }
        if self.bank.is_empty() {
            self.bank_list.select(None);
        } else if let Some(sel) = self.bank_list.selected() {
            if sel >= self.bank.len() {
                self.bank_list.select(Some(self.bank.len() - 1));
            }
        }
    }

    pub fn delete_selected_question(&mut self) {
        if let Some(id) = self.selected_bank_question().map(|q| q.id.clone()) {
            self.delete_question(&id);
        }
    }

    // ---------------- 分析与练习 ----------------

    pub fn begin_analysis(&mut self) -> Option<Vec<Question>> {
        if self.bank.is_empty() {
            self.error = Some("错题库为空，请先添加错题。".into());
            return None;
        }
        self.busy = true;
        self.busy_message = "正在分析知识点...".into();
        self.error = None;
        Some(self.bank.clone())
    }

    /// 前置条件：已有分析结果。不满足时除横幅外还切到分析页引导用户
    pub fn begin_generate(&mut self) -> Option<Vec<KnowledgePoint>> {
        if self.analysis.is_empty() {
            self.error = Some("请先进行知识点分析。".into());
            self.tab = Tab::Analysis;
            return None;
        }
        self.busy = true;
        self.busy_message = "正在生成练习题...".into();
        self.error = None;
        Some(self.analysis.clone())
    }

    pub fn toggle_answer(&mut self, id: &str) {
        if !self.revealed.remove(id) {
            self.revealed.insert(id.to_string());
        }
    }

    pub fn toggle_selected_answer(&mut self) {
        if let Some(id) = self.practice.get(self.practice_sel).map(|q| q.id.clone()) {
            self.toggle_answer(&id);
        }
    }

    pub fn move_practice_selection(&mut self, delta: isize) {
        if self.practice.is_empty() {
            return;
        }
        let next = (self.practice_sel as isize + delta)
            .clamp(0, self.practice.len() as isize - 1);
        self.practice_sel = next as usize;
    }

    // ---------------- 辅导对话 ----------------

    /// 打开对话：清空旧会话，立即发起首轮流式请求
    pub fn open_chat(&mut self, question: Question) -> (u64, Vec<WireMessage>) {
        self.chat_session_seq += 1;
        let session = self.chat_session_seq;
        let wire = ModelGateway::chat_context(&question);
        self.chat = Some(ChatState {
            question,
            // 预置一条空的 AI 消息，流式片段陆续填充
            transcript: vec![ChatMessage { sender: Sender::Ai, text: String::new() }],
            wire: wire.clone(),
            busy: true,
            session,
            scroll: 0,
            opening: true,
        });
        self.chat_input = TextArea::default();
        (session, wire)
    }

    pub fn open_chat_selected(&mut self) -> Option<(u64, Vec<WireMessage>)> {
        let q = self.selected_bank_question()?.clone();
        Some(self.open_chat(q))
    }

    /// 发送一条用户消息：同步追加到对话记录，再发起流式轮次
    pub fn chat_send(&mut self) -> Option<(u64, Vec<WireMessage>)> {
        let text = self.chat_input.lines().join("\n").trim().to_string();
        if text.is_empty() {
            return None;
        }
        let chat = self.chat.as_mut()?;
        if chat.busy {
            return None;
        }
        chat.transcript.push(ChatMessage { sender: Sender::User, text: text.clone() });
        chat.transcript.push(ChatMessage { sender: Sender::Ai, text: String::new() });
        chat.wire.push(WireMessage::user(text));
        chat.busy = true;
        self.chat_input = TextArea::default();
        Some((chat.session, chat.wire.clone()))
    }

    /// 关闭即丢弃：会话整体置空，迟到的流式事件在 apply_event 里直接作废；
    /// 下次打开对话时会话号才前进一格
    pub fn close_chat(&mut self) {
        self.chat = None;
        self.chat_input = TextArea::default();
    }

    // ---------------- 异步结果折叠 ----------------

    pub fn apply_event(&mut self, ev: AppEvent) {
        match ev {
            AppEvent::ExtractFinished(result) => {
                self.busy = false;
                match result {
                    Ok(questions) => self.extracted = questions,
                    Err(e) => {
                        tracing::error!("识别错题失败: {}", e);
                        self.error =
                            Some("无法从图片中提取题目，请确保图片清晰并重试。".into());
                    }
                }
            }
            AppEvent::AnalysisFinished(result) => {
                self.busy = false;
                match result {
                    Ok(points) => {
                        self.analysis = points;
                        self.analysis_scroll = 0;
                        self.tab = Tab::Analysis;
                    }
                    Err(e) => {
                        tracing::error!("知识点分析失败: {}", e);
                        self.error = Some("生成知识点分析失败，请稍后重试。".into());
                    }
                }
            }
            AppEvent::PracticeFinished(result) => {
                self.busy = false;
                match result {
                    Ok(test) => {
                        self.practice = test;
                        self.revealed.clear();
                        self.practice_sel = 0;
                        self.tab = Tab::Practice;
                    }
                    Err(e) => {
                        tracing::error!("生成练习失败: {}", e);
                        self.error = Some("生成巩固练习失败，请稍后重试。".into());
                    }
                }
            }
            AppEvent::ChatChunk { session, delta } => {
                let Some(chat) = self.chat.as_mut() else { return };
                if chat.session != session {
                    return;
                }
                match chat.transcript.last_mut() {
                    Some(msg) if msg.sender == Sender::Ai => msg.text.push_str(&delta),
                    _ => chat
                        .transcript
                        .push(ChatMessage { sender: Sender::Ai, text: delta }),
                }
            }
            AppEvent::ChatTurnFinished { session, result } => {
                let Some(chat) = self.chat.as_mut() else { return };
                if chat.session != session {
                    return;
                }
                chat.busy = false;
                let was_opening = chat.opening;
                chat.opening = false;
                match result {
                    Ok(full) => {
                        if let Some(msg) = chat.transcript.last_mut() {
                            if msg.sender == Sender::Ai {
                                msg.text = full.clone();
                            }
                        }
                        chat.wire.push(WireMessage::assistant(full));
                    }
                    Err(e) => {
                        tracing::error!("辅导对话轮次失败: {}", e);
                        if was_opening {
                            chat.transcript = vec![ChatMessage {
                                sender: Sender::Ai,
                                text: "抱歉，我现在无法开始辅导。请稍后再试。".into(),
                            }];
                        } else {
                            let apology = "抱歉，我好像遇到了一些问题，请稍后再试。";
                            match chat.transcript.last_mut() {
                                // 流一个片段都没来：直接把占位消息换成道歉
                                Some(msg) if msg.sender == Sender::Ai && msg.text.is_empty() => {
                                    msg.text = apology.into();
                                }
                                _ => chat.transcript.push(ChatMessage {
                                    sender: Sender::Ai,
                                    text: apology.into(),
                                }),
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::new_question_id;

    fn mk_app(dir: &tempfile::TempDir) -> App {
        App::new(BankStore::open(dir.path().join("bank.json")))
    }

    fn q(text: &str) -> Question {
        Question {
            id: new_question_id(),
            subject: "数学".into(),
            question_text: text.into(),
        }
    }

    fn net_err() -> GatewayError {
        GatewayError::BadPayload("模拟故障".into())
    }

    #[test]
    fn fresh_app_starts_with_seed_bank() {
        let dir = tempfile::tempdir().unwrap();
        let app = mk_app(&dir);
        assert_eq!(app.bank.len(), 3);
        assert_eq!(app.tab, Tab::Upload);
        assert!(app.error.is_none());
    }

    #[test]
    fn extract_without_image_sets_precondition_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        assert!(app.begin_extract().is_none());
        assert_eq!(app.error.as_deref(), Some("请先上传一张图片。"));
        assert!(!app.busy);
    }

    #[test]
    fn add_to_bank_dedupes_on_question_text() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let existing_text = app.bank[0].question_text.clone();
        app.extracted = vec![q(&existing_text), q("全新的一道题")];
        app.add_extracted_to_bank();
        assert_eq!(app.bank.len(), 4);
        assert_eq!(app.bank.last().unwrap().question_text, "全新的一道题");
        assert!(app.extracted.is_empty());
        assert!(app.uploaded_image.is_none());
        assert_eq!(app.tab, Tab::Bank);
    }

    #[test]
    fn add_to_bank_preserves_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        app.extracted = vec![q("甲"), q("乙"), q("丙")];
        app.add_extracted_to_bank();
        let tail: Vec<&str> = app.bank[3..].iter().map(|x| x.question_text.as_str()).collect();
        assert_eq!(tail, ["甲", "乙", "丙"]);
    }

    #[test]
    fn delete_removes_exactly_one_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let victim = app.bank[1].id.clone();
        let first = app.bank[0].id.clone();
        let last = app.bank[2].id.clone();
        app.delete_question(&victim);
        assert_eq!(app.bank.len(), 2);
        assert_eq!(app.bank[0].id, first);
        assert_eq!(app.bank[1].id, last);
        // 不存在的 id 是空操作
        app.delete_question("没有这个id");
        assert_eq!(app.bank.len(), 2);
    }

    #[test]
    fn analyze_on_empty_bank_never_reaches_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        for id in app.bank.iter().map(|x| x.id.clone()).collect::<Vec<_>>() {
            app.delete_question(&id);
        }
        assert!(app.begin_analysis().is_none());
        assert_eq!(app.error.as_deref(), Some("错题库为空，请先添加错题。"));
        assert!(!app.busy);
    }

    #[test]
    fn generate_without_analysis_redirects_to_analysis_tab() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        app.tab = Tab::Bank;
        assert!(app.begin_generate().is_none());
        assert_eq!(app.error.as_deref(), Some("请先进行知识点分析。"));
        assert_eq!(app.tab, Tab::Analysis);
    }

    #[test]
    fn failed_extraction_keeps_prior_results_and_clears_busy() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        app.extracted = vec![q("旧结果")];
        app.busy = true;
        app.apply_event(AppEvent::ExtractFinished(Err(net_err())));
        assert!(!app.busy);
        assert_eq!(app.extracted.len(), 1);
        assert_eq!(
            app.error.as_deref(),
            Some("无法从图片中提取题目，请确保图片清晰并重试。")
        );
    }

    #[test]
    fn analysis_success_switches_tab() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let snapshot = app.begin_analysis().unwrap();
        assert!(app.busy);
        app.apply_event(AppEvent::AnalysisFinished(Ok(vec![KnowledgePoint {
            title: "三角函数".into(),
            description: String::new(),
            relevant_question_ids: snapshot.iter().map(|x| x.id.clone()).collect(),
        }])));
        assert!(!app.busy);
        assert_eq!(app.tab, Tab::Analysis);
        assert_eq!(app.analysis.len(), 1);
    }

    #[test]
    fn chat_chunks_accumulate_into_single_growing_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let (session, _) = app.open_chat(q("解方程"));
        let mut seen = Vec::new();
        for delta in ["Hel", "lo", " world"] {
            app.apply_event(AppEvent::ChatChunk { session, delta: delta.into() });
            seen.push(app.chat.as_ref().unwrap().transcript.last().unwrap().text.clone());
        }
        let chat = app.chat.as_ref().unwrap();
        assert_eq!(chat.transcript.len(), 1);
        assert_eq!(chat.transcript[0].text, "Hello world");
        // 中间渲染单调增长
        assert_eq!(seen, ["Hel", "Hello", "Hello world"]);
        app.apply_event(AppEvent::ChatTurnFinished {
            session,
            result: Ok("Hello world".into()),
        });
        let chat = app.chat.as_ref().unwrap();
        assert!(!chat.busy);
        assert_eq!(chat.wire.last().unwrap().role, "assistant");
    }

    #[test]
    fn stale_session_chunks_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let (old_session, _) = app.open_chat(q("第一题"));
        app.close_chat();
        let (new_session, _) = app.open_chat(q("第二题"));
        app.apply_event(AppEvent::ChatChunk { session: old_session, delta: "迟到".into() });
        assert_eq!(app.chat.as_ref().unwrap().transcript[0].text, "");
        app.apply_event(AppEvent::ChatChunk { session: new_session, delta: "你好".into() });
        assert_eq!(app.chat.as_ref().unwrap().transcript[0].text, "你好");
    }

    #[test]
    fn reopening_chat_starts_with_fresh_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let question = q("同一道题");
        let (session, _) = app.open_chat(question.clone());
        app.apply_event(AppEvent::ChatChunk { session, delta: "第一次会话".into() });
        app.close_chat();
        assert!(app.chat.is_none());
        let (_, wire) = app.open_chat(question);
        let chat = app.chat.as_ref().unwrap();
        assert_eq!(chat.transcript.len(), 1);
        assert_eq!(chat.transcript[0].text, "");
        // 模型侧上下文也重新开始：system + 首条用户消息
        assert_eq!(wire.len(), 2);
    }

    #[test]
    fn chat_turn_failure_appends_apology_keeping_user_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let (session, _) = app.open_chat(q("解方程"));
        app.apply_event(AppEvent::ChatTurnFinished { session, result: Ok("讲解".into()) });
        app.chat_input.insert_str("为什么要移项？");
        let (session, _) = app.chat_send().unwrap();
        app.apply_event(AppEvent::ChatTurnFinished { session, result: Err(net_err()) });
        let chat = app.chat.as_ref().unwrap();
        let texts: Vec<&str> = chat.transcript.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(
            texts,
            ["讲解", "为什么要移项？", "抱歉，我好像遇到了一些问题，请稍后再试。"]
        );
    }

    #[test]
    fn chat_open_failure_replaces_transcript_with_apology() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let (session, _) = app.open_chat(q("解方程"));
        app.apply_event(AppEvent::ChatTurnFinished { session, result: Err(net_err()) });
        let chat = app.chat.as_ref().unwrap();
        assert_eq!(chat.transcript.len(), 1);
        assert_eq!(chat.transcript[0].text, "抱歉，我现在无法开始辅导。请稍后再试。");
    }

    #[test]
    fn chat_send_is_blocked_while_turn_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        let _ = app.open_chat(q("解方程"));
        app.chat_input.insert_str("等不及了");
        assert!(app.chat_send().is_none());
    }

    #[test]
    fn answer_reveal_is_a_per_item_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = mk_app(&dir);
        app.toggle_answer("p-1");
        assert!(app.revealed.contains("p-1"));
        app.toggle_answer("p-1");
        assert!(!app.revealed.contains("p-1"));
    }
}
