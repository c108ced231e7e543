// AI 错题本 TUI
// 功能：
// - 指定一张批改过的试卷照片，调用多模态模型识别标记为错误的题目
// - 错题存入本地 JSON 错题库（首次运行内置三道种子题）
// - 一键生成知识点分析与 3-5 道巩固练习
// - 对任意错题打开流式的"错题精讲"辅导对话
// 界面单线程；网关调用跑在 tokio 上，结果经 channel 回到事件循环

mod gateway;
mod markdown;
mod state;
mod store;
mod ui;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing_subscriber::EnvFilter;

use crate::gateway::{GatewayConfig, KnowledgePoint, ModelGateway, WireMessage};
use crate::state::{App, AppEvent, Tab};
use crate::store::{resolve_data_path, BankStore, Question};
use crate::ui::{theme_of, ThemeKind};

#[derive(Debug, Clone, Parser)]
#[command(name = "cuotiben-tui", about = "AI 错题本 TUI 工具", version)]
struct Cli {
    /// 错题库数据文件路径，默认平台数据目录或环境变量 CUOTIBEN_DATA
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,

    /// 配置文件路径（[api] 接口设置 / [keys] 按键绑定）
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// 主题（外观）：dark | light
    #[arg(long = "theme", value_enum, default_value = "dark")]
    theme: ThemeKind,
}

// ---------------- 配置文件 ----------------

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    api: ApiSection,
    #[serde(default)]
    keys: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    base_url: Option<String>,
    vision_model: Option<String>,
    chat_model: Option<String>,
    timeout_secs: Option<u64>,
}

fn load_config(flag: Option<PathBuf>) -> ConfigFile {
    // 探测顺序：--config 参数 > CUOTIBEN_CONFIG > 当前目录 > 平台配置目录
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = flag {
        candidates.push(p);
    }
    if let Ok(envp) = std::env::var("CUOTIBEN_CONFIG") {
        candidates.push(PathBuf::from(envp));
    }
    candidates.push(PathBuf::from("cuotiben.toml"));
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("cuotiben").join("config.toml"));
    }
    for p in candidates {
        if !p.exists() {
            continue;
        }
        match fs::read_to_string(&p)
            .map_err(anyhow::Error::from)
            .and_then(|s| toml::from_str::<ConfigFile>(&s).map_err(anyhow::Error::from))
        {
            Ok(cfg) => {
                tracing::info!("使用配置文件: {}", p.display());
                return cfg;
            }
            Err(e) => {
                tracing::warn!("解析配置文件失败: {}: {:#}", p.display(), e);
                return ConfigFile::default();
            }
        }
    }
    ConfigFile::default()
}

// ---------------- 按键绑定 ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyAction {
    EditPath,
    Extract,
    AddToBank,
    Analyze,
    GeneratePractice,
    DeleteQuestion,
    OpenChat,
    ToggleAnswer,
    Reload,
    DismissError,
}

fn action_from_str(s: &str) -> Option<KeyAction> {
    use KeyAction::*;
    Some(match s {
        "edit_path" => EditPath,
        "extract" => Extract,
        "add_to_bank" => AddToBank,
        "analyze" => Analyze,
        "generate_practice" => GeneratePractice,
        "delete_question" => DeleteQuestion,
        "open_chat" => OpenChat,
        "toggle_answer" => ToggleAnswer,
        "reload" => Reload,
        "dismiss_error" => DismissError,
        _ => return None,
    })
}

fn parse_keymap(map: HashMap<String, String>) -> HashMap<char, KeyAction> {
    let mut out = HashMap::new();
    for (k, v) in map {
        if k.chars().count() == 1 {
            if let (Some(ch), Some(act)) = (k.chars().next(), action_from_str(&v)) {
                out.insert(ch, act);
            }
        }
    }
    if out.is_empty() {
        out = default_keymap();
    }
    out
}

fn default_keymap() -> HashMap<char, KeyAction> {
    use KeyAction::*;
    let mut m = HashMap::new();
    m.insert('i', EditPath);
    m.insert('r', Extract);
    m.insert('s', AddToBank);
    m.insert('z', Analyze);
    m.insert('g', GeneratePractice);
    m.insert('d', DeleteQuestion);
    m.insert('t', OpenChat);
    m.insert('a', ToggleAnswer);
    m.insert('R', Reload); // 大写 R
    m.insert('x', DismissError);
    m
}

// ---------------- 异步任务派发 ----------------

/// 网关调用跑在 tokio 运行时上，完成后把 AppEvent 投回事件循环
struct Jobs {
    rt: tokio::runtime::Runtime,
    gateway: Arc<ModelGateway>,
    tx: UnboundedSender<AppEvent>,
}

impl Jobs {
    fn new(gateway: Arc<ModelGateway>, tx: UnboundedSender<AppEvent>) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .context("初始化异步运行时失败")?;
        Ok(Self { rt, gateway, tx })
    }

    fn extract(&self, image: Vec<u8>) {
        let gw = self.gateway.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let result = gw.extract_questions(&image).await;
            let _ = tx.send(AppEvent::ExtractFinished(result));
        });
    }

    fn analyze(&self, bank: Vec<Question>) {
        let gw = self.gateway.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let result = gw.analyze_knowledge_points(&bank).await;
            let _ = tx.send(AppEvent::AnalysisFinished(result));
        });
    }

    fn generate(&self, analysis: Vec<KnowledgePoint>) {
        let gw = self.gateway.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let result = gw.generate_practice_test(&analysis).await;
            let _ = tx.send(AppEvent::PracticeFinished(result));
        });
    }

    fn chat_turn(&self, session: u64, wire: Vec<WireMessage>) {
        let gw = self.gateway.clone();
        let tx = self.tx.clone();
        self.rt.spawn(async move {
            let chunk_tx = tx.clone();
            let result = gw
                .chat_turn(&wire, |delta| {
                    let _ = chunk_tx.send(AppEvent::ChatChunk {
                        session,
                        delta: delta.to_string(),
                    });
                })
                .await;
            let _ = tx.send(AppEvent::ChatTurnFinished { session, result });
        });
    }
}

// ---------------- 启动 ----------------

fn init_logging(data_path: &Path) -> Result<()> {
    // TUI 独占终端，日志写到数据目录下按日期命名的文件
    let dir = data_path
        .parent()
        .map(|p| p.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    fs::create_dir_all(&dir)?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("cuotiben-{}.log", Local::now().format("%Y%m%d"))))?;
    let filter =
        EnvFilter::try_from_env("CUOTIBEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_path = resolve_data_path(cli.file.clone());
    init_logging(&data_path)?;

    // 唯一的机密：模型接口密钥。缺失是致命启动错误
    let api_key = std::env::var("CUOTIBEN_API_KEY").map_err(|_| {
        anyhow::anyhow!("缺少环境变量 CUOTIBEN_API_KEY（模型接口密钥），无法启动。")
    })?;

    let config = load_config(cli.config.clone());
    let mut gw_cfg = GatewayConfig::new(api_key);
    if let Some(v) = config.api.base_url {
        gw_cfg.base_url = v;
    }
    if let Some(v) = config.api.vision_model {
        gw_cfg.vision_model = v;
    }
    if let Some(v) = config.api.chat_model {
        gw_cfg.chat_model = v;
    }
    if let Some(v) = config.api.timeout_secs {
        gw_cfg.timeout_secs = v;
    }
    let gateway = Arc::new(ModelGateway::new(gw_cfg).context("初始化模型网关失败")?);
    let keymap = parse_keymap(config.keys);

    let (tx, rx) = mpsc::unbounded_channel();
    let jobs = Jobs::new(gateway, tx)?;
    let mut app = App::new(BankStore::open(data_path));
    let theme = theme_of(cli.theme);

    // TUI 初始化
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app, &jobs, &keymap, theme, rx);

    // 退出还原
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    res
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    jobs: &Jobs,
    keymap: &HashMap<char, KeyAction>,
    theme: ui::Theme,
    mut rx: UnboundedReceiver<AppEvent>,
) -> Result<()> {
    loop {
        // 先折叠异步结果再重绘，流式片段每条触发一次刷新
        while let Ok(ev) = rx.try_recv() {
            app.apply_event(ev);
        }
        terminal.draw(|f| ui::ui(f, app, theme))?;
        if event::poll(Duration::from_millis(100))? {
            match event::read()? {
                Event::Key(k) => {
                    if handle_key(app, jobs, keymap, k) {
                        break;
                    }
                }
                _ => {}
            }
        }
        if app.should_quit {
            break;
        }
    }
    Ok(())
}

// ---------------- 按键处理 ----------------

/// 返回 true 表示退出程序
fn handle_key(
    app: &mut App,
    jobs: &Jobs,
    keymap: &HashMap<char, KeyAction>,
    k: KeyEvent,
) -> bool {
    if k.code == KeyCode::Char('c') && k.modifiers.contains(KeyModifiers::CONTROL) {
        return true;
    }
    // 对话弹窗打开时，按键全部交给弹窗
    if app.chat.is_some() {
        handle_chat_key(app, jobs, k);
        return false;
    }
    // 路径输入模式
    if app.path_editing {
        handle_path_key(app, k);
        return false;
    }
    match k.code {
        KeyCode::Char('q') => return true,
        KeyCode::Char('1') => app.select_tab(Tab::Upload),
        KeyCode::Char('2') => app.select_tab(Tab::Bank),
        KeyCode::Char('3') => app.select_tab(Tab::Analysis),
        KeyCode::Char('4') => app.select_tab(Tab::Practice),
        KeyCode::Tab => {
            let idx = Tab::ALL.iter().position(|t| *t == app.tab).unwrap_or(0);
            app.select_tab(Tab::ALL[(idx + 1) % Tab::ALL.len()]);
        }
        KeyCode::Down | KeyCode::Char('j') => move_in_tab(app, 1),
        KeyCode::Up | KeyCode::Char('k') => move_in_tab(app, -1),
        KeyCode::Enter => {
            if app.tab == Tab::Upload && !app.extracted.is_empty() {
                app.add_extracted_to_bank();
            }
        }
        KeyCode::Char(c) => {
            if let Some(action) = keymap.get(&c).copied() {
                apply_action(app, jobs, action);
            }
        }
        _ => {}
    }
    false
}

fn move_in_tab(app: &mut App, delta: isize) {
    match app.tab {
        Tab::Bank => app.move_bank_selection(delta),
        Tab::Practice => app.move_practice_selection(delta),
        Tab::Analysis => {
            app.analysis_scroll = if delta > 0 {
                app.analysis_scroll.saturating_add(1)
            } else {
                app.analysis_scroll.saturating_sub(1)
            };
        }
        Tab::Upload => {}
    }
}

fn apply_action(app: &mut App, jobs: &Jobs, action: KeyAction) {
    use KeyAction::*;
    match action {
        EditPath => {
            if app.tab == Tab::Upload {
                app.path_editing = true;
            }
        }
        Extract => {
            if let Some(bytes) = app.begin_extract() {
                jobs.extract(bytes);
            }
        }
        AddToBank => {
            if !app.extracted.is_empty() {
                app.add_extracted_to_bank();
            }
        }
        Analyze => {
            if let Some(bank) = app.begin_analysis() {
                jobs.analyze(bank);
            }
        }
        GeneratePractice => {
            if let Some(analysis) = app.begin_generate() {
                jobs.generate(analysis);
            }
        }
        DeleteQuestion => {
            if app.tab == Tab::Bank {
                app.delete_selected_question();
            }
        }
        OpenChat => {
            if app.tab == Tab::Bank {
                if let Some((session, wire)) = app.open_chat_selected() {
                    jobs.chat_turn(session, wire);
                }
            }
        }
        ToggleAnswer => {
            if app.tab == Tab::Practice {
                app.toggle_selected_answer();
            }
        }
        Reload => app.reload(),
        DismissError => app.dismiss_error(),
    }
}

fn handle_path_key(app: &mut App, k: KeyEvent) {
    match k.code {
        KeyCode::Esc => app.path_editing = false,
        KeyCode::Enter => {
            let path = app.path_input.lines().join("").trim().to_string();
            app.path_editing = false;
            if !path.is_empty() {
                app.set_image_from_path(Path::new(&path));
            }
        }
        _ => {
            if let Some(input) = textarea_input(&k) {
                app.path_input.input(input);
            }
        }
    }
}

fn handle_chat_key(app: &mut App, jobs: &Jobs, k: KeyEvent) {
    let busy = app.chat.as_ref().map(|c| c.busy).unwrap_or(false);
    match k.code {
        KeyCode::Esc => app.close_chat(),
        KeyCode::Up => {
            if let Some(chat) = app.chat.as_mut() {
                chat.scroll = chat.scroll.saturating_add(1);
            }
        }
        KeyCode::Down => {
            if let Some(chat) = app.chat.as_mut() {
                chat.scroll = chat.scroll.saturating_sub(1);
            }
        }
        KeyCode::Enter => {
            if let Some((session, wire)) = app.chat_send() {
                if let Some(chat) = app.chat.as_mut() {
                    chat.scroll = 0;
                }
                jobs.chat_turn(session, wire);
            }
        }
        _ => {
            // 回复流式进行中禁用输入
            if !busy {
                if let Some(input) = textarea_input(&k) {
                    app.chat_input.input(input);
                }
            }
        }
    }
}

/// 把 crossterm 按键转成 tui-textarea 的输入（只映射编辑需要的键）
fn textarea_input(k: &KeyEvent) -> Option<tui_textarea::Input> {
    use tui_textarea::{Input, Key};
    let key = match k.code {
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Delete => Key::Delete,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        _ => return None,
    };
    Some(Input {
        key,
        ctrl: k.modifiers.contains(KeyModifiers::CONTROL),
        alt: k.modifiers.contains(KeyModifiers::ALT),
        shift: k.modifiers.contains(KeyModifiers::SHIFT),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keymap_falls_back_to_defaults_when_empty() {
        let m = parse_keymap(HashMap::new());
        assert_eq!(m.get(&'r'), Some(&KeyAction::Extract));
        assert_eq!(m.get(&'z'), Some(&KeyAction::Analyze));
    }

    #[test]
    fn keymap_overrides_parse_single_chars_only() {
        let mut raw = HashMap::new();
        raw.insert("e".to_string(), "extract".to_string());
        raw.insert("xx".to_string(), "analyze".to_string());
        raw.insert("y".to_string(), "不认识的动作".to_string());
        let m = parse_keymap(raw);
        assert_eq!(m.get(&'e'), Some(&KeyAction::Extract));
        assert!(m.get(&'y').is_none());
        assert!(!m.values().any(|a| *a == KeyAction::Analyze));
    }
}
