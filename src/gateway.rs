// 模型网关：所有对外部大模型的调用都经过这里
// 走 OpenAI 兼容的 chat/completions 接口（Bearer 鉴权）：
// - extract_questions：图片(base64 data URL) → 错题 JSON 数组
// - analyze_knowledge_points：错题库 → 知识点 JSON 数组（解析失败走"分析失败"软路径）
// - generate_practice_test：知识点摘要 → 3-5 道练习题 JSON 数组
// - chat_turn：SSE 流式辅导对话，增量回调每个文本片段
// 响应体的解析全部拆成纯函数，便于离线测试

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{new_question_id, Question};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PracticeQuestion {
    pub id: String,
    #[serde(rename = "questionText", default)]
    pub question_text: String,
    #[serde(rename = "answerText", default)]
    pub answer_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgePoint {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 弱引用：题目删除后允许悬空，渲染时按 id 查不到就跳过
    #[serde(rename = "relevantQuestionIds", default)]
    pub relevant_question_ids: Vec<String>,
}

/// 发送给模型的对话消息（OpenAI 格式）
#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: String,
}

impl WireMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system", content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user", content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant", content: content.into() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("网络请求失败: {0}")]
    Network(#[from] reqwest::Error),
    #[error("模型接口返回 {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("模型响应格式异常: {0}")]
    BadPayload(String),
    #[error("等待模型响应超时")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// 多模态模型：错题识别（图片输入）
    pub vision_model: String,
    /// 文本模型：分析 / 出题 / 辅导对话
    pub chat_model: String,
    pub timeout_secs: u64,
}

impl GatewayConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            base_url: "https://api.siliconflow.cn/v1".into(),
            api_key,
            vision_model: "zai-org/GLM-4.6V".into(),
            chat_model: "Qwen/Qwen3-8B".into(),
            timeout_secs: 120,
        }
    }
}

pub struct ModelGateway {
    client: Client,
    cfg: GatewayConfig,
}

// ---------------- 提示词 ----------------

const EXTRACT_PROMPT: &str = "你是一位经验丰富的中国高中老师。请仔细分析这张图片中的试卷。识别出所有标记为错误的题目（通常有红叉或圈）。将这些错题提取出来，并以JSON数组的格式返回。每个对象应包含 'subject' (例如 '数学', '物理', '语文') 和 'questionText' (完整的题目文本，包括选项)。请忽略图片中的其他内容，只关注错题。如果图片中没有明显的错题，请返回一个空数组。";

const JSON_ARRAY_INSTRUCTION: &str = "**重要：你必须只返回纯净的JSON数组，不要添加任何解释文字、markdown标记或其他内容。**\n响应必须以 [ 开始，以 ] 结束，字符串值用双引号包围，特殊字符正确转义。";

const CHAT_SYSTEM_PROMPT: &str = "你是一位耐心、知识渊博的高中辅导老师。你的目标是清晰地解释概念，并引导学生找到答案，而不是直接给出答案。请用中文回答。所有数学公式都必须使用LaTeX格式（行内用 $...$ ，块级用 $$...$$）。";

/// 打开辅导对话时的首条用户消息
pub fn chat_opening_message(question: &Question) -> String {
    format!(
        "你好，这是一道我做错的题，可以请你帮我看看吗？\n\n题目：{}",
        question.question_text
    )
}

fn analyze_prompt(bank: &[Question]) -> String {
    let listing = bank
        .iter()
        .map(|q| format!("- id: {} [{}] {}", q.id, q.subject, q.question_text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "你是一位资深的教学分析专家。这里有一系列学生做错的高中题目（每道题带有唯一 id）：\n{listing}\n\n请分析这些题目，总结出背后考察的核心知识点和能力短板，并以JSON数组的格式返回。每个对象应包含 'title' (知识点名称)、'description' (该知识点的薄弱原因与复习建议，可使用Markdown与LaTeX) 和 'relevantQuestionIds' (与该知识点相关的题目 id 数组)。\n\n{JSON_ARRAY_INSTRUCTION}"
    )
}

fn generate_prompt(analysis: &[KnowledgePoint]) -> String {
    let digest = analysis
        .iter()
        .map(|p| format!("- {}：{}", p.title, p.description))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "你是一位出题专家。根据以下这份知识点分析，请为一名高中生出一套包含3-5道题目的新练习题，旨在巩固这些薄弱的知识点。为每道题提供详细的步骤和解析，并以JSON数组的格式返回。每个对象应包含 'questionText' (题目) 和 'answerText' (详解答案)。\n\n知识点分析:\n{digest}\n\n{JSON_ARRAY_INSTRUCTION}"
    )
}

// ---------------- 网关实现 ----------------

impl ModelGateway {
    pub fn new(cfg: GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { client, cfg })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.cfg.base_url.trim_end_matches('/'))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_secs)
    }

    /// 非流式调用，返回 choices[0].message.content
    async fn complete(&self, model: &str, messages: Value) -> Result<String, GatewayError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "temperature": 0.3,
        });
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.cfg.api_key)
            .timeout(self.timeout())
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api { status, body });
        }
        let v: Value = resp.json().await?;
        let content = v["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::BadPayload("响应中缺少 message.content".into()))?;
        Ok(content.to_string())
    }

    /// 图片 → 错题列表。非数组响应按"没有识别到错题"处理，返回空列表
    pub async fn extract_questions(&self, image: &[u8]) -> Result<Vec<Question>, GatewayError> {
        let format = detect_image_format(image);
        let data_url = format!("data:image/{};base64,{}", format, BASE64.encode(image));
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": format!("{EXTRACT_PROMPT}\n\n{JSON_ARRAY_INSTRUCTION}") },
                { "type": "image_url", "image_url": { "url": data_url } },
            ],
        }]);
        let content = self.complete(&self.cfg.vision_model, messages).await?;
        tracing::debug!("识别原始响应: {}", content);
        Ok(parse_extracted(&content))
    }

    /// 错题库 → 知识点分析。调用前提（非空错题库）由调用方保证
    pub async fn analyze_knowledge_points(
        &self,
        bank: &[Question],
    ) -> Result<Vec<KnowledgePoint>, GatewayError> {
        let messages = json!([{ "role": "user", "content": analyze_prompt(bank) }]);
        let content = self.complete(&self.cfg.chat_model, messages).await?;
        tracing::debug!("分析原始响应: {}", content);
        Ok(parse_analysis(&content, bank))
    }

    /// 知识点分析 → 巩固练习
    pub async fn generate_practice_test(
        &self,
        analysis: &[KnowledgePoint],
    ) -> Result<Vec<PracticeQuestion>, GatewayError> {
        let messages = json!([{ "role": "user", "content": generate_prompt(analysis) }]);
        let content = self.complete(&self.cfg.chat_model, messages).await?;
        tracing::debug!("出题原始响应: {}", content);
        Ok(parse_practice(&content))
    }

    /// 构造一次辅导对话的初始上下文（system 人设 + 引用题目的首条消息）
    pub fn chat_context(question: &Question) -> Vec<WireMessage> {
        vec![
            WireMessage::system(CHAT_SYSTEM_PROMPT),
            WireMessage::user(chat_opening_message(question)),
        ]
    }

    /// 流式对话一轮：每收到一个文本片段调用一次 on_delta，结束返回完整回复。
    /// 响应头阶段和单个片段分别应用不活动超时，避免挂死的请求把加载状态留在界面上
    pub async fn chat_turn<F>(
        &self,
        history: &[WireMessage],
        mut on_delta: F,
    ) -> Result<String, GatewayError>
    where
        F: FnMut(&str),
    {
        let body = json!({
            "model": self.cfg.chat_model,
            "messages": history,
            "stream": true,
            "temperature": 0.6,
        });
        // 等待响应头的阶段同样套超时，服务端只建连不应答时不能挂死
        let resp = tokio::time::timeout(
            self.timeout(),
            self.client
                .post(self.endpoint())
                .bearer_auth(&self.cfg.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| GatewayError::Timeout)??;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Api { status, body });
        }

        let mut stream = resp.bytes_stream();
        let mut buf = SseLineBuffer::new();
        let mut full = String::new();
        loop {
            let next = tokio::time::timeout(self.timeout(), stream.next())
                .await
                .map_err(|_| GatewayError::Timeout)?;
            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };
            for line in buf.push(&chunk) {
                match parse_sse_line(&line) {
                    SseLine::Delta(delta) => {
                        full.push_str(&delta);
                        on_delta(&delta);
                    }
                    SseLine::Done => return Ok(full),
                    SseLine::Ignore => {}
                }
            }
        }
        Ok(full)
    }
}

// ---------------- 响应解析（纯函数） ----------------

/// 常见的图片魔数；识别不了的一律按 jpeg 发送
fn detect_image_format(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else if bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP") {
        "webp"
    } else if bytes.starts_with(b"GIF8") {
        "gif"
    } else {
        "jpeg"
    }
}

/// 跨网络分块重组 SSE 行：按字节缓冲，遇到 \n 才整行解码，
/// 被分块截断的多字节字符不会被解成替换符
struct SseLineBuffer {
    buf: Vec<u8>,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// 吃进一个网络分块，吐出其中已完整的行（去掉行尾空白），尾巴留到下一次
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}

/// 剥掉 markdown 代码围栏和数组外的杂字符，只留第一个 [ 到最后一个 ] 的切片
fn clean_json_array(raw: &str) -> &str {
    let trimmed = raw.trim();
    match (trimmed.find('['), trimmed.rfind(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

pub(crate) fn parse_extracted(content: &str) -> Vec<Question> {
    let parsed: Value = match serde_json::from_str(clean_json_array(content)) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Value::Array(items) = parsed else {
        return Vec::new();
    };
    items
        .into_iter()
        .map(|item| Question {
            id: new_question_id(),
            subject: item["subject"].as_str().unwrap_or("未知科目").to_string(),
            question_text: item["questionText"]
                .as_str()
                .unwrap_or("无法识别的题目")
                .to_string(),
        })
        .collect()
}

/// 解析失败不报错，合成一个引用全部题目的"分析失败"知识点（刻意的软降级）
pub(crate) fn parse_analysis(content: &str, bank: &[Question]) -> Vec<KnowledgePoint> {
    let fallback = || {
        vec![KnowledgePoint {
            title: "分析失败".into(),
            description: "模型返回的分析内容无法解析，请稍后重试，或直接复习以下错题。".into(),
            relevant_question_ids: bank.iter().map(|q| q.id.clone()).collect(),
        }]
    };
    let parsed: Value = match serde_json::from_str(clean_json_array(content)) {
        Ok(v) => v,
        Err(_) => return fallback(),
    };
    let Value::Array(items) = parsed else {
        return fallback();
    };
    let points: Vec<KnowledgePoint> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();
    if points.is_empty() {
        fallback()
    } else {
        points
    }
}

pub(crate) fn parse_practice(content: &str) -> Vec<PracticeQuestion> {
    let parsed: Value = match serde_json::from_str(clean_json_array(content)) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let Value::Array(items) = parsed else {
        return Vec::new();
    };
    items
        .into_iter()
        .map(|item| PracticeQuestion {
            id: new_question_id(),
            question_text: item["questionText"]
                .as_str()
                .unwrap_or("无法生成的题目")
                .to_string(),
            answer_text: item["answerText"]
                .as_str()
                .unwrap_or("无法生成的答案")
                .to_string(),
        })
        .collect()
}

pub(crate) enum SseLine {
    Delta(String),
    Done,
    Ignore,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(v) = serde_json::from_str::<Value>(data) else {
        tracing::debug!("忽略无法解析的 SSE 数据: {}", data);
        return SseLine::Ignore;
    };
    match v["choices"][0]["delta"]["content"].as_str() {
        Some(delta) if !delta.is_empty() => SseLine::Delta(delta.to_string()),
        _ => SseLine::Ignore,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(id: &str, text: &str) -> Question {
        Question {
            id: id.into(),
            subject: "数学".into(),
            question_text: text.into(),
        }
    }

    #[test]
    fn extracted_items_get_fresh_ids() {
        let out = parse_extracted(r#"[{"subject":"数学","questionText":"2x=4"}]"#);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "数学");
        assert_eq!(out[0].question_text, "2x=4");
        assert!(!out[0].id.is_empty());

        let again = parse_extracted(r#"[{"subject":"数学","questionText":"2x=4"}]"#);
        assert_ne!(out[0].id, again[0].id);
    }

    #[test]
    fn extracted_tolerates_code_fences() {
        let raw = "```json\n[{\"subject\":\"物理\",\"questionText\":\"F=ma\"}]\n```";
        let out = parse_extracted(raw);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subject, "物理");
    }

    #[test]
    fn extracted_non_array_is_empty_not_error() {
        assert!(parse_extracted("识别失败，抱歉。").is_empty());
        assert!(parse_extracted(r#"{"subject":"数学"}"#).is_empty());
    }

    #[test]
    fn extracted_missing_fields_fall_back() {
        let out = parse_extracted(r#"[{}]"#);
        assert_eq!(out[0].subject, "未知科目");
        assert_eq!(out[0].question_text, "无法识别的题目");
    }

    #[test]
    fn malformed_analysis_synthesizes_failure_point() {
        let bank = vec![q("a", "题一"), q("b", "题二")];
        let out = parse_analysis("这不是JSON", &bank);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "分析失败");
        assert_eq!(out[0].relevant_question_ids, vec!["a", "b"]);
    }

    #[test]
    fn well_formed_analysis_parses_points() {
        let bank = vec![q("a", "题一")];
        let raw = r#"[{"title":"三角函数","description":"对称轴性质不熟","relevantQuestionIds":["a"]}]"#;
        let out = parse_analysis(raw, &bank);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "三角函数");
        assert_eq!(out[0].relevant_question_ids, vec!["a"]);
    }

    #[test]
    fn practice_non_array_is_empty() {
        assert!(parse_practice("出题失败").is_empty());
    }

    #[test]
    fn practice_items_parse_with_fresh_ids() {
        let raw = r#"[{"questionText":"求导 $x^2$","answerText":"$2x$"}]"#;
        let out = parse_practice(raw);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].answer_text, "$2x$");
        assert!(!out[0].id.is_empty());
    }

    #[test]
    fn sse_lines_parse_deltas_and_done() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        match parse_sse_line(line) {
            SseLine::Delta(d) => assert_eq!(d, "Hel"),
            _ => panic!("应当解析为增量片段"),
        }
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Ignore));
        assert!(matches!(parse_sse_line(""), SseLine::Ignore));
    }

    #[test]
    fn image_formats_detected_by_magic() {
        assert_eq!(detect_image_format(&[0x89, b'P', b'N', b'G', 0, 0]), "png");
        assert_eq!(detect_image_format(b"RIFF\x00\x00\x00\x00WEBPxx"), "webp");
        assert_eq!(detect_image_format(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpeg");
    }

    #[test]
    fn sse_buffer_reassembles_multibyte_split_across_chunks() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n";
        // 切在"好"三个 UTF-8 字节的中间
        let cut = payload.find('好').unwrap() + 1;
        let bytes = payload.as_bytes();
        let mut buf = SseLineBuffer::new();
        assert!(buf.push(&bytes[..cut]).is_empty());
        let lines = buf.push(&bytes[cut..]);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains('\u{FFFD}'));
        match parse_sse_line(&lines[0]) {
            SseLine::Delta(d) => assert_eq!(d, "你好"),
            _ => panic!("应当解析为增量片段"),
        }
    }

    #[tokio::test]
    async fn chat_turn_times_out_when_server_never_sends_headers() {
        // 只建连、永不应答的本地服务端
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for conn in listener.incoming() {
                if let Ok(c) = conn {
                    held.push(c);
                }
            }
        });

        let mut cfg = GatewayConfig::new("test-key".into());
        cfg.base_url = format!("http://{addr}/v1");
        cfg.timeout_secs = 1;
        let gw = ModelGateway::new(cfg).unwrap();
        let history = vec![WireMessage::user("你好")];
        let result = gw.chat_turn(&history, |_| {}).await;
        assert!(matches!(result, Err(GatewayError::Timeout)));
    }

    #[test]
    fn chat_context_quotes_question() {
        let question = q("a", "解方程 $2x=4$");
        let ctx = ModelGateway::chat_context(&question);
        assert_eq!(ctx[0].role, "system");
        assert_eq!(ctx[1].role, "user");
        assert!(ctx[1].content.contains("解方程 $2x=4$"));
    }
}
