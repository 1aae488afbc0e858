use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{unique_id, CUSTOM_PREFIX};

/**
 * \brief 内置指令提示词，对应右键菜单中的快捷操作。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinPrompt {
    pub id: &'static str,
    pub name: &'static str,
    pub template: &'static str,
}

pub const BUILTIN_PROMPTS: [BuiltinPrompt; 4] = [
    BuiltinPrompt {
        id: "answer_question",
        name: "Answer question",
        template: "Answer this question",
    },
    BuiltinPrompt {
        id: "paraphrase",
        name: "Paraphrase",
        template: "Paraphrase this text",
    },
    BuiltinPrompt {
        id: "summarize",
        name: "Summarize",
        template: "Summarize this text",
    },
    BuiltinPrompt {
        id: "analyze_qcm",
        name: "Analyze MCQ/Quiz",
        template: "This is a multiple-choice question or a quiz. Identify the correct answer(s) among \
                   the proposed options. Briefly explain your reasoning. If you are not sure, say so clearly.",
    },
];

/**
 * \brief 提示词条目（内置或用户保存），用于列表与查询。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub builtin: bool,
}

impl From<&BuiltinPrompt> for PromptTemplate {
    fn from(p: &BuiltinPrompt) -> Self {
        Self {
            id: p.id.to_string(),
            name: p.name.to_string(),
            template: p.template.to_string(),
            builtin: true,
        }
    }
}

pub fn find_prompt(id: &str) -> Option<&'static BuiltinPrompt> {
    BUILTIN_PROMPTS.iter().find(|p| p.id == id)
}

pub fn is_builtin(id: &str) -> bool {
    find_prompt(id).is_some()
}

/**
 * \brief 按 ID 查找提示词：先查内置，再查用户保存的提示词。
 */
pub fn resolve_prompt(id: &str, custom: &[PromptTemplate]) -> Option<PromptTemplate> {
    find_prompt(id)
        .map(PromptTemplate::from)
        .or_else(|| custom.iter().find(|p| p.id == id).cloned())
}

/**
 * \brief 内置提示词在前，用户提示词按保存顺序在后。
 */
pub fn all_prompts(custom: Vec<PromptTemplate>) -> Vec<PromptTemplate> {
    BUILTIN_PROMPTS
        .iter()
        .map(PromptTemplate::from)
        .chain(custom)
        .collect()
}

/**
 * \brief 为新提示词生成 `custom_<毫秒时间戳>` ID，同一毫秒内重复时追加序号。
 */
pub fn new_prompt_id(existing: &[PromptTemplate]) -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let taken: Vec<String> = existing.iter().map(|p| p.id.clone()).collect();
    unique_id(format!("{}{}", CUSTOM_PREFIX, millis), &taken)
}
