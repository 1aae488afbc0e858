use anyhow::Result;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::HistoryEntry;

/** \brief 历史记录上限。 */
pub const MAX_HISTORY_ITEMS: usize = 100;

/**
 * \brief 以当前 UTC 时间构造一条历史记录。
 */
pub fn new_entry(provider_id: &str, prompt: &str, query: &str, response: &str) -> Result<HistoryEntry> {
    Ok(HistoryEntry {
        timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
        provider_id: provider_id.to_string(),
        prompt: prompt.to_string(),
        query: query.to_string(),
        response: response.to_string(),
    })
}

/**
 * \brief 不区分大小写地在选中文本、提示词与回答中搜索；空关键字返回全部。
 */
pub fn search(entries: &[HistoryEntry], term: &str) -> Vec<HistoryEntry> {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return entries.to_vec();
    }
    entries
        .iter()
        .filter(|e| {
            e.query.to_lowercase().contains(&term)
                || e.prompt.to_lowercase().contains(&term)
                || e.response.to_lowercase().contains(&term)
        })
        .cloned()
        .collect()
}

pub fn export_json(entries: &[HistoryEntry]) -> Result<String> {
    Ok(serde_json::to_string_pretty(entries)?)
}

/**
 * \brief 导出 CSV：`Date,Model,Query,Prompt,Response`，文本列加引号并转义双引号。
 */
pub fn export_csv(entries: &[HistoryEntry]) -> String {
    let mut lines = vec!["Date,Model,Query,Prompt,Response".to_string()];
    for e in entries {
        lines.push(format!(
            "{},{},{},{},{}",
            e.timestamp,
            e.provider_id,
            quote(&e.query),
            quote(&e.prompt),
            quote(&e.response)
        ));
    }
    lines.join("\n")
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}
