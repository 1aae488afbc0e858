use serde_json::{Map, Value};

use crate::error::QueryError;

/**
 * \brief 自定义模板可用的占位符取值。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateValues {
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub model_name: String,
}

impl TemplateValues {
    fn lookup(&self, key: &str) -> Option<Value> {
        match key {
            "prompt" => Some(Value::String(self.prompt.clone())),
            "temperature" => serde_json::Number::from_f64(self.temperature).map(Value::Number),
            "maxTokens" => Some(Value::from(self.max_tokens)),
            "modelName" => Some(Value::String(self.model_name.clone())),
            _ => None,
        }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/**
 * \brief 渲染自定义请求模板：先处理字符串外的占位符，再解析 JSON 并深度替换。
 */
pub fn render_template(template: &str, values: &TemplateValues) -> Result<Value, QueryError> {
    let text = substitute_bare_placeholders(template, values);
    let parsed: Value =
        serde_json::from_str(&text).map_err(|e| QueryError::TemplateError(e.to_string()))?;
    Ok(substitute(&parsed, values))
}

/**
 * \brief 深度替换字符串中的 `{{key}}`，数组与对象递归处理，其余值原样返回。
 */
pub fn substitute(template: &Value, values: &TemplateValues) -> Value {
    match template {
        Value::String(s) => Value::String(replace_placeholders(s, values)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, values)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), substitute(value, values));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

// 单遍扫描：已插入的值不会再被当作占位符展开
fn replace_placeholders(input: &str, values: &TemplateValues) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let hit = after
            .find("}}")
            .and_then(|end| values.lookup(after[..end].trim()).map(|v| (end, v)));
        match hit {
            Some((end, value)) => {
                out.push_str(&stringify(&value));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// Placeholders in value position (e.g. `"max_tokens": {{maxTokens}}`) are not valid JSON.
// Numbers are written out directly; string values become a quoted placeholder that the
// deep walk fills in, so their text is never scanned again.
fn substitute_bare_placeholders(template: &str, values: &TemplateValues) -> String {
    let mut out = String::with_capacity(template.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = template;

    while let Some(c) = rest.chars().next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            rest = &rest[c.len_utf8()..];
            continue;
        }

        if c == '"' {
            in_string = true;
        } else if rest.starts_with("{{") {
            if let Some(end) = rest.find("}}") {
                let key = rest[2..end].trim();
                if let Some(value) = values.lookup(key) {
                    if value.is_string() {
                        out.push_str(&format!("\"{{{{{}}}}}\"", key));
                    } else {
                        out.push_str(&value.to_string());
                    }
                    rest = &rest[end + 2..];
                    continue;
                }
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/**
 * \brief 按点分路径取值，数组段必须是合法下标；遇到 null 或缺失即返回 None。
 */
pub fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}
