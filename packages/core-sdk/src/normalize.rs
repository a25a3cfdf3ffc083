use serde_json::{Map, Value};

use crate::{error::ParseError, models::ProviderKind};

/**
 * \brief Provider 原始回复，按来源区分，每种形状对应一个解码器。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum RawReply {
    Gemini(Value),
    OpenAI(Value),
    Claude(Value),
}

impl RawReply {
    pub fn new(kind: ProviderKind, body: Value) -> Self {
        match kind {
            ProviderKind::Gemini => RawReply::Gemini(body),
            ProviderKind::OpenAI => RawReply::OpenAI(body),
            ProviderKind::Claude => RawReply::Claude(body),
        }
    }

    /** \brief 从响应正文解析，非 JSON 时返回 `InvalidJson`。 */
    pub fn parse(kind: ProviderKind, body: &str) -> Result<Self, ParseError> {
        let value = serde_json::from_str(body)
            .map_err(|source| ParseError::InvalidJson { provider: kind, source })?;
        Ok(Self::new(kind, value))
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            RawReply::Gemini(_) => ProviderKind::Gemini,
            RawReply::OpenAI(_) => ProviderKind::OpenAI,
            RawReply::Claude(_) => ProviderKind::Claude,
        }
    }
}

/**
 * \brief 取出回复中的文本负载，任一步缺失或类型不符都返回对应路径的错误。
 */
pub fn extract_text(reply: &RawReply) -> Result<String, ParseError> {
    match reply {
        RawReply::Gemini(v) => decode_gemini(v),
        RawReply::OpenAI(v) => decode_openai(v),
        RawReply::Claude(v) => decode_claude(v),
    }
}

/** \brief `candidates[0].content.parts[0].text` */
fn decode_gemini(v: &Value) -> Result<String, ParseError> {
    let walk = Walker(ProviderKind::Gemini);
    let root = walk.object(v, "$")?;
    let candidates = walk.non_empty_array(root, "candidates", "candidates")?;
    let candidate = walk.object(&candidates[0], "candidates[0]")?;
    let content = walk.field(candidate, "content", "candidates[0].content")?;
    let content = walk.object(content, "candidates[0].content")?;
    let parts = walk.non_empty_array(content, "parts", "candidates[0].content.parts")?;
    let part = walk.object(&parts[0], "candidates[0].content.parts[0]")?;
    walk.string(part, "text", "candidates[0].content.parts[0].text")
}

/** \brief `choices[0].message.content` */
fn decode_openai(v: &Value) -> Result<String, ParseError> {
    let walk = Walker(ProviderKind::OpenAI);
    let root = walk.object(v, "$")?;
    let choices = walk.non_empty_array(root, "choices", "choices")?;
    let choice = walk.object(&choices[0], "choices[0]")?;
    let message = walk.field(choice, "message", "choices[0].message")?;
    let message = walk.object(message, "choices[0].message")?;
    walk.string(message, "content", "choices[0].message.content")
}

/** \brief `content[0].text` */
fn decode_claude(v: &Value) -> Result<String, ParseError> {
    let walk = Walker(ProviderKind::Claude);
    let root = walk.object(v, "$")?;
    let content = walk.non_empty_array(root, "content", "content")?;
    let item = walk.object(&content[0], "content[0]")?;
    walk.string(item, "text", "content[0].text")
}

struct Walker(ProviderKind);

impl Walker {
    fn field<'a>(
        &self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &'static str,
    ) -> Result<&'a Value, ParseError> {
        obj.get(key).ok_or(ParseError::MissingField {
            provider: self.0,
            path,
        })
    }

    fn object<'a>(
        &self,
        v: &'a Value,
        path: &'static str,
    ) -> Result<&'a Map<String, Value>, ParseError> {
        v.as_object().ok_or(ParseError::WrongType {
            provider: self.0,
            path,
            expected: "an object",
        })
    }

    fn non_empty_array<'a>(
        &self,
        obj: &'a Map<String, Value>,
        key: &str,
        path: &'static str,
    ) -> Result<&'a [Value], ParseError> {
        let arr = self
            .field(obj, key, path)?
            .as_array()
            .ok_or(ParseError::WrongType {
                provider: self.0,
                path,
                expected: "an array",
            })?;
        if arr.is_empty() {
            return Err(ParseError::EmptyArray {
                provider: self.0,
                path,
            });
        }
        Ok(arr)
    }

    fn string(
        &self,
        obj: &Map<String, Value>,
        key: &str,
        path: &'static str,
    ) -> Result<String, ParseError> {
        self.field(obj, key, path)?
            .as_str()
            .map(str::to_string)
            .ok_or(ParseError::WrongType {
                provider: self.0,
                path,
                expected: "a string",
            })
    }
}
