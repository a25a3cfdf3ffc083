/**
 * \brief 生成目标语言：`name` 写入提示词，小写形式作为代码块围栏标签。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLanguage {
    name: String,
    fence_tag: String,
}

impl TargetLanguage {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let fence_tag = name.to_ascii_lowercase();
        Self { name, fence_tag }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fence_tag(&self) -> &str {
        &self.fence_tag
    }
}

impl Default for TargetLanguage {
    fn default() -> Self {
        Self::new("Motoko")
    }
}

/**
 * \brief 组装最终提示词。三个 Provider 共用同一模板。
 * \param prompt  用户请求
 * \param context 检索上下文，可为空
 */
pub fn build_prompt(language: &TargetLanguage, prompt: &str, context: &str) -> String {
    let lang = language.name();
    if context.is_empty() {
        format!(
            "Generate {lang} code for the following request:\n\n{prompt}\n\nProvide complete, working {lang} code."
        )
    } else {
        format!(
            "Context from {lang} documentation:\n\n{context}\n\nGenerate {lang} code for the following request:\n\n{prompt}\n\nProvide complete, working {lang} code based on the context."
        )
    }
}
