const FENCE: &str = "```";

/**
 * \brief 从模型回复中截取代码块。
 * \details 起点取语言标签围栏之后，否则取第一个普通围栏之后；终点取最后一个位于起点之后的围栏。
 * 没有围栏时返回整段文本；只有起始围栏时截取到文本末尾（可能包含尾随说明）。
 */
pub fn extract_code(text: &str, fence_tag: &str) -> String {
    let tagged = format!("{FENCE}{fence_tag}");

    let start = if let Some(idx) = text.find(&tagged) {
        idx + tagged.len()
    } else if let Some(idx) = text.find(FENCE) {
        idx + FENCE.len()
    } else {
        0
    };

    let end = match text.rfind(FENCE) {
        Some(idx) if idx > start => idx,
        _ => text.len(),
    };

    text[start..end].trim().to_string()
}
