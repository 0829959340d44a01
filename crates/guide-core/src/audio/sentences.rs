//! Sentence splitting for highlighted, sentence-by-sentence narration.

const TERMINATORS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Split text into trimmed sentences, keeping each terminator attached.
/// Runs of terminators ("?!", "...") stay with their sentence and trailing
/// text without a terminator becomes the last sentence.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if TERMINATORS.contains(&c) {
            while let Some(&next) = chars.peek() {
                if TERMINATORS.contains(&next) || next == '"' || next == '\'' || next == ')' {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_basic() {
        let s = split_into_sentences("Built in 80 AD. It held 50,000 people! Impressive?");
        assert_eq!(s, vec!["Built in 80 AD.", "It held 50,000 people!", "Impressive?"]);
    }

    #[test]
    fn test_split_keeps_runs_and_tail() {
        let s = split_into_sentences("Wait... what?! \"Really.\" And then");
        assert_eq!(s, vec!["Wait...", "what?!", "\"Really.\"", "And then"]);
    }

    #[test]
    fn test_split_cjk_and_empty() {
        assert_eq!(split_into_sentences("로마입니다。좋아요！"), vec!["로마입니다。", "좋아요！"]);
        assert!(split_into_sentences("   ").is_empty());
    }
}
