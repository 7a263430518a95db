/// Splits `text` into pieces of at most `limit` characters.
///
/// Prefers breaking after the last newline inside the window; falls back to a hard split.
/// No piece starts or ends with a newline, and empty pieces are dropped.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();

    while rest.len() > limit {
        let window = &rest[..limit];
        let cut = window
            .iter()
            .rposition(|c| *c == '\n')
            .map(|idx| idx + 1)
            .unwrap_or(limit);
        let head: String = rest[..cut].iter().collect();
        push_trimmed(&mut chunks, &head);
        rest.drain(..cut);
        let leading = rest.iter().take_while(|c| **c == '\n').count();
        rest.drain(..leading);
    }

    let tail: String = rest.into_iter().collect();
    push_trimmed(&mut chunks, &tail);
    chunks
}

fn push_trimmed(chunks: &mut Vec<String>, piece: &str) {
    let piece = piece.trim_end_matches('\n');
    if !piece.trim().is_empty() {
        chunks.push(piece.to_string());
    }
}
