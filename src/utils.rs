use std::borrow::Cow;

/// Shorten `data` to at most `max_length` bytes, cut on a character
/// boundary, marking the cut with a trailing `...`.
pub fn truncate(data: &str, max_length: usize) -> Cow<'_, str> {
    if data.len() <= max_length {
        return Cow::Borrowed(data);
    }
    let mut end = max_length;
    while !data.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}...", &data[..end]))
}
