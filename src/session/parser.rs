//! Classifier for the only input a hibernated session is expected to
//! produce: the end of an IDLE command. Anything else means the session
//! must be woken up so a real worker can answer.

/// Outcome of classifying the bytes buffered so far. The classifier never
/// consumes input; the caller skips bytes according to the variant.
#[derive(Debug, PartialEq, Eq)]
pub enum Classified<'a> {
    /// No complete token yet; retry once at least one more byte arrived.
    NeedMore,
    /// Not a valid DONE; the worker has to send the protocol error.
    Bad,
    /// `DONE\n` (consume 5 bytes).
    DoneLf,
    /// `DONE\r\n` (consume 6 bytes).
    DoneCrlf,
    /// `DONE[\r]\n<tag> IDLE[\r]\n` arrived whole: the client is merely
    /// refreshing its IDLE and can stay hibernated (consume everything).
    DoneIdle { tag: &'a [u8] },
}

pub fn classify(data: &[u8]) -> Classified<'_> {
    // DONE keyword, case-insensitive
    let head = &data[..data.len().min(4)];
    if !head.eq_ignore_ascii_case(&b"DONE"[..head.len()]) {
        return Classified::Bad;
    }
    if data.len() <= 4 {
        return Classified::NeedMore;
    }

    let mut state = Classified::DoneLf;
    let mut i = 4;
    if data[i] == b'\r' {
        state = Classified::DoneCrlf;
        i += 1;
        if i == data.len() {
            return Classified::NeedMore;
        }
    }
    if data[i] != b'\n' {
        return Classified::Bad;
    }
    i += 1;
    if i == data.len() {
        return state;
    }

    let tag_start = i;
    while i < data.len() && data[i] != b' ' && data[i] != b'\r' && data[i] != b'\t' {
        i += 1;
    }
    let tag = &data[tag_start..i];
    if i == data.len() {
        return state;
    }
    if data[i] != b' ' {
        return Classified::Bad;
    }
    i += 1;

    // The IDLE has to arrive in the same read as the DONE. A tag split
    // across reads unhibernates and immediately re-idles in the worker,
    // which is correct but wasteful.
    if data.len() - i <= 4 || !data[i..i + 4].eq_ignore_ascii_case(b"IDLE") {
        return state;
    }
    i += 4;
    if data[i] == b'\r' {
        i += 1;
    }
    if data.len() - i == 1 && data[i] == b'\n' {
        return Classified::DoneIdle { tag };
    }
    state
}
