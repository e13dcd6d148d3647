//! Tab-escaping for the single-line, tab-separated records spoken on the
//! hibernation, master and admin sockets. `\x01` is the escape character so
//! that field values may contain tabs and newlines without breaking the
//! record framing.

const ESCAPE: char = '\u{1}';

pub fn tabescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ESCAPE => out.push_str("\u{1}1"),
            '\t' => out.push_str("\u{1}t"),
            '\n' => out.push_str("\u{1}n"),
            '\r' => out.push_str("\u{1}r"),
            c => out.push(c),
        }
    }
    out
}

pub fn tabunescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('1') => out.push(ESCAPE),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            // unknown escape: keep the byte, drop the escape char
            Some(other) => out.push(other),
            None => (),
        }
    }
    out
}
