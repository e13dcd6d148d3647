//! Expansion of the `mail_log_prefix` template into a per-session log
//! prefix. Only the variables a hibernated session can know are honored;
//! anything else expands to the empty string.

use crate::session::state::ClientState;

pub fn expand(template: &str, state: &ClientState) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('u') => out.push_str(&state.username),
            Some('{') => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                out.push_str(&variable(&name, state));
            }
            // unknown single-letter variable
            Some(_) | None => (),
        }
    }
    out
}

fn variable(name: &str, state: &ClientState) -> String {
    match name {
        "user" => state.username.clone(),
        "session" => state.session_id.clone().unwrap_or_default(),
        "auth_user" => state.auth_user().into_owned(),
        "local_ip" | "lip" => state.local_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        "remote_ip" | "rip" => state.remote_ip.map(|ip| ip.to_string()).unwrap_or_default(),
        "local_port" => non_zero_port(state.local_port),
        "remote_port" => non_zero_port(state.remote_port),
        _ => String::new(),
    }
}

fn non_zero_port(port: u16) -> String {
    if port == 0 {
        String::new()
    } else {
        port.to_string()
    }
}
