//! Display-name helpers shared by chats and attachments.

/// Name given to chats created without an explicit name.
pub const DEFAULT_CHAT_NAME: &str = "New Chat";

/// Return `base` if free, otherwise `"{base} 2"`, `"{base} 3"`, ...
pub fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    let mut n = 2u32;
    loop {
        let candidate = format!("{} {}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Like [`unique_name`] but keeps a file extension at the end (`a.txt` -> `a 2.txt`).
pub fn unique_file_name(name: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], Some(&name[pos + 1..])),
        _ => (name, None),
    };
    let mut n = 2u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{} {}.{}", stem, n, ext),
            None => format!("{} {}", stem, n),
        };
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Whether a chat still carries a generated placeholder name.
pub fn is_placeholder_name(name: &str) -> bool {
    match name.strip_prefix(DEFAULT_CHAT_NAME) {
        Some("") => true,
        Some(rest) => rest
            .strip_prefix(' ')
            .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false),
        None => false,
    }
}
