/// Render bytes as space separated hex for trace logging.
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Render bytes as text, escaping control characters, for debug logging.
pub fn printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out
}

/// Parse a hex payload string into bytes, ignoring separators.
pub fn parse_hex_payload(data: &str) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut current = String::new();

    for ch in data.chars() {
        if ch.is_ascii_hexdigit() {
            current.push(ch);
            if current.len() == 2 {
                if let Ok(value) = u8::from_str_radix(&current, 16) {
                    bytes.push(value);
                }
                current.clear();
            }
        } else {
            current.clear();
        }
    }

    bytes
}
