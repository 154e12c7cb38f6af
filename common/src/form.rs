//! `application/x-www-form-urlencoded` field lookup for POST bodies.

pub const MAX_FORM_BODY: usize = 1024;

pub fn field(encoded: &str, key: &str) -> Option<String> {
    encoded.split('&').find_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        (decode(name) == key).then(|| decode(value))
    })
}

fn decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let body = "ssid=My+Home%20Net&password=p%40ss%26word";
        assert_eq!(field(body, "ssid").as_deref(), Some("My Home Net"));
        assert_eq!(field(body, "password").as_deref(), Some("p@ss&word"));
        assert_eq!(field(body, "missing"), None);
    }

    #[test]
    fn keeps_invalid_escapes_literally() {
        assert_eq!(field("v=100%", "v").as_deref(), Some("100%"));
        assert_eq!(field("v=%zz", "v").as_deref(), Some("%zz"));
        assert_eq!(field("flag", "flag").as_deref(), Some(""));
    }

    #[test]
    fn decodes_utf8_sequences() {
        assert_eq!(field("ssid=Caf%C3%A9", "ssid").as_deref(), Some("Café"));
    }
}
