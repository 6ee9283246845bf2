use std::fmt::Write;

/// Bytes shown per dump line.
pub const BYTES_PER_LINE: usize = 16;

/// Canonical hex+ASCII dump, one line per 16 bytes:
///
/// ```text
/// 00000000  47 45 54 20 2f 20 48 54  54 50 2f 31 2e 31 0d 0a  |GET / HTTP/1.1..|
/// ```
///
/// Every line starts with `prefix`. Empty input yields an empty string.
pub fn hex_dump(data: &[u8], prefix: &str) -> String {
    let lines = data.len().div_ceil(BYTES_PER_LINE);
    let mut out = String::with_capacity(lines * (prefix.len() + 79));

    for (i, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        out.push_str(prefix);
        // Writing to a String cannot fail.
        let _ = write!(out, "{:08x} ", i * BYTES_PER_LINE);

        for col in 0..BYTES_PER_LINE {
            if col % 8 == 0 {
                out.push(' ');
            }
            match chunk.get(col) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }

        out.push_str(" |");
        out.extend(chunk.iter().map(|&b| printable(b)));
        out.push_str("|\n");
    }

    out
}

fn printable(b: u8) -> char {
    if b.is_ascii_graphic() || b == b' ' {
        b as char
    } else {
        '.'
    }
}
