//! Conversion from IBM code page 437 to UTF-8, for names and comments in
//! archives written without the language-encoding flag.

/// High half of code page 437 (0x80..=0xFF). The low half is ASCII.
static CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

/// Provides a conversion from cp437 bytes to String.
pub trait FromCp437 {
    /// Convert to a String.
    fn from_cp437(&self) -> String;
}

impl FromCp437 for [u8] {
    fn from_cp437(&self) -> String {
        self.iter().map(|&b| decode_byte(b)).collect()
    }
}

impl FromCp437 for Vec<u8> {
    fn from_cp437(&self) -> String {
        self.as_slice().from_cp437()
    }
}

#[inline]
fn decode_byte(byte: u8) -> char {
    if byte < 0x80 {
        byte as char
    } else {
        CP437_HIGH[(byte - 0x80) as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        assert_eq!(b"hello.txt"[..].from_cp437(), "hello.txt");
    }

    #[test]
    fn high_half_maps_through_the_table() {
        assert_eq!([0x80].from_cp437(), "\u{00c7}");
        assert_eq!([0xff].from_cp437(), "\u{00a0}");
        assert_eq!(b"G\x82n\x82ve"[..].from_cp437(), "Génève");
    }
}
