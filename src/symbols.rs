//! Flap drum layout. Index 0 is the blank flap.

pub const FLAP_SYMBOLS: [char; 45] = [
    ' ', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R',
    'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ü', '0', '1', '2', '3', '4', '5', '6', '7',
    '8', '9', ':', '.', '-', '?', '!',
];

pub const FLAP_COUNT: usize = FLAP_SYMBOLS.len();

pub fn symbol_for_flap(flap: u8) -> Option<char> {
    FLAP_SYMBOLS.get(usize::from(flap)).copied()
}

/// Flap index showing `c`, ignoring case. `None` if the drum lacks it.
pub fn flap_for_char(c: char) -> Option<u8> {
    let upper = c.to_uppercase().next()?;
    FLAP_SYMBOLS
        .iter()
        .position(|&symbol| symbol == upper)
        .and_then(|index| u8::try_from(index).ok())
}
