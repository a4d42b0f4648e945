use rand::Rng;
use uuid::Uuid;

/// Pairing-code alphabet. Visually ambiguous glyphs (I, L, O, U, 0, 1) are
/// excluded so codes survive being read aloud or retyped.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ23456789";

/// Pairing codes are always exactly this many characters.
pub const CODE_LEN: usize = 6;

/// Generate a new pairing code by drawing uniformly from the alphabet.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generate a new session ID.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate an ID for a single WebSocket connection.
pub fn generate_conn_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonicalize a user-supplied pairing code: uppercase, alphabet-checked.
/// Returns `None` for anything that cannot name a registered code.
pub fn canonicalize_code(input: &str) -> Option<String> {
    if input.len() != CODE_LEN {
        return None;
    }
    let mut code = String::with_capacity(CODE_LEN);
    for ch in input.chars() {
        let up = ch.to_ascii_uppercase();
        if !up.is_ascii() || !CODE_ALPHABET.contains(&(up as u8)) {
            return None;
        }
        code.push(up);
    }
    Some(code)
}
