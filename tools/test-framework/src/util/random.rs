/*!
   Random values for names and identifiers.
*/

use rand::distributions::Alphanumeric;
use rand::Rng;

pub fn random_u32() -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen()
}

/// A lowercase alphanumeric string, used as key name suffix.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}

/// A random 32-byte hex string, used as fake transaction hash.
pub fn random_hash() -> String {
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:02X}", rng.gen::<u8>())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_strings_are_lowercase_alphanumeric() {
        let s = random_string(12);
        assert_eq!(s.len(), 12);
        assert!(s.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_eq!(random_hash().len(), 64);
    }
}
