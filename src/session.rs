use rand::Rng;

const SESSION_SUFFIX_LEN: usize = 12;

/// Builds an unpredictable session identifier: the prefix followed by twelve
/// lowercase letters from the thread-local CSPRNG.
pub fn generate_session(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(prefix.len() + SESSION_SUFFIX_LEN);
    id.push_str(prefix);
    for _ in 0..SESSION_SUFFIX_LEN {
        id.push(rng.gen_range(b'a'..=b'z') as char);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_prefix_and_appends_twelve_lowercase_letters() {
        let id = generate_session("cs_");
        assert!(id.starts_with("cs_"));
        let suffix = &id["cs_".len()..];
        assert_eq!(suffix.len(), SESSION_SUFFIX_LEN);
        assert!(suffix.bytes().all(|byte| byte.is_ascii_lowercase()));
    }

    #[test]
    fn consecutive_ids_differ() {
        let first = generate_session("qs_");
        let second = generate_session("qs_");
        assert_ne!(first, second);
    }
}
