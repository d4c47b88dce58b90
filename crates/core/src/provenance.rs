use sha2::{Digest, Sha256};

use crate::transaction::SessionKey;

/// Deterministic key identifying one committed record by the session and the
/// staged rows it was built from: SHA-256 of `user:session:ids` as lowercase
/// hex. Order and repeats in `staged_ids` do not matter.
pub fn provenance_key(session: &SessionKey, staged_ids: &[i64]) -> String {
    let mut ids = staged_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:", session.user_id, session.session_id));
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(id.to_string());
    }
    hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut hex, b| {
            hex.push_str(&format!("{b:02x}"));
            hex
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_hex_digest_of_session_and_ids() {
        let key = provenance_key(&SessionKey::new(7, "s-1"), &[9, 3, 3]);
        let expected = Sha256::digest(b"7:s-1:3,9");
        let expected: String = expected.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(key, expected);
    }

    #[test]
    fn key_ignores_id_order() {
        let session = SessionKey::new(7, "s-1");
        assert_eq!(
            provenance_key(&session, &[3, 9]),
            provenance_key(&session, &[9, 3])
        );
    }

    #[test]
    fn key_is_scoped_to_session_and_user() {
        let a = provenance_key(&SessionKey::new(7, "s-1"), &[3]);
        let b = provenance_key(&SessionKey::new(7, "s-2"), &[3]);
        let c = provenance_key(&SessionKey::new(8, "s-1"), &[3]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn pair_and_single_keys_differ() {
        let session = SessionKey::new(1, "s");
        assert_ne!(provenance_key(&session, &[1, 2]), provenance_key(&session, &[1]));
    }
}
