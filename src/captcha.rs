use std::fmt;
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use subtle::ConstantTimeEq;

use crate::cache::TtlCache;

const CAPTCHA_ID_LEN: usize = 20;

/// Freshly generated challenge. The answer is for rendering only.
#[derive(Clone)]
pub struct CaptchaChallenge {
    pub id: String,
    pub answer: String,
}

impl fmt::Debug for CaptchaChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptchaChallenge")
            .field("id", &self.id)
            .field("answer", &"<redacted>")
            .finish()
    }
}

/// Single-use, time-boxed captcha answers.
#[derive(Debug)]
pub struct CaptchaStore {
    answers: TtlCache<String, String>,
    key_len: usize,
}

impl CaptchaStore {
    /// Creates a new store of `key_len`-digit answers kept for `ttl`.
    pub fn new(key_len: usize, ttl: Duration, capacity: usize) -> Self {
        Self {
            answers: TtlCache::new(capacity, ttl),
            key_len: key_len.max(1),
        }
    }

    /// Creates a numeric challenge under a random id.
    pub fn generate(&self) -> CaptchaChallenge {
        let mut rng = rand::thread_rng();
        let id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(CAPTCHA_ID_LEN)
            .map(char::from)
            .collect();
        let answer: String = (0..self.key_len)
            .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
            .collect();
        self.answers.insert(id.clone(), answer.clone());
        CaptchaChallenge { id, answer }
    }

    /// Stores an externally generated answer.
    pub fn insert(&self, id: impl Into<String>, answer: impl Into<String>) {
        self.answers.insert(id.into(), answer.into());
    }

    /// Consumes the challenge and reports whether `answer` matched.
    ///
    /// The challenge is gone afterwards whatever the outcome.
    pub fn verify(&self, id: &str, answer: &str) -> bool {
        let Some(expected) = self.answers.remove(&id.to_string()) else {
            return false;
        };
        let answer = answer.trim();
        !answer.is_empty() && bool::from(expected.as_bytes().ct_eq(answer.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_should_verify_once() {
        let store = CaptchaStore::new(6, Duration::from_secs(300), 16);
        let challenge = store.generate();
        assert_eq!(challenge.answer.len(), 6);
        assert!(challenge.answer.chars().all(|ch| ch.is_ascii_digit()));

        assert!(store.verify(&challenge.id, &challenge.answer));
        assert!(!store.verify(&challenge.id, &challenge.answer));
    }

    #[test]
    fn wrong_answer_should_consume_challenge() {
        let store = CaptchaStore::new(6, Duration::from_secs(300), 16);
        store.insert("c1", "123456");

        assert!(!store.verify("c1", "654321"));
        assert!(!store.verify("c1", "123456"));
    }

    #[test]
    fn expired_challenge_should_fail() {
        let store = CaptchaStore::new(4, Duration::from_millis(10), 16);
        store.insert("c1", "1234");
        std::thread::sleep(Duration::from_millis(20));

        assert!(!store.verify("c1", "1234"));
    }

    #[test]
    fn unknown_id_should_fail() {
        let store = CaptchaStore::new(4, Duration::from_secs(300), 16);
        assert!(!store.verify("missing", ""));
    }
}
