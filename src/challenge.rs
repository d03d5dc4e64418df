//! Human-verification challenge: a small arithmetic question a banned visitor can
//! answer to lift their own ban.
//!
//! Per IP the lifecycle is NONE -> ACTIVE (question stored for five minutes) ->
//! SOLVED (grace flag, one request) -> NONE. An unanswered question simply expires.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ban_store::BanStore;
use crate::cache::{cache_key, TtlCache};
use crate::error::TrapResult;
use crate::keyed_hash::KeyedHasher;

/// How long a question stays answerable
pub const CHALLENGE_TTL: Duration = Duration::from_secs(300);

/// CSRF tokens rotate every twelve hours; the previous tick is still accepted
const CSRF_TICK_SECS: i64 = 12 * 3_600;

/// Form action the challenge CSRF token is bound to
pub const SOLVE_ACTION: &str = "solve_challenge";

/// Arithmetic operator shown in the question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Add,
    Multiply,
}

impl Operator {
    pub fn symbol(&self) -> char {
        match self {
            Operator::Add => '+',
            Operator::Multiply => '×',
        }
    }

    fn apply(&self, a: i64, b: i64) -> i64 {
        match self {
            Operator::Add => a + b,
            Operator::Multiply => a * b,
        }
    }
}

/// An issued question and its answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub question: String,
    pub expected_answer: i64,
}

impl Challenge {
    pub fn new(a: i64, op: Operator, b: i64) -> Self {
        Self {
            question: format!("{} {} {} = ?", a, op.symbol(), b),
            expected_answer: op.apply(a, b),
        }
    }

    /// Operands in 1..=10, `+` or `×`
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let a = rng.gen_range(1..=10);
        let b = rng.gen_range(1..=10);
        let op = if rng.gen_bool(0.5) {
            Operator::Add
        } else {
            Operator::Multiply
        };
        Self::new(a, op, b)
    }
}

/// Stores one active challenge per IP in the TTL cache
#[derive(Clone)]
pub struct ChallengeEngine {
    cache: Arc<dyn TtlCache>,
}

impl ChallengeEngine {
    pub fn new(cache: Arc<dyn TtlCache>) -> Self {
        Self { cache }
    }

    /// Active challenge for the IP, if any
    pub async fn active(&self, ip: &str) -> TrapResult<Option<Challenge>> {
        let Some(raw) = self.cache.get(&cache_key("challenge", ip)).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Challenge>(&raw) {
            Ok(challenge) => Ok(Some(challenge)),
            Err(e) => {
                warn!("Discarding unreadable challenge record for {}: {}", ip, e);
                Ok(None)
            }
        }
    }

    /// Return the active challenge unchanged, or issue a new one.
    ///
    /// An active question is never regenerated so an in-flight answer stays valid.
    pub async fn get_or_create(&self, ip: &str) -> TrapResult<Challenge> {
        if let Some(existing) = self.active(ip).await? {
            return Ok(existing);
        }

        let challenge = Challenge::random();
        let encoded = serde_json::to_vec(&challenge)?;
        self.cache
            .set(&cache_key("challenge", ip), &encoded, CHALLENGE_TTL)
            .await?;

        debug!("Issued challenge for {}: {}", ip, challenge.question);
        Ok(challenge)
    }

    pub async fn discard(&self, ip: &str) -> TrapResult<()> {
        self.cache.delete(&cache_key("challenge", ip)).await
    }
}

/// Keyed per-IP form tokens
pub struct CsrfGuard {
    hasher: Arc<KeyedHasher>,
}

impl CsrfGuard {
    pub fn new(hasher: Arc<KeyedHasher>) -> Self {
        Self { hasher }
    }

    fn tick(now: i64) -> i64 {
        now.div_euclid(CSRF_TICK_SECS)
    }

    fn token_for_tick(&self, ip: &str, action: &str, tick: i64) -> String {
        self.hasher.hex(&["csrf", ip, action, &tick.to_string()])
    }

    pub fn token(&self, ip: &str, action: &str, now: i64) -> String {
        self.token_for_tick(ip, action, Self::tick(now))
    }

    /// Accepts tokens from the current and the previous tick
    pub fn verify(&self, ip: &str, action: &str, token: &str, now: i64) -> bool {
        let tick = Self::tick(now);
        [tick, tick - 1].iter().any(|t| {
            self.hasher
                .verify_hex(&["csrf", ip, action, &t.to_string()], token)
        })
    }
}

/// Result of a challenge submission. The HTTP response is a redirect in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    InvalidToken,
    NoChallenge,
    Solved,
    Wrong,
}

/// Check an answer and, when correct, unban the IP and grant grace.
pub async fn submit_answer(
    bans: &BanStore,
    csrf: &CsrfGuard,
    ip: &str,
    answer: &str,
    csrf_token: &str,
    now: i64,
) -> TrapResult<SubmitOutcome> {
    if !csrf.verify(ip, SOLVE_ACTION, csrf_token, now) {
        debug!("Ignoring challenge submission from {} with invalid token", ip);
        return Ok(SubmitOutcome::InvalidToken);
    }

    let engine = bans.challenges();
    let Some(challenge) = engine.active(ip).await? else {
        debug!("Ignoring challenge submission from {} with no active challenge", ip);
        return Ok(SubmitOutcome::NoChallenge);
    };

    // Either way the question is spent
    engine.discard(ip).await?;

    match answer.trim().parse::<i64>() {
        Ok(value) if value == challenge.expected_answer => {
            bans.unban(ip).await?;
            bans.grant_grace(ip).await?;
            info!("Challenge solved, unblocked {}", ip);
            Ok(SubmitOutcome::Solved)
        }
        _ => {
            info!("Wrong challenge answer from {}", ip);
            Ok(SubmitOutcome::Wrong)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn test_challenge_question_format() {
        let add = Challenge::new(3, Operator::Add, 4);
        assert_eq!(add.question, "3 + 4 = ?");
        assert_eq!(add.expected_answer, 7);

        let mul = Challenge::new(6, Operator::Multiply, 7);
        assert_eq!(mul.question, "6 × 7 = ?");
        assert_eq!(mul.expected_answer, 42);
    }

    #[test]
    fn test_random_challenge_in_range() {
        for _ in 0..200 {
            let c = Challenge::random();
            let parts: Vec<&str> = c.question.split(' ').collect();
            assert_eq!(parts.len(), 5, "unexpected question {:?}", c.question);
            assert_eq!(&parts[3..], ["=", "?"]);

            let a: i64 = parts[0].parse().unwrap();
            let b: i64 = parts[2].parse().unwrap();
            assert!((1..=10).contains(&a) && (1..=10).contains(&b));

            let expected = match parts[1] {
                "+" => a + b,
                "×" => a * b,
                other => panic!("unexpected operator {:?}", other),
            };
            assert_eq!(c.expected_answer, expected);
            assert!((1..=100).contains(&c.expected_answer));
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let engine = ChallengeEngine::new(Arc::new(MemoryCache::new()));

        let first = engine.get_or_create("192.0.2.1").await.unwrap();
        let second = engine.get_or_create("192.0.2.1").await.unwrap();
        assert_eq!(first, second);

        engine.discard("192.0.2.1").await.unwrap();
        assert!(engine.active("192.0.2.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_replaced() {
        let cache = Arc::new(MemoryCache::new());
        cache
            .set(&cache_key("challenge", "192.0.2.1"), b"not json", CHALLENGE_TTL)
            .await
            .unwrap();

        let engine = ChallengeEngine::new(cache);
        assert!(engine.active("192.0.2.1").await.unwrap().is_none());
        let fresh = engine.get_or_create("192.0.2.1").await.unwrap();
        assert_eq!(engine.active("192.0.2.1").await.unwrap(), Some(fresh));
    }

    #[test]
    fn test_csrf_token_rotation() {
        let csrf = CsrfGuard::new(Arc::new(KeyedHasher::new("secret")));
        let now = 1_700_000_000;
        let token = csrf.token("192.0.2.1", SOLVE_ACTION, now);

        assert!(csrf.verify("192.0.2.1", SOLVE_ACTION, &token, now));
        assert!(csrf.verify("192.0.2.1", SOLVE_ACTION, &token, now + CSRF_TICK_SECS));
        assert!(!csrf.verify("192.0.2.1", SOLVE_ACTION, &token, now + 2 * CSRF_TICK_SECS));
        assert!(!csrf.verify("192.0.2.2", SOLVE_ACTION, &token, now));
        assert!(!csrf.verify("192.0.2.1", "other_action", &token, now));
        assert!(!csrf.verify("192.0.2.1", SOLVE_ACTION, "forged", now));
    }
}
