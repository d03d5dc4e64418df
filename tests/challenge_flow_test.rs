// Challenge engine integration tests
//
// Ban in challenge mode, then answer the stored question through submit_answer.

use std::sync::Arc;
use std::time::Duration;

use stealth_trap::ban_log::{unix_now, SqliteLog};
use stealth_trap::ban_store::BanStore;
use stealth_trap::cache::{cache_key, MemoryCache, TtlCache};
use stealth_trap::challenge::{submit_answer, Challenge, CsrfGuard, Operator, SubmitOutcome, SOLVE_ACTION};
use stealth_trap::config::{BlockMode, DetectionConfig};
use stealth_trap::keyed_hash::KeyedHasher;

const IP: &str = "198.51.100.44";

fn setup() -> (BanStore, CsrfGuard) {
    let (bans, csrf, _cache) = setup_with_cache();
    (bans, csrf)
}

fn setup_with_cache() -> (BanStore, CsrfGuard, Arc<MemoryCache>) {
    let settings = DetectionConfig {
        block_mode: BlockMode::Challenge,
        ..Default::default()
    };
    let cache = Arc::new(MemoryCache::new());
    let bans = BanStore::new(
        cache.clone(),
        Arc::new(SqliteLog::open_in_memory().unwrap()),
        &settings,
    );
    let csrf = CsrfGuard::new(Arc::new(KeyedHasher::new(&settings.secret)));
    (bans, csrf, cache)
}

#[tokio::test]
async fn test_get_or_create_is_stable() {
    let (bans, _csrf) = setup();
    let first = bans.challenges().get_or_create(IP).await.unwrap();
    let second = bans.challenges().get_or_create(IP).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_correct_answer_unbans_and_grants_grace() {
    let (bans, csrf) = setup();
    bans.ban(IP, "Hidden trap URL accessed (bot-trap)").await.unwrap();
    let challenge = bans.challenges().active(IP).await.unwrap().unwrap();

    let now = unix_now();
    let outcome = submit_answer(
        &bans,
        &csrf,
        IP,
        &format!(" {} ", challenge.expected_answer),
        &csrf.token(IP, SOLVE_ACTION, now),
        now,
    )
    .await
    .unwrap();

    assert_eq!(outcome, SubmitOutcome::Solved);
    assert!(!bans.is_banned(IP).await.unwrap());
    assert!(bans.challenges().active(IP).await.unwrap().is_none());
    assert!(bans.take_grace(IP).await.unwrap());
    assert!(!bans.take_grace(IP).await.unwrap());
}

#[tokio::test]
async fn test_wrong_answer_spends_question_and_keeps_ban() {
    let (bans, csrf) = setup();
    bans.ban(IP, "test").await.unwrap();
    let challenge = bans.challenges().active(IP).await.unwrap().unwrap();

    let now = unix_now();
    let outcome = submit_answer(
        &bans,
        &csrf,
        IP,
        &(challenge.expected_answer + 1).to_string(),
        &csrf.token(IP, SOLVE_ACTION, now),
        now,
    )
    .await
    .unwrap();

    assert_eq!(outcome, SubmitOutcome::Wrong);
    assert!(bans.is_banned(IP).await.unwrap());
    assert!(bans.challenges().active(IP).await.unwrap().is_none());
    assert!(!bans.take_grace(IP).await.unwrap());
}

#[tokio::test]
async fn test_non_numeric_answer_is_wrong() {
    let (bans, csrf) = setup();
    bans.ban(IP, "test").await.unwrap();

    let now = unix_now();
    let outcome = submit_answer(&bans, &csrf, IP, "seven", &csrf.token(IP, SOLVE_ACTION, now), now)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Wrong);
    assert!(bans.is_banned(IP).await.unwrap());
}

#[tokio::test]
async fn test_invalid_token_is_ignored() {
    let (bans, csrf) = setup();
    bans.ban(IP, "test").await.unwrap();
    let challenge = bans.challenges().active(IP).await.unwrap().unwrap();

    // Token minted for a different IP
    let now = unix_now();
    let foreign = csrf.token("198.51.100.45", SOLVE_ACTION, now);
    let outcome = submit_answer(
        &bans,
        &csrf,
        IP,
        &challenge.expected_answer.to_string(),
        &foreign,
        now,
    )
    .await
    .unwrap();

    assert_eq!(outcome, SubmitOutcome::InvalidToken);
    assert!(bans.is_banned(IP).await.unwrap());
    // The question survives an ignored submission
    assert_eq!(bans.challenges().active(IP).await.unwrap(), Some(challenge));
}

#[tokio::test]
async fn test_submission_without_challenge() {
    let (bans, csrf) = setup();
    let now = unix_now();
    let outcome = submit_answer(&bans, &csrf, IP, "4", &csrf.token(IP, SOLVE_ACTION, now), now)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::NoChallenge);
}

#[tokio::test]
async fn test_expired_challenge_is_replaced() {
    let (bans, csrf, cache) = setup_with_cache();
    bans.ban(IP, "test").await.unwrap();

    // Re-store the question with a short lifetime
    let stale = Challenge::new(2, Operator::Add, 2);
    cache
        .set(
            &cache_key("challenge", IP),
            &serde_json::to_vec(&stale).unwrap(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert_eq!(bans.challenges().active(IP).await.unwrap(), Some(stale));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(bans.challenges().active(IP).await.unwrap().is_none());

    let now = unix_now();
    let outcome = submit_answer(&bans, &csrf, IP, "4", &csrf.token(IP, SOLVE_ACTION, now), now)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::NoChallenge);
    assert!(bans.is_banned(IP).await.unwrap());

    let fresh = bans.challenges().get_or_create(IP).await.unwrap();
    assert_eq!(bans.challenges().active(IP).await.unwrap(), Some(fresh));
}

#[test]
fn test_csrf_accepts_previous_tick_only() {
    let (_bans, csrf) = setup();
    let issued_at = 1_700_000_000;
    let token = csrf.token(IP, SOLVE_ACTION, issued_at);

    assert!(csrf.verify(IP, SOLVE_ACTION, &token, issued_at));
    assert!(csrf.verify(IP, SOLVE_ACTION, &token, issued_at + 12 * 3_600));
    assert!(!csrf.verify(IP, SOLVE_ACTION, &token, issued_at + 36 * 3_600));
    assert!(!csrf.verify(IP, "other_action", &token, issued_at));
}
