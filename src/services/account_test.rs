use super::*;

// =============================================================================
// validation
// =============================================================================

#[test]
fn normalize_email_trims_and_lowercases() {
    assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
}

#[test]
fn registration_requires_username() {
    assert!(matches!(validate_registration("  ", "a@b.c", "secret1"), Err(AccountError::Invalid(_))));
}

#[test]
fn registration_requires_plausible_email() {
    for email in ["", "plain", "@nohost", "nouser@", "sp ace@x.y"] {
        assert!(
            matches!(validate_registration("ada", email, "secret1"), Err(AccountError::Invalid(_))),
            "{email} should be rejected"
        );
    }
}

#[test]
fn registration_requires_six_character_password() {
    assert!(matches!(validate_registration("ada", "a@b.c", "12345"), Err(AccountError::Invalid(_))));
    assert!(validate_registration("ada", "a@b.c", "123456").is_ok());
}

// =============================================================================
// hashing
// =============================================================================

#[tokio::test]
async fn hash_then_verify() {
    let hash = hash_password("correct horse").await.unwrap();
    assert_ne!(hash, "correct horse");
    assert!(verify_password("correct horse", &hash).await.unwrap());
    assert!(!verify_password("battery staple", &hash).await.unwrap());
}

#[tokio::test]
async fn verify_against_garbage_hash_is_an_error() {
    assert!(matches!(verify_password("pw", "not-a-bcrypt-hash").await, Err(AccountError::Hash(_))));
}

// =============================================================================
// live database
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::state::test_helpers::integration_pool;

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL/live Postgres"]
    async fn register_then_login() {
        let pool = integration_pool().await;
        let email = format!("{}@example.com", Uuid::new_v4().simple());

        let id = create_account(&pool, "ada", &email, "secret1").await.unwrap();
        let issued = issue_token(&pool, &email.to_uppercase(), "secret1").await.unwrap();
        assert_eq!(issued.user_id, id);
        assert_eq!(issued.username, "ada");
        assert_eq!(issued.token.len(), 64);

        assert!(matches!(issue_token(&pool, &email, "wrong-pw").await, Err(AccountError::InvalidCredentials)));
        assert!(matches!(create_account(&pool, "dup", &email, "secret1").await, Err(AccountError::EmailTaken)));
    }

    #[tokio::test]
    #[ignore = "requires TEST_DATABASE_URL/live Postgres"]
    async fn unknown_email_is_invalid_credentials() {
        let pool = integration_pool().await;
        assert!(matches!(
            issue_token(&pool, "nobody@example.com", "whatever").await,
            Err(AccountError::InvalidCredentials)
        ));
    }
}
