/// Admission through the full deploy path: free allowance first, then
/// credit, debited only once the runtime is up.
use crate::common::{setup, API, SITE};
use deckhand::ApiError;
use entity::sea_orm_active_enums::ApplicationStatus;

#[tokio::test]
async fn scenario_a_fits_in_free_allowance() {
    let ctx = setup().await;

    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", SITE, Some(256))
        .await
        .unwrap();

    assert_eq!(outcome.credits_debited, 0);
    assert_eq!(outcome.credits_remaining, 0);
    assert_eq!(outcome.app.status, ApplicationStatus::Running);

    let balance = ctx.state.admission_service.balance("42").await.unwrap();
    assert_eq!(balance.credits, 0);
    assert_eq!(balance.used_mb, 256);
    assert_eq!(balance.free_available_mb, 256);
    assert_eq!(balance.reserved_credits, 0);
}

#[tokio::test]
async fn scenario_b_overflow_needs_credit() {
    let ctx = setup().await;
    ctx.state
        .deploy_service
        .deploy("42", SITE, Some(400))
        .await
        .unwrap();

    let err = ctx
        .state
        .deploy_service
        .deploy("42", API, Some(300))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ApiError::InsufficientCredit {
                requested_mb: 300,
                deficit: 188
            }
        ),
        "{err:?}"
    );

    // Denied before any external step ran for the second repository
    assert!(!ctx.runtime.calls().iter().any(|c| c.contains("api")));
    assert!(ctx.state.registry_service.get("42", "api").await.is_err());

    // 187 is still one short
    ctx.grant_credits("42", 187).await;
    assert!(matches!(
        ctx.state.deploy_service.deploy("42", API, Some(300)).await,
        Err(ApiError::InsufficientCredit { deficit: 188, .. })
    ));

    ctx.grant_credits("42", 1).await;
    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", API, Some(300))
        .await
        .unwrap();
    assert_eq!(outcome.credits_debited, 188);
    assert_eq!(outcome.credits_remaining, 0);
    assert_eq!(ctx.credits("42").await, 0);

    let balance = ctx.state.admission_service.balance("42").await.unwrap();
    assert_eq!(balance.used_mb, 700);
    assert_eq!(balance.free_available_mb, 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_any_io() {
    let ctx = setup().await;

    for memory in [0, -5, 1_000_000] {
        let err = ctx
            .state
            .deploy_service
            .deploy("42", SITE, Some(memory))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)), "{err:?}");
    }

    for url in ["", "not a url", "--upload-pack=touch /tmp/pwned", "https://example.com/"] {
        let err = ctx
            .state
            .deploy_service
            .deploy("42", url, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidRequest(_)), "{url:?}: {err:?}");
    }

    let err = ctx
        .state
        .deploy_service
        .deploy("../etc", SITE, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::InvalidRequest(_)));

    assert!(ctx.runtime.calls().is_empty());
}

#[tokio::test]
async fn default_memory_is_used_when_omitted() {
    let ctx = setup().await;

    let outcome = ctx
        .state
        .deploy_service
        .deploy("42", SITE, None)
        .await
        .unwrap();
    assert_eq!(outcome.app.memory_mb, 256);
    assert!(ctx
        .runtime
        .calls()
        .iter()
        .any(|c| c.starts_with("run ") && c.ends_with(" 256m")));
}

#[tokio::test]
async fn free_allowance_is_configurable() {
    let ctx = crate::common::setup_with(|config| config.admission.free_allowance_mb = 128).await;

    assert!(matches!(
        ctx.state.deploy_service.deploy("42", SITE, Some(256)).await,
        Err(ApiError::InsufficientCredit {
            requested_mb: 256,
            deficit: 128
        })
    ));

    let decision = ctx.state.admission_service.check("42", 128).await.unwrap();
    assert!(decision.admitted);
    assert_eq!(decision.credit_deficit, 0);
}
