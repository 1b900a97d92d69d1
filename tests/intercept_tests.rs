//! Exec-credential interception tests against kubeconfig files on disk


use kubelink::kubernetes::token::TOKEN_PREFIX;
use kubelink::kubernetes::{InterceptError, KubeConfigError};
use test_utils::*;

fn args(extra: &[&'static str]) -> Vec<&'static str> {
    let mut args = vec!["eks", "get-token", "--cluster-name", "demo", "--region", "us-east-1"];
    args.extend_from_slice(extra);
    args
}

#[test]
fn test_aws_plugin_detected() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&[]), &[]));

    let found = ctx.interceptor().intercept(Some("eks")).unwrap().unwrap();
    let provider = found.provider();
    assert_eq!(provider.cluster_id(), "demo");
    assert_eq!(provider.region(), "us-east-1");
    assert_eq!(provider.profile(), None);
}

#[test]
fn test_profile_flag_carried() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&["--profile", "staging"]), &[]));

    let found = ctx.interceptor().intercept(Some("eks")).unwrap().unwrap();
    assert_eq!(found.provider().profile(), Some("staging"));
}

#[test]
fn test_env_supplies_missing_parameters() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(
        &["eks", "get-token"],
        &[
            ("AWS_CLUSTER_NAME", "from-env"),
            ("AWS_REGION", "ap-southeast-2"),
            ("AWS_PROFILE", "ops"),
        ],
    ));

    let found = ctx.interceptor().intercept(Some("eks")).unwrap().unwrap();
    let provider = found.provider();
    assert_eq!(provider.cluster_id(), "from-env");
    assert_eq!(provider.region(), "ap-southeast-2");
    assert_eq!(provider.profile(), Some("ops"));
}

#[test]
fn test_current_context_used_by_default() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&[]), &[]));

    assert!(ctx.interceptor().intercept(None).unwrap().is_some());
}

#[test]
fn test_user_without_exec_is_skipped() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&[]), &[]));

    assert!(ctx.interceptor().intercept(Some("local")).unwrap().is_none());
}

#[test]
fn test_unknown_context_is_skipped() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&[]), &[]));

    assert!(ctx.interceptor().intercept(Some("nope")).unwrap().is_none());
}

#[test]
fn test_missing_kubeconfig_is_skipped() {
    let ctx = TestContext::new();

    assert!(ctx.interceptor().intercept(Some("eks")).unwrap().is_none());
}

#[test]
fn test_malformed_kubeconfig() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig("contexts: [unterminated");

    let interceptor = ctx.interceptor();
    let err = interceptor.intercept(Some("eks")).unwrap_err();
    assert!(matches!(
        err,
        InterceptError::Config(KubeConfigError::ParseError(_))
    ));
    assert!(interceptor.intercept_or_skip(Some("eks")).is_none());
}

#[test]
fn test_missing_region_reported() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&["eks", "get-token", "--cluster-name", "demo"], &[]));

    let interceptor = ctx.interceptor();
    assert!(matches!(
        interceptor.intercept(Some("eks")),
        Err(InterceptError::MissingParameter { parameter: "region", .. })
    ));
    assert!(interceptor.intercept_or_skip(Some("eks")).is_none());
}

#[tokio::test]
async fn test_override_replaces_credentials() {
    let ctx = TestContext::new();
    ctx.write_kubeconfig(&eks_kubeconfig(&args(&[]), &[]));
    let found = ctx.interceptor().intercept(Some("eks")).unwrap().unwrap();

    let mut config = base_profile();
    let provider = found.apply(&mut config);

    let auth = &config.auth_info;
    assert!(auth.username.is_none());
    assert!(auth.client_certificate.is_none());
    assert!(auth.token.is_none());

    let token = provider.get_token().await.unwrap();
    assert!(token.as_str().starts_with(TOKEN_PREFIX));
}
