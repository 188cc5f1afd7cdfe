use pgprovider::client::version::{Feature, ServerVersion};
use pgprovider::error::ProviderError;

#[test]
fn test_parse_pre_10_version() {
    assert_eq!(ServerVersion::parse("9.6.3").unwrap().number(), 90603);
    assert_eq!(ServerVersion::parse("9.4").unwrap().number(), 90400);
}

#[test]
fn test_parse_modern_version() {
    assert_eq!(ServerVersion::parse("15.4").unwrap().number(), 150004);
    assert_eq!(ServerVersion::parse("16").unwrap().number(), 160000);
    assert_eq!(ServerVersion::parse(" 13.2 (Debian 13.2-1)").unwrap().number(), 130002);
}

#[test]
fn test_parse_rejects_garbage() {
    assert!(ServerVersion::parse("latest").is_err());
    assert!(ServerVersion::parse("").is_err());
    assert!(ServerVersion::parse("0.9").is_err());
}

#[test]
fn test_parse_rejects_out_of_range_numbers() {
    assert!(ServerVersion::parse("300000.1").is_err());
    assert!(ServerVersion::parse("9.99999999.1").is_err());
    assert!(ServerVersion::parse("99999999999").is_err());
}

#[test]
fn test_display_matches_version_scheme() {
    assert_eq!(ServerVersion::new(90603).to_string(), "9.6.3");
    assert_eq!(ServerVersion::new(150004).to_string(), "15.4");
}

#[test]
fn test_feature_gates() {
    let v96 = ServerVersion::new(90603);
    assert!(v96.supports(Feature::Extension));
    assert!(v96.supports(Feature::DatabaseAllowConnections));
    assert!(!v96.supports(Feature::Publication));
    assert!(!v96.supports(Feature::Procedure));

    let v13 = ServerVersion::new(130000);
    assert!(v13.supports(Feature::ForceDropDatabase));
    assert!(v13.supports(Feature::PublishViaPartitionRoot));
    assert!(!v13.supports(Feature::SecurityInvokerViews));
}

#[test]
fn test_require_names_feature_and_version() {
    let err = ServerVersion::new(90603)
        .require(Feature::Publication)
        .unwrap_err();
    assert!(matches!(
        err,
        ProviderError::UnsupportedFeature {
            feature: Feature::Publication,
            ..
        }
    ));
    assert_eq!(err.to_string(), "publications is not supported by PostgreSQL 9.6.3");
}
