use vc::error::{exit_codes, Error, JsonError};
use vc::VersionId;

#[test]
fn exit_codes_map_correctly() {
    let user = Error::UnknownBranch("b".to_string());
    assert_eq!(user.exit_code(), exit_codes::USER_ERROR);

    let invalid = Error::InvalidVersion(VersionId::new(7, "main"));
    assert_eq!(invalid.exit_code(), exit_codes::USER_ERROR);

    let blocked = Error::UncommittedChanges;
    assert_eq!(blocked.exit_code(), exit_codes::STATE_BLOCKED);

    let rejected = Error::NonFastForward("main".to_string());
    assert_eq!(rejected.exit_code(), exit_codes::STATE_BLOCKED);

    let failed = Error::LockTimeout("users".to_string());
    assert_eq!(failed.exit_code(), exit_codes::OPERATION_FAILED);
}

#[test]
fn json_error_includes_code() {
    let err = Error::BranchExists("feature".to_string());
    let json = JsonError::from(&err);
    assert_eq!(json.code, exit_codes::USER_ERROR);
    assert!(json.error.contains("feature"));
}

#[test]
fn messages_name_the_version() {
    let err = Error::InvalidVersion(VersionId::new(3, "b"));
    assert!(err.to_string().contains("(3, b)"));
}
