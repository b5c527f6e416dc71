use std::path::PathBuf;

use recur::error::{exit_codes, Error, JsonError};

#[test]
fn exit_codes_map_correctly() {
    let user = Error::InvalidArgument("bad".to_string());
    assert_eq!(user.exit_code(), exit_codes::USER_ERROR);

    let missing = Error::NotFound("T1#2024-02-15".to_string());
    assert_eq!(missing.exit_code(), exit_codes::USER_ERROR);

    let lock = Error::LockFailed(PathBuf::from(".recur/occurrences.json.lock"));
    assert_eq!(lock.exit_code(), exit_codes::OPERATION_FAILED);

    let op = Error::OperationFailed("boom".to_string());
    assert_eq!(op.exit_code(), exit_codes::OPERATION_FAILED);
}

#[test]
fn json_error_includes_code_and_details() {
    let err = Error::InvalidTemplateId {
        id: "A#B".to_string(),
        reason: "id cannot contain '#'".to_string(),
    };
    let json = JsonError::from(&err);
    assert_eq!(json.code, exit_codes::USER_ERROR);
    assert!(json.error.contains("Invalid template id"));
    let details = json.details.expect("details");
    assert_eq!(details["template_id"], "A#B");
}

#[test]
fn disposed_store_is_not_a_user_error() {
    assert!(!Error::Disposed.is_user_error());
    assert!(Error::TemplateNotFound("T9".to_string()).is_user_error());
}
