//! Shared request-field validation for the `builds` resource.

use dropshot::HttpError;
use lazy_regex::regex;

/// A build's client-assigned `id` doubles as its idempotency key and is interpolated directly
/// into the container name the Builder asks the host to create (`turbine-<id>`), so it gets the
/// same bounds as any other identifier accepted from an untrusted caller:
/// * 32 > characters < 3
/// * only alphanumeric characters or underscores
pub fn identifier(id: &str) -> Result<(), HttpError> {
    let alphanumeric_w_underscores = regex!("^[a-zA-Z0-9_]*$");

    if id.len() > 32 {
        return Err(HttpError::for_bad_request(None, "'id' length cannot be greater than 32".into()));
    }

    if id.len() < 3 {
        return Err(HttpError::for_bad_request(None, "'id' length cannot be less than 3".into()));
    }

    if !alphanumeric_w_underscores.is_match(id) {
        return Err(HttpError::for_bad_request(
            None,
            "'id' can only be made up of alphanumeric and underscore characters".into(),
        ));
    }

    Ok(())
}
