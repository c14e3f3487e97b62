use quasar_common::EndpointId;
use quasar_meta::StateStore;

use crate::error::RouteError;

/// Checks `token` against the one stored for the endpoint identity.
///
/// A call without a token is rejected before the store is consulted.
pub async fn authorize(
    store: &dyn StateStore,
    endpoint: &EndpointId,
    endpoint_name: &str,
    model_name: &str,
    token: Option<&str>,
) -> Result<(), RouteError> {
    let Some(token) = token else {
        return Err(RouteError::Unauthorized);
    };
    let stored = store
        .get_endpoint_token(endpoint, endpoint_name, model_name)
        .await
        .map_err(RouteError::store)?;
    match stored {
        Some(expected) if expected == token => Ok(()),
        _ => Err(RouteError::Unauthorized),
    }
}
