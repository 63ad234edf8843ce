use std::time::Duration;

use rand::Rng;
use storefront_scheduler::{TaskError, TaskResult};
use tokio_util::sync::CancellationToken;

/// A simulated storefront backend.
///
/// Requests take between half and one and a half times the given latency, and fail at random
/// with the given probability. Cancelling the token aborts a request.
pub async fn request(
    url: String,
    latency: Duration,
    failure_rate: f64,
    token: CancellationToken,
) -> TaskResult<String> {
    let (latency, fails) = {
        let mut rng = rand::rng();
        (
            latency.mul_f64(rng.random_range(0.5..1.5)),
            rng.random_bool(failure_rate.clamp(0.0, 1.0)),
        )
    };

    tokio::select! {
        _ = tokio::time::sleep(latency) => {}
        _ = token.cancelled() => return Err(TaskError::transport("request aborted")),
    }

    if fails {
        return Err(TaskError::transport(format!("{url}: 503 Service Unavailable")));
    }
    Ok(format!("{url}: 200 OK"))
}
