use std::sync::Arc;

use crate::metrics::RouterMetrics;
use crate::pipeline::InferenceRouter;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<InferenceRouter>,
    pub metrics: Arc<RouterMetrics>,
}

impl AppState {
    pub fn new(router: InferenceRouter) -> Self {
        let metrics = router.metrics().clone();
        Self {
            router: Arc::new(router),
            metrics,
        }
    }
}
