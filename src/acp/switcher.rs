use std::sync::Arc;

use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
    Router,
};
use parking_lot::Mutex;
use tower::ServiceExt;

/// Routes requests to the current policy router, which can be replaced at any time.
///
/// Each request is served by the router that was current when it arrived. The router is not
/// `Sync`, so it sits behind a mutex and every request serves its own clone.
#[derive(Clone, Default)]
pub struct HandlerSwitcher {
    router: Arc<Mutex<Router>>,
}

impl HandlerSwitcher {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(Mutex::new(router)),
        }
    }

    pub fn update_handler(&self, router: Router) {
        *self.router.lock() = router;
    }

    pub async fn serve(&self, req: Request<Body>) -> Response {
        let router = self.current();
        match router.oneshot(req).await {
            Ok(resp) => resp,
            Err(infallible) => match infallible {},
        }
    }

    fn current(&self) -> Router {
        self.router.lock().clone()
    }

    /// A router forwarding every request to the switcher.
    pub fn into_router(self) -> Router {
        Router::new().fallback(move |req: Request<Body>| {
            let switcher = self.clone();
            async move { switcher.serve(req).await.into_response() }
        })
    }
}
