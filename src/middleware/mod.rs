pub mod ip_filter;

pub use ip_filter::IpFilter;

use axum::Router;

/// A request-scoped middleware, expressed as a wrapping step over the router.
pub type Middleware = Box<dyn FnOnce(Router) -> Router + Send>;

/// Apply middlewares so the first one sees the request first and the
/// response last: `chain(h, [m1, m2])` behaves as `m1(m2(h))` regardless of
/// how the layers are stacked internally.
pub fn chain(handler: Router, middlewares: Vec<Middleware>) -> Router {
    middlewares
        .into_iter()
        .rev()
        .fold(handler, |router, middleware| middleware(router))
}
