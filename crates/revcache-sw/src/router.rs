//! Ordered routing of fetch events to strategies.
//!
//! Routes are evaluated in registration order and the first whose
//! predicate matches handles the request, so overlapping predicates resolve
//! by position. Requests no route claims go to the default handler.

use std::sync::Arc;

use revcache_net::{FetchResponse, RequestDestination};
use tracing::{debug, trace};

use crate::strategy::{FetchEvent, Strategy};

/// Decides whether a route applies to a request.
pub type RoutePredicate = Box<dyn Fn(&FetchEvent) -> bool + Send + Sync>;

/// A predicate paired with the strategy that serves what it matches.
pub struct Route {
    /// Name used in logs.
    pub name: String,
    predicate: RoutePredicate,
    strategy: Arc<dyn Strategy>,
}

impl Route {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&FetchEvent) -> bool + Send + Sync + 'static,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            strategy,
        }
    }

    /// Match requests by destination.
    pub fn for_destination(
        name: impl Into<String>,
        destination: RequestDestination,
        strategy: Arc<dyn Strategy>,
    ) -> Self {
        Self::new(name, move |e: &FetchEvent| e.destination() == destination, strategy)
    }

    pub fn matches(&self, event: &FetchEvent) -> bool {
        (self.predicate)(event)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("name", &self.name)
            .field("cache", &self.strategy.cache_name())
            .finish()
    }
}

/// First-match router.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    default_handler: Option<Arc<dyn Strategy>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a route after every route registered so far.
    pub fn register(&mut self, route: Route) {
        debug!(route = %route.name, position = self.routes.len(), "Route registered");
        self.routes.push(route);
    }

    /// Handler for requests no route matches.
    pub fn set_default_handler(&mut self, strategy: Arc<dyn Strategy>) {
        self.default_handler = Some(strategy);
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Name of the route that would handle the event, if any.
    pub fn find(&self, event: &FetchEvent) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(event))
    }

    /// Handle a fetch event. A strategy error becomes a network-error
    /// response; it is never returned to the caller.
    pub async fn handle(&self, event: &FetchEvent) -> FetchResponse {
        let (name, strategy) = match self.find(event) {
            Some(route) => (route.name.as_str(), &route.strategy),
            None => match &self.default_handler {
                Some(strategy) => ("default", strategy),
                None => {
                    trace!(url = %event.url(), "No route");
                    return FetchResponse::network_error();
                }
            },
        };

        trace!(url = %event.url(), route = name, "Routing request");
        match strategy.handle(event).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %event.url(), route = name, error = %e, "Strategy failed");
                FetchResponse::network_error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use revcache_net::Request;

    use super::*;
    use crate::error::{SwError, SwResult};

    struct Fixed(u16);

    #[async_trait]
    impl Strategy for Fixed {
        async fn handle(&self, _event: &FetchEvent) -> SwResult<FetchResponse> {
            Ok(FetchResponse::new("", self.0, ""))
        }
    }

    struct Failing;

    #[async_trait]
    impl Strategy for Failing {
        async fn handle(&self, _event: &FetchEvent) -> SwResult<FetchResponse> {
            Err(SwError::State("broken".to_string()))
        }
    }

    fn image(url: &str) -> FetchEvent {
        FetchEvent::new(
            Request::parse(url)
                .unwrap()
                .destination(RequestDestination::Image),
        )
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let mut router = Router::new();
        router.register(Route::new(
            "manifest",
            |e: &FetchEvent| e.url().path().ends_with("a.png"),
            Arc::new(Fixed(201)),
        ));
        router.register(Route::for_destination(
            "images",
            RequestDestination::Image,
            Arc::new(Fixed(202)),
        ));

        // Both predicates match; the earlier route handles it.
        let response = router.handle(&image("https://example.com/a.png")).await;
        assert_eq!(response.status, 201);

        let response = router.handle(&image("https://cdn.example.net/b.png")).await;
        assert_eq!(response.status, 202);
    }

    #[tokio::test]
    async fn test_default_handler() {
        let mut router = Router::new();
        let event = FetchEvent::new(Request::parse("https://example.com/x").unwrap());
        assert!(router.handle(&event).await.is_network_error());

        router.set_default_handler(Arc::new(Fixed(204)));
        assert_eq!(router.handle(&event).await.status, 204);
    }

    #[tokio::test]
    async fn test_strategy_error_becomes_network_error() {
        let mut router = Router::new();
        router.register(Route::for_destination(
            "images",
            RequestDestination::Image,
            Arc::new(Failing),
        ));
        let response = router.handle(&image("https://example.com/a.png")).await;
        assert!(response.is_network_error());
    }
}
